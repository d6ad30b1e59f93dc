//! Ed25519 signer selection (§4.8, §7).
//!
//! Resolved precisely from the source system's signing module: a signer
//! is used only when `GATEWAY_ED25519_PRIV_B64` decodes to exactly 32
//! bytes. Any other condition — missing, wrong length, undecodable
//! base64 — raises `no_signer_configured` as a fatal `500 INTERNAL`.
//! There is no silent unsigned response and no algorithm negotiation.

use base64::Engine as _;
use ed25519_dalek::{Signer as _, SigningKey};

use crate::config::Config;
use crate::error::GatewayError;
use gateway_spec::Signature;

/// A configured Ed25519 signer.
pub struct Signer {
    signing_key: SigningKey,
    key_id: String,
}

impl Signer {
    /// Select a signer from configuration, failing closed.
    ///
    /// # Errors
    /// Returns `GatewayError::Internal("no_signer_configured")` when no
    /// valid 32-byte seed is configured, and propagates a malformed-seed
    /// `ConfigError` the same way (both are fatal startup conditions).
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let seed = config
            .signing_seed()
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or_else(|| GatewayError::Internal("no_signer_configured".to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
            key_id: config.sign_key_id.clone(),
        })
    }

    /// Sign the `covered` hex digest (its UTF-8 bytes, not the decoded
    /// bytes and not the `sha256:`-prefixed form) and build the full
    /// [`Signature`] block.
    #[must_use]
    pub fn sign_covered(&self, covered_hex: &str, signed_at: String) -> Signature {
        let sig = self.signing_key.sign(covered_hex.as_bytes());
        Signature {
            alg: "ed25519".to_string(),
            key_id: self.key_id.clone(),
            sig: base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
            covered: covered_hex.to_string(),
            signed_at,
        }
    }

    /// The public key, for verification by downstream consumers of the
    /// audit trail.
    #[must_use]
    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

/// Verify a [`Signature`] against a known public key. Used by tests and
/// by `gateway-cli` when inspecting a persisted `response.json`.
#[must_use]
pub fn verify(signature: &Signature, public_key: &[u8; 32]) -> bool {
    let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = base64::engine::general_purpose::STANDARD.decode(&signature.sig) else {
        return false;
    };
    let Ok(sig_bytes): Result<[u8; 64], _> = sig_bytes.try_into() else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    vk.verify_strict(signature.covered.as_bytes(), &sig).is_ok()
}
