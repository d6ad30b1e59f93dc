//! Request-building and signature-verification logic for the gateway
//! command-line client, kept separate from `main.rs` so it can be
//! exercised by tests without spinning up a process.
#![deny(missing_docs)]

use base64::Engine as _;
use ed25519_dalek::{Signature as EdSignature, Verifier as _, VerifyingKey};
use gateway_spec::{canonical_bytes, sha256_hex, Response, Signature};

/// Build the JSON body for `POST /v2/ask`.
#[must_use]
pub fn build_ask_body(
    anchor_id: Option<&str>,
    decision_ref: Option<&str>,
    question: &str,
) -> serde_json::Value {
    serde_json::json!({
        "anchor_id": anchor_id,
        "decision_ref": decision_ref,
        "question": question,
    })
}

/// Build the JSON body for `POST /v2/query`.
#[must_use]
pub fn build_query_body(text: &str) -> serde_json::Value {
    serde_json::json!({"text": text})
}

/// Verify a serialized `response.json` artefact's signature against a
/// base64-encoded 32-byte Ed25519 public key, returning the signature
/// block on success.
///
/// The covered digest is recomputed from the response body itself
/// (`meta.bundle_fp` and `meta.signature` stripped back to `None`, same
/// as `assemble_and_sign` produced it) rather than trusted from the
/// self-reported `signature.covered` field, so a tampered body is
/// caught even if its signature block was left untouched.
///
/// # Errors
/// Returns an error if `raw` does not decode as a [`Response`], carries
/// no signature, the recomputed digest doesn't match `signature.covered`
/// or `meta.bundle_fp`, the public key or signature bytes are malformed,
/// or the signature does not verify against the recomputed digest.
pub fn verify_response_str(raw: &str, public_key_b64: &str) -> anyhow::Result<Signature> {
    let mut response: Response =
        serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("not a valid response.json artefact: {e}"))?;
    let signature = response
        .meta
        .signature
        .clone()
        .ok_or_else(|| anyhow::anyhow!("response carries no signature block"))?;
    let bundle_fp = response
        .meta
        .bundle_fp
        .clone()
        .ok_or_else(|| anyhow::anyhow!("response carries no bundle_fp"))?;

    response.meta.bundle_fp = None;
    response.meta.signature = None;
    let value = serde_json::to_value(&response)?;
    let covered = sha256_hex(&canonical_bytes(&value));

    if covered != signature.covered {
        anyhow::bail!("recomputed digest does not match signature.covered; body was tampered with");
    }
    if bundle_fp != format!("sha256:{covered}") {
        anyhow::bail!("recomputed digest does not match meta.bundle_fp; body was tampered with");
    }

    let key_bytes = base64::engine::general_purpose::STANDARD.decode(public_key_b64)?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must decode to exactly 32 bytes"))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)?;

    let sig_bytes = base64::engine::general_purpose::STANDARD.decode(&signature.sig)?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("signature must decode to exactly 64 bytes"))?;
    let sig = EdSignature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(covered.as_bytes(), &sig)
        .map_err(|_| anyhow::anyhow!("signature does not verify against the given public key"))?;

    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer as _, SigningKey};
    use gateway_spec::{
        Anchor, Answer, CompletenessFlags, EvidenceBundle, Meta, Transitions,
    };

    fn sample_response(signing_key: &SigningKey) -> Response {
        let evidence = EvidenceBundle {
            anchor: Anchor {
                id: "anchor:1".into(),
                title: Some("t".into()),
                option: None,
                rationale: None,
                timestamp: "2024-01-01T00:00:00Z".into(),
                tags: vec![],
                supported_by: vec![],
                based_on: vec![],
                transitions: vec![],
            },
            events: vec![],
            transitions: Transitions::default(),
            allowed_ids: vec!["anchor:1".into()],
            snapshot_etag: "etag-1".into(),
        };
        let mut response = Response {
            intent: "why_decision".into(),
            evidence,
            answer: Answer {
                short_answer: "because".into(),
                supporting_ids: vec!["anchor:1".into()],
            },
            completeness_flags: CompletenessFlags::default(),
            meta: Meta::default(),
        };
        let value = serde_json::to_value(&response).unwrap();
        let covered = gateway_spec::sha256_hex(&gateway_spec::canonical_bytes(&value));
        let sig = signing_key.sign(covered.as_bytes());
        response.meta.bundle_fp = Some(format!("sha256:{covered}"));
        response.meta.signature = Some(Signature {
            alg: "ed25519".into(),
            key_id: "test/k1".into(),
            sig: base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
            covered,
            signed_at: "2024-01-01T00:00:00Z".into(),
        });
        response
    }

    #[test]
    fn verifies_a_well_formed_artefact() {
        let signing_key = SigningKey::from_bytes(&[9u8; 32]);
        let response = sample_response(&signing_key);
        let raw = serde_json::to_string(&response).unwrap();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());
        let sig = verify_response_str(&raw, &public_key_b64).unwrap();
        assert_eq!(sig.key_id, "test/k1");
    }

    #[test]
    fn rejects_a_tampered_artefact() {
        let signing_key = SigningKey::from_bytes(&[9u8; 32]);
        let mut response = sample_response(&signing_key);
        response.answer.short_answer = "tampered".into();
        let raw = serde_json::to_string(&response).unwrap();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());
        assert!(verify_response_str(&raw, &public_key_b64).is_err());
    }

    #[test]
    fn rejects_an_unsigned_response() {
        let response = Response {
            intent: "why_decision".into(),
            evidence: EvidenceBundle {
                anchor: Anchor {
                    id: "anchor:1".into(),
                    title: None,
                    option: None,
                    rationale: None,
                    timestamp: "2024-01-01T00:00:00Z".into(),
                    tags: vec![],
                    supported_by: vec![],
                    based_on: vec![],
                    transitions: vec![],
                },
                events: vec![],
                transitions: Transitions::default(),
                allowed_ids: vec![],
                snapshot_etag: "etag-1".into(),
            },
            answer: Answer {
                short_answer: "x".into(),
                supporting_ids: vec![],
            },
            completeness_flags: CompletenessFlags::default(),
            meta: Meta::default(),
        };
        let raw = serde_json::to_string(&response).unwrap();
        assert!(verify_response_str(&raw, "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_err());
    }
}
