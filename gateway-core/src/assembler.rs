//! Response Assembler + Signing (§4.8): fill in `meta`, compute the
//! `bundle_fp` signing digest, and attach the detached Ed25519
//! signature.
//!
//! The digest covers the full response with `meta.bundle_fp` and
//! `meta.signature` both absent (they're `None` at digest time, and
//! `#[serde(skip_serializing_if)]` drops them from the canonical form
//! entirely), so there is no chicken-and-egg dependency on the
//! signature's own bytes.

use chrono::{SecondsFormat, Utc};
use gateway_spec::{
    canonical_bytes, fingerprint, sha256_hex, Answer, CompletenessFlags, EvidenceBundle,
    FallbackReason, Meta, RepairCode, Response,
};

use crate::signer::Signer;

/// Everything the assembler needs from the upstream pipeline stages. One
/// struct rather than a dozen positional arguments, since every field
/// maps straight onto a `Meta` field.
#[derive(Debug, Clone)]
pub struct AssemblyInput {
    /// Request id, used as the artefact-persistence prefix.
    pub request_id: String,
    /// Request intent, e.g. `"why_decision"`.
    pub intent: String,
    /// The final (post-selection, post-policy) evidence bundle.
    pub evidence: EvidenceBundle,
    /// The validated (or templated) answer.
    pub answer: Answer,
    /// Counts and flags recomputed from `evidence`.
    pub completeness_flags: CompletenessFlags,
    /// Fingerprint of the rendered prompt envelope.
    pub prompt_fp: String,
    /// Fingerprint of the policy decision, when one was made.
    pub policy_fp: Option<String>,
    /// Estimated tokens of the rendered prompt.
    pub prompt_tokens: u32,
    /// Completion token ceiling enforced for this request.
    pub max_prompt_tokens: u32,
    /// Ids dropped by the selector to fit the budget.
    pub dropped_evidence_ids: Vec<String>,
    /// Whether the selector had to drop any evidence.
    pub selector_truncation: bool,
    /// Neighbor count before selection.
    pub total_neighbors_found: usize,
    /// Evidence count after selection.
    pub final_evidence_count: usize,
    /// Total attempts made by the evidence builder's retry policy.
    pub retries: u32,
    /// Whether the templater fallback was used instead of (or after)
    /// the LLM.
    pub fallback_used: bool,
    /// Populated iff `fallback_used`.
    pub fallback_reason: Option<FallbackReason>,
    /// Structured repair codes emitted by the validator.
    pub repair_codes: Vec<RepairCode>,
    /// Wall-clock request latency in milliseconds.
    pub latency_ms: u64,
    /// `true` iff the gateway was load-shedding when this request ran.
    pub load_shed: bool,
}

/// Build and sign the final [`Response`].
#[must_use]
pub fn assemble_and_sign(input: AssemblyInput, signer: &Signer, gateway_version: Option<String>) -> Response {
    let allowed_ids_fp = fingerprint(&input.evidence.allowed_ids);

    let meta = Meta {
        request_id: input.request_id,
        prompt_fp: Some(input.prompt_fp),
        bundle_fp: None,
        snapshot_etag: input.evidence.snapshot_etag.clone(),
        policy_fp: input.policy_fp,
        allowed_ids_fp: Some(allowed_ids_fp),
        prompt_tokens: input.prompt_tokens,
        max_prompt_tokens: input.max_prompt_tokens,
        dropped_evidence_ids: input.dropped_evidence_ids,
        selector_truncation: input.selector_truncation,
        total_neighbors_found: input.total_neighbors_found,
        final_evidence_count: input.final_evidence_count,
        retries: input.retries,
        fallback_used: input.fallback_used,
        fallback_reason: input.fallback_reason,
        repair_codes: input.repair_codes,
        latency_ms: input.latency_ms,
        gateway_version,
        signature: None,
        load_shed: input.load_shed,
    };

    let mut response = Response {
        intent: input.intent,
        evidence: input.evidence,
        answer: input.answer,
        completeness_flags: input.completeness_flags,
        meta,
    };

    let value = serde_json::to_value(&response).expect("Response always serializes");
    let covered = sha256_hex(&canonical_bytes(&value));
    let signed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let signature = signer.sign_covered(&covered, signed_at);

    response.meta.bundle_fp = Some(format!("sha256:{covered}"));
    response.meta.signature = Some(signature);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use base64::Engine as _;
    use gateway_spec::{Anchor, Transitions};

    fn signer() -> Signer {
        let mut cfg = Config::from_env().expect("defaults parse");
        cfg.ed25519_priv_b64 = Some(base64::engine::general_purpose::STANDARD.encode([3u8; 32]));
        Signer::from_config(&cfg).unwrap()
    }

    fn input() -> AssemblyInput {
        AssemblyInput {
            request_id: "req-1".into(),
            intent: "why_decision".into(),
            evidence: EvidenceBundle {
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
            },
            answer: Answer {
                short_answer: "because".into(),
                supporting_ids: vec!["anchor:1".into()],
            },
            completeness_flags: CompletenessFlags::default(),
            prompt_fp: "sha256:prompt".into(),
            policy_fp: Some("sha256:policy".into()),
            prompt_tokens: 10,
            max_prompt_tokens: 200,
            dropped_evidence_ids: vec![],
            selector_truncation: false,
            total_neighbors_found: 0,
            final_evidence_count: 1,
            retries: 0,
            fallback_used: false,
            fallback_reason: None,
            repair_codes: vec![],
            latency_ms: 5,
            load_shed: false,
        }
    }

    #[test]
    fn signature_verifies_against_covered_digest() {
        let signer = signer();
        let response = assemble_and_sign(input(), &signer, Some("v1".into()));
        let signature = response.meta.signature.clone().unwrap();
        assert!(crate::signer::verify(&signature, &signer.verifying_key_bytes()));
        assert_eq!(response.meta.bundle_fp.as_deref(), Some(format!("sha256:{}", signature.covered).as_str()));
    }

    #[test]
    fn bundle_fp_excludes_itself_and_signature_from_the_digest() {
        let signer = signer();
        let a = assemble_and_sign(input(), &signer, None);
        let b = assemble_and_sign(input(), &signer, None);
        // Same logical input, different signed_at/signature bytes, but
        // the covered digest (derived from content excluding those
        // fields) must still be identical.
        assert_eq!(a.meta.bundle_fp, b.meta.bundle_fp);
    }
}
