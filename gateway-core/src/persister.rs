//! Artefact Persister (§4.10): write the fixed seven-artefact audit
//! record set "all or none", mirroring the teacher's
//! write-temp-then-atomic-rename discipline for persisted metadata.

use gateway_clients::ObjectStore;
use gateway_spec::{EvidenceBundle, PromptEnvelope, Response};

use crate::config::Config;
use crate::error::GatewayError;

/// The fixed set of audit artefacts persisted once per request.
#[derive(Debug, Clone)]
pub struct Artefacts {
    /// The rendered prompt envelope sent to the LLM (or templater).
    pub envelope: Vec<u8>,
    /// The two-message rendering (system + user turn) as plain text.
    pub rendered_prompt: Vec<u8>,
    /// The raw JSON returned by the LLM, or the templater's rendered
    /// answer when the LLM was skipped or failed.
    pub llm_raw: Vec<u8>,
    /// Repair codes and fallback bookkeeping from the validator.
    pub validator_report: Vec<u8>,
    /// The final signed response.
    pub response: Vec<u8>,
    /// The evidence bundle before selection/policy filtering.
    pub evidence_pre: Vec<u8>,
    /// The evidence bundle after selection/policy filtering.
    pub evidence_post: Vec<u8>,
}

impl Artefacts {
    /// Serialize every artefact from the pipeline values that produced
    /// it. `llm_raw`/`validator_report` are already-assembled JSON
    /// values since their shape depends on which path (LLM or
    /// templater) the request took.
    #[must_use]
    pub fn build(
        envelope: &PromptEnvelope,
        rendered_prompt: &str,
        llm_raw: &serde_json::Value,
        validator_report: &serde_json::Value,
        response: &Response,
        evidence_pre: &EvidenceBundle,
        evidence_post: &EvidenceBundle,
    ) -> Self {
        Self {
            envelope: serde_json::to_vec_pretty(envelope).unwrap_or_default(),
            rendered_prompt: rendered_prompt.as_bytes().to_vec(),
            llm_raw: serde_json::to_vec_pretty(llm_raw).unwrap_or_default(),
            validator_report: serde_json::to_vec_pretty(validator_report).unwrap_or_default(),
            response: serde_json::to_vec_pretty(response).unwrap_or_default(),
            evidence_pre: serde_json::to_vec_pretty(evidence_pre).unwrap_or_default(),
            evidence_post: serde_json::to_vec_pretty(evidence_post).unwrap_or_default(),
        }
    }

    fn entries(&self) -> [(&'static str, &[u8]); 7] {
        [
            ("envelope.json", self.envelope.as_slice()),
            ("rendered_prompt.txt", self.rendered_prompt.as_slice()),
            ("llm_raw.json", self.llm_raw.as_slice()),
            ("validator_report.json", self.validator_report.as_slice()),
            ("response.json", self.response.as_slice()),
            ("evidence_pre.json", self.evidence_pre.as_slice()),
            ("evidence_post.json", self.evidence_post.as_slice()),
        ]
    }
}

/// Persist every artefact in `artefacts` under `request_id`.
///
/// A no-op when `DISABLE_ARTEFACT_WRITES=1`. On any write failure the
/// whole set is treated as incomplete: by default this is logged and
/// swallowed (the response still returns), but under `ARTIFACT_STRICT=1`
/// the request itself fails with `STORAGE_UNAVAILABLE`.
///
/// # Errors
/// `GatewayError::StorageUnavailable` when any artefact failed to write
/// and `config.artifact_strict` is set.
pub async fn persist_artefacts(
    store: &dyn ObjectStore,
    config: &Config,
    request_id: &str,
    artefacts: &Artefacts,
) -> Result<(), GatewayError> {
    if config.disable_artefact_writes {
        return Ok(());
    }

    let mut failures = Vec::new();
    for (name, bytes) in artefacts.entries() {
        if let Err(e) = store.put(request_id, name, bytes).await {
            tracing::warn!(event = "artefact_write_failed", artefact = name, error = %e, "failed to persist artefact");
            failures.push(format!("{name}: {e}"));
        }
    }

    if failures.is_empty() {
        return Ok(());
    }

    if config.artifact_strict {
        return Err(GatewayError::StorageUnavailable(failures.join("; ")));
    }

    tracing::warn!(
        event = "artefact_set_discarded",
        count = failures.len(),
        "artefact set incomplete, discarding (ARTIFACT_STRICT unset)"
    );
    Ok(())
}
