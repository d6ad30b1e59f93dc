//! LLM Invocation (§4.6): call the configured backend, classify any
//! failure into the fallback reason the templater needs.

use std::time::Duration;

use gateway_clients::{ClientError, LlmClient};
use gateway_spec::{FallbackReason, PromptEnvelope};

/// Either a decoded (not yet validated) answer object, or the reason the
/// templater fallback must run instead.
#[derive(Debug, Clone)]
pub struct LlmOutcome {
    /// Raw JSON the model returned, present iff `fallback_reason` is
    /// `None`. Still unvalidated — the validator/repair stage checks it
    /// against the `Answer` contract.
    pub answer_json: Option<serde_json::Value>,
    /// Set when the templater must run instead of (or after) the LLM.
    pub fallback_reason: Option<FallbackReason>,
}

impl LlmOutcome {
    fn fallback(reason: FallbackReason) -> Self {
        Self {
            answer_json: None,
            fallback_reason: Some(reason),
        }
    }
}

/// Invoke `llm` with `envelope`, enforcing `timeout` independently of
/// whatever retry policy the client itself applies.
///
/// Never returns an `Err` — every failure mode (disabled client,
/// exhausted retries, decode failure, stage timeout) maps to a
/// [`FallbackReason`] so the pipeline can escalate to the templater
/// uniformly.
pub async fn invoke_llm(llm: &dyn LlmClient, envelope: &PromptEnvelope, timeout: Duration) -> LlmOutcome {
    match tokio::time::timeout(timeout, llm.complete(envelope)).await {
        Ok(Ok(value)) => LlmOutcome {
            answer_json: Some(value),
            fallback_reason: None,
        },
        Ok(Err(ClientError::Disabled)) => LlmOutcome::fallback(FallbackReason::LlmOff),
        Ok(Err(e)) => {
            tracing::warn!(event = "llm_call_failed", error = %e, "llm invocation failed, falling back to templater");
            LlmOutcome::fallback(FallbackReason::LlmError)
        }
        Err(_elapsed) => {
            tracing::warn!(event = "llm_call_timeout", "llm invocation exceeded stage timeout");
            LlmOutcome::fallback(FallbackReason::Timeout)
        }
    }
}
