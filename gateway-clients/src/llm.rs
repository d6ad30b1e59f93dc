//! LLM invocation client (§4.6).
//!
//! Contract: the LLM returns JSON only, matching the Answer schema. The
//! HTTP implementation retries a bounded number of times with jittered
//! backoff; any non-2xx, timeout, or JSON-decode failure after retries
//! are exhausted is surfaced as a [`ClientError`] so the caller can
//! escalate to the templater rather than treating it as a distinct
//! failure class.

use async_trait::async_trait;
use gateway_spec::PromptEnvelope;
use std::time::Duration;

use crate::error::ClientError;

/// An LLM completion backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send the canonical prompt envelope and return the raw decoded
    /// JSON object the model produced. The caller (the validator) is
    /// responsible for checking it against the Answer contract.
    async fn complete(&self, envelope: &PromptEnvelope) -> Result<serde_json::Value, ClientError>;
}

/// Always-disabled backend, selected by `OPENAI_DISABLED=1`. Skips the
/// network call entirely.
pub struct DisabledLlmClient;

#[async_trait]
impl LlmClient for DisabledLlmClient {
    async fn complete(&self, _envelope: &PromptEnvelope) -> Result<serde_json::Value, ClientError> {
        Err(ClientError::Disabled)
    }
}

/// OpenAI-compatible chat-completions backend.
pub struct OpenAiLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_retries: u32,
}

impl OpenAiLlmClient {
    /// Build a client against `base_url` (e.g. `https://api.openai.com/v1`).
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            max_retries,
        }
    }

    fn backoff(attempt: u32) -> Duration {
        let base_ms = 100u64 * 2u64.pow(attempt.min(4));
        let jitter_ms = (base_ms / 2).max(1);
        Duration::from_millis(base_ms + attempt as u64 % jitter_ms)
    }

    async fn attempt_once(&self, envelope: &PromptEnvelope) -> Result<serde_json::Value, ClientError> {
        let mut req = self.http.post(format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        ));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let body = serde_json::json!({
            "model": self.model,
            "response_format": {"type": "json_object"},
            "max_tokens": envelope.constraints.max_tokens,
            "messages": [
                {"role": "system", "content": "Respond with a single JSON object matching the Why-Decision answer contract. JSON only, no prose."},
                {"role": "user", "content": serde_json::to_string(envelope).map_err(ClientError::from)?},
            ],
        });
        let resp = req.json(&body).send().await?.error_for_status().map_err(ClientError::from)?;
        let decoded: serde_json::Value = resp.json().await?;
        let content = decoded
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| ClientError::Decode("missing choices[0].message.content".to_string()))?;
        serde_json::from_str(content).map_err(ClientError::from)
    }
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    async fn complete(&self, envelope: &PromptEnvelope) -> Result<serde_json::Value, ClientError> {
        let mut last_err = ClientError::Http("no attempts made".to_string());
        for attempt in 0..=self.max_retries {
            match self.attempt_once(envelope).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = e;
                    if attempt < self.max_retries {
                        tokio::time::sleep(Self::backoff(attempt)).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}
