//! Policy-decision service client (§4.3, §6).

use async_trait::async_trait;
use gateway_spec::{PolicyDecision, PolicyInput, PolicyResult};

use crate::error::ClientError;

/// The OPA-compatible policy decision service.
#[async_trait]
pub trait PolicyClient: Send + Sync {
    /// `POST {opa_url}{decision_path}` with the canonical policy input
    /// envelope, returning the decision payload.
    async fn decide(&self, input: &PolicyInput) -> Result<PolicyDecision, ClientError>;
}

/// `reqwest`-backed [`PolicyClient`].
pub struct HttpPolicyClient {
    http: reqwest::Client,
    decision_url: String,
}

impl HttpPolicyClient {
    /// Build a client posting to `{base_url}{decision_path}`.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: &str, decision_path: &str) -> Self {
        Self {
            http,
            decision_url: format!("{}{decision_path}", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl PolicyClient for HttpPolicyClient {
    async fn decide(&self, input: &PolicyInput) -> Result<PolicyDecision, ClientError> {
        let resp = self
            .http
            .post(&self.decision_url)
            .json(input)
            .send()
            .await?
            .error_for_status()
            .map_err(ClientError::from)?;
        let decoded: PolicyResult = resp.json().await?;
        Ok(decoded.result)
    }
}
