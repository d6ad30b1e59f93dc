//! Stable error taxonomy (§7) shared by every pipeline stage.

use thiserror::Error;

/// The gateway's stable-code error taxonomy.
///
/// Every variant carries a `&'static str` code used in structured logs,
/// `validator_report.json`, and the HTTP error body; `http_status`
/// returns the status the edge (axum) layer should respond with.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The policy service returned `DENY`.
    #[error("policy denied this request")]
    PolicyDeny,
    /// The policy service was unreachable and `POLICY_FAIL_OPEN=false`.
    #[error("policy service error: {0}")]
    PolicyError(String),
    /// The answer could not be repaired into a contract-compliant shape.
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    /// A downstream response violated an invariant the gateway cannot
    /// recover from by repair (distinct from a repairable validation
    /// failure; reserved for malformed upstream contracts).
    #[error("contract violation: {0}")]
    ContractViolation(String),
    /// An outbound call exceeded its deadline.
    #[error("{stage} stage timeout")]
    UpstreamTimeout {
        /// Which stage timed out, e.g. `"search"`, `"enrich"`.
        stage: &'static str,
    },
    /// An outbound call failed for a reason other than a timeout.
    #[error("upstream error: {0}")]
    UpstreamError(String),
    /// The signature block is missing from a response that requires one.
    #[error("bundle signature missing")]
    BundleSignatureMissing,
    /// The object store is unreachable.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// An object-store call exceeded its deadline.
    #[error("storage timeout")]
    StorageTimeout,
    /// The cache is unreachable. Never fatal on its own — callers degrade
    /// to a cache miss and continue.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    /// No other variant applies; a bug or an unrecoverable invariant
    /// break (including a missing or misconfigured signing key).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The stable string code surfaced in logs and HTTP bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::PolicyDeny => "POLICY_DENY",
            GatewayError::PolicyError(_) => "POLICY_ERROR",
            GatewayError::ValidationFailed(_) => "VALIDATION_FAILED",
            GatewayError::ContractViolation(_) => "CONTRACT_VIOLATION",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamError(_) => "UPSTREAM_ERROR",
            GatewayError::BundleSignatureMissing => "BUNDLE_SIGNATURE_MISSING",
            GatewayError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            GatewayError::StorageTimeout => "STORAGE_TIMEOUT",
            GatewayError::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    /// The HTTP status the edge layer should respond with.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::PolicyDeny => 403,
            GatewayError::PolicyError(_) => 502,
            GatewayError::ValidationFailed(_) | GatewayError::ContractViolation(_) => 422,
            GatewayError::UpstreamTimeout { .. } => 504,
            GatewayError::UpstreamError(_) => 502,
            GatewayError::BundleSignatureMissing | GatewayError::Internal(_) => 500,
            GatewayError::StorageUnavailable(_) => 503,
            GatewayError::StorageTimeout => 504,
            GatewayError::CacheUnavailable(_) => 503,
        }
    }

    /// `true` when artefact-persistence failures of this kind should
    /// fail the request (only under `ARTIFACT_STRICT=1`).
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            GatewayError::StorageUnavailable(_) | GatewayError::StorageTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::PolicyDeny.code(), "POLICY_DENY");
        assert_eq!(
            GatewayError::UpstreamTimeout { stage: "search" }.code(),
            "UPSTREAM_TIMEOUT"
        );
        assert_eq!(GatewayError::CacheUnavailable("x".into()).http_status(), 503);
    }
}
