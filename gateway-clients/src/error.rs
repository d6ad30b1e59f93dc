//! Errors surfaced by outbound clients. Deliberately smaller than
//! [`gateway_core::error::GatewayError`] — clients only know "timeout",
//! "http failure", or "couldn't decode the response"; mapping that to a
//! stable gateway-level code is the caller's job.

use thiserror::Error;

/// An error from an outbound HTTP, cache, or object-store call.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The call did not complete within its caller-imposed deadline.
    #[error("timed out")]
    Timeout,
    /// A non-2xx HTTP response, or a transport-level failure.
    #[error("http error: {0}")]
    Http(String),
    /// The response body could not be decoded into the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
    /// The LLM client is in disabled mode and skipped the call.
    #[error("llm disabled")]
    Disabled,
    /// A filesystem or object-store I/O failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode(e.to_string())
    }
}
