//! Process-scope configuration, populated from environment variables.
//!
//! Kept as a single struct with a manual `from_env` parser rather than a
//! config-framework dependency, matching the teacher's own preference for
//! `clap(env = ...)` fields over a generic config crate. Every field has a
//! documented default; every numeric field surfaces a clear parse error at
//! startup instead of silently defaulting.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// A malformed or missing required environment variable.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A `_MS`/`_BYTES`/numeric variable did not parse.
    #[error("{var} must be a valid {kind}, got {value:?}")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// What kind of number was expected (`"u64"`, `"f64"`, ...).
        kind: &'static str,
        /// The value that failed to parse.
        value: String,
    },
    /// `GATEWAY_ED25519_PRIV_B64` was present but did not decode to
    /// exactly 32 bytes.
    #[error("GATEWAY_ED25519_PRIV_B64 must decode to exactly 32 bytes")]
    InvalidSigningSeed,
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v.parse().map_err(|_| ConfigError::InvalidNumber {
            var: key,
            kind: "u64",
            value: v,
        }),
        _ => Ok(default),
    }
}

fn env_f64(key: &'static str, default: f64) -> Result<f64, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v.parse().map_err(|_| ConfigError::InvalidNumber {
            var: key,
            kind: "f64",
            value: v,
        }),
        _ => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

/// Per-stage deadlines enforced with `tokio::time::timeout` (§5).
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    /// Resolver's memory text-resolve call.
    pub search: Duration,
    /// Evidence builder's expand-candidates call.
    pub expand: Duration,
    /// Evidence builder's per-neighbor enrichment calls.
    pub enrich: Duration,
    /// Validator pass.
    pub validate: Duration,
    /// LLM invocation.
    pub llm: Duration,
}

/// Selector/budget-gate tunables (§4.4).
#[derive(Debug, Clone, Copy)]
pub struct BudgetGateConfig {
    /// Model context window, in tokens.
    pub context_window: u32,
    /// Tokens reserved as a safety guard below the context window.
    pub guard_tokens: u32,
    /// Tokens requested for the completion.
    pub desired_completion_tokens: u32,
    /// How many times `max_tokens` may be shrunk and retried.
    pub max_retries: u32,
    /// Multiplicative shrink factor applied to `max_tokens` each retry.
    pub shrink_factor: f64,
    /// Jitter applied to retry backoff, as a fraction (0.0–1.0).
    pub jitter_pct: f64,
    /// Hard byte ceiling on the serialized bundle (used by the
    /// truncation-threshold test scenario in §8).
    pub max_prompt_bytes: u64,
    /// Below this many bytes of headroom, the selector begins dropping
    /// evidence rather than waiting for a hard overflow.
    pub selector_truncation_threshold: u64,
}

/// Process-scope configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base64-encoded 32-byte Ed25519 seed. Validated, not merely
    /// present: see [`Config::signing_seed`].
    pub ed25519_priv_b64: Option<String>,
    /// Key id advertised in `meta.signature.key_id`.
    pub sign_key_id: String,

    /// Base URL of the memory-graph service.
    pub memory_api_url: String,
    /// Base URL of the policy registry (informational; decisions go to
    /// `opa_url`).
    pub policy_registry_url: Option<String>,
    /// Base URL of the OPA-compatible policy decision service.
    pub opa_url: Option<String>,
    /// Path appended to `opa_url` for the decision endpoint.
    pub opa_decision_path: String,
    /// Policy-call deadline.
    pub opa_timeout: Duration,
    /// When `true` (non-default), an unreachable policy service falls
    /// back to default visibility instead of failing the request.
    /// Resolved Open Question: default `false` (fail closed).
    pub policy_fail_open: bool,

    /// Per-stage deadlines.
    pub timeouts: StageTimeouts,

    /// Selector/budget-gate tunables.
    pub budget: BudgetGateConfig,

    /// Vector embedding dimensionality (out of scope at the resolver
    /// layer but threaded through for compatibility with memory-service
    /// requests that expect the field).
    pub embedding_dim: u32,
    /// Distance metric label forwarded to the memory service.
    pub vector_metric: String,

    /// Skip the LLM call entirely and go straight to the templater.
    pub openai_disabled: bool,
    /// Model name sent to the LLM.
    pub openai_model: String,
    /// API key for the LLM endpoint.
    pub openai_api_key: Option<String>,
    /// Retries for a single LLM call before escalating to the templater.
    pub openai_max_retries: u32,

    /// Force `supporting_ids := allowed_ids` during validation.
    pub cite_all_ids: bool,
    /// Surfaced in `meta.gateway_version` when set.
    pub gateway_version: Option<String>,
    /// Path to a JSON template registry for the templater fallback; a
    /// built-in default registry is used when unset.
    pub template_registry_path: Option<String>,

    /// Allowed CORS origins (handled at the edge, not by this crate's
    /// pipeline, but threaded through configuration for completeness).
    pub cors_origins: Vec<String>,
    /// Per-IP requests/sec at the edge rate limiter.
    pub rate_limit: Option<u32>,
    /// How many load-shed poll cycles between heartbeat log lines.
    pub load_shed_heartbeat_cycles: u32,
    /// Skip artefact persistence entirely (tests, local dev).
    pub disable_artefact_writes: bool,
    /// When `true`, an artefact-persistence failure fails the request.
    pub artifact_strict: bool,

    /// Cache TTL for evidence bundles.
    pub cache_ttl: Duration,
    /// Redis connection string for the cache client.
    pub redis_url: Option<String>,
    /// Object-store bucket name (first path segment under the artefact
    /// root).
    pub object_store_bucket: String,
    /// Local filesystem root for the default object-store backend.
    pub object_store_root: String,
    /// HTTP endpoint for the remote object-store backend, when set
    /// instead of (or in addition to) the filesystem backend.
    pub object_store_put_url: Option<String>,
    /// Object retention, in days, advertised to the store's lifecycle
    /// policy (informational for the filesystem backend).
    pub object_store_retention_days: u32,

    /// Load-shed background poll period.
    pub load_shed_poll_period: Duration,
}

impl Config {
    /// Parse configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let timeouts = StageTimeouts {
            search: Duration::from_millis(env_u64("TIMEOUT_SEARCH_MS", 800)?),
            expand: Duration::from_millis(env_u64("TIMEOUT_EXPAND_MS", 1_500)?),
            enrich: Duration::from_millis(env_u64("TIMEOUT_ENRICH_MS", 1_500)?),
            validate: Duration::from_millis(env_u64("TIMEOUT_VALIDATE_MS", 200)?),
            llm: Duration::from_millis(env_u64("TIMEOUT_LLM_MS", 8_000)?),
        };

        let budget = BudgetGateConfig {
            context_window: env_u64("GATEWAY_CONTEXT_WINDOW", 8_192)? as u32,
            guard_tokens: env_u64("GATEWAY_GUARD_TOKENS", 256)? as u32,
            desired_completion_tokens: env_u64("GATEWAY_COMPLETION_TOKENS", 512)? as u32,
            max_retries: env_u64("GATEWAY_BUDGET_MAX_RETRIES", 2)? as u32,
            shrink_factor: env_f64("GATEWAY_BUDGET_SHRINK_FACTOR", 0.8)?,
            jitter_pct: env_f64("GATEWAY_BUDGET_JITTER_PCT", 0.1)?,
            max_prompt_bytes: env_u64("MAX_PROMPT_BYTES", 64_000)?,
            selector_truncation_threshold: env_u64("SELECTOR_TRUNCATION_THRESHOLD", 48_000)?,
        };

        Ok(Config {
            ed25519_priv_b64: env_opt_str("GATEWAY_ED25519_PRIV_B64"),
            sign_key_id: env_str("GATEWAY_SIGN_KEY_ID", "gateway/k1"),

            memory_api_url: env_str("MEMORY_API_URL", "http://localhost:8081"),
            policy_registry_url: env_opt_str("POLICY_REGISTRY_URL"),
            opa_url: env_opt_str("OPA_URL"),
            opa_decision_path: env_str("OPA_DECISION_PATH", "/v1/data/gateway/decision"),
            opa_timeout: Duration::from_millis(env_u64("OPA_TIMEOUT_MS", 500)?),
            policy_fail_open: env_bool("POLICY_FAIL_OPEN", false),

            timeouts,
            budget,

            embedding_dim: env_u64("EMBEDDING_DIM", 384)? as u32,
            vector_metric: env_str("VECTOR_METRIC", "cosine"),

            openai_disabled: env_bool("OPENAI_DISABLED", false),
            openai_model: env_str("OPENAI_MODEL", "gpt-4o-mini"),
            openai_api_key: env_opt_str("OPENAI_API_KEY"),
            openai_max_retries: env_u64("OPENAI_MAX_RETRIES", 2)? as u32,

            cite_all_ids: env_bool("CITE_ALL_IDS", false),
            gateway_version: env_opt_str("GATEWAY_VERSION"),
            template_registry_path: env_opt_str("GATEWAY_TEMPLATE_REGISTRY_PATH"),

            cors_origins: env_opt_str("CORS_ORIGINS")
                .map(|v| v.split(',').map(str::trim).map(String::from).collect())
                .unwrap_or_default(),
            rate_limit: match env_opt_str("RATE_LIMIT") {
                Some(v) => Some(v.parse().map_err(|_| ConfigError::InvalidNumber {
                    var: "RATE_LIMIT",
                    kind: "u32",
                    value: v,
                })?),
                None => None,
            },
            load_shed_heartbeat_cycles: env_u64("LOAD_SHED_HEARTBEAT_CYCLES", 60)? as u32,
            disable_artefact_writes: env_bool("DISABLE_ARTEFACT_WRITES", false),
            artifact_strict: env_bool("ARTIFACT_STRICT", false),

            cache_ttl: Duration::from_secs(env_u64("CACHE_TTL_SECONDS", 300)?),
            redis_url: env_opt_str("REDIS_URL"),
            object_store_bucket: env_str("OBJECT_STORE_BUCKET", "gateway-artefacts"),
            object_store_root: env_str("OBJECT_STORE_ROOT", "./artefacts"),
            object_store_put_url: env_opt_str("OBJECT_STORE_PUT_URL"),
            object_store_retention_days: env_u64("OBJECT_STORE_RETENTION_DAYS", 90)? as u32,

            load_shed_poll_period: Duration::from_millis(env_u64("LOAD_SHED_POLL_MS", 300)?),
        })
    }

    /// Validate and decode the Ed25519 signing seed, if configured.
    ///
    /// Returns `Ok(None)` when `GATEWAY_ED25519_PRIV_B64` is unset —
    /// callers (the signer) turn that into the fatal `no_signer_configured`
    /// condition; this function only reports a *malformed* seed as an
    /// error, matching the source system's distinction between "no
    /// signer" and "bad signer config".
    pub fn signing_seed(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(raw) = &self.ed25519_priv_b64 else {
            return Ok(None);
        };
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|_| ConfigError::InvalidSigningSeed)?;
        let seed: [u8; 32] = decoded
            .try_into()
            .map_err(|_| ConfigError::InvalidSigningSeed)?;
        Ok(Some(seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_signing_seed_of_wrong_length() {
        let mut cfg = Config::from_env().expect("defaults parse");
        cfg.ed25519_priv_b64 = Some("YWJj".to_string());
        assert!(matches!(
            cfg.signing_seed(),
            Err(ConfigError::InvalidSigningSeed)
        ));
    }

    #[test]
    fn absent_seed_is_not_an_error() {
        let mut cfg = Config::from_env().expect("defaults parse");
        cfg.ed25519_priv_b64 = None;
        assert!(matches!(cfg.signing_seed(), Ok(None)));
    }
}
