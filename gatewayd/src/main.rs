//! `gatewayd`: the why-decision answering gateway's HTTP daemon. Wires
//! [`gateway_core::pipeline::run_ask`] and its collaborators into an
//! `axum::Router` exposing `/v2/ask`, `/v2/query`, `/v2/schema/{fields,rels}`,
//! `/healthz`, `/readyz`, and `/metrics`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use gateway_clients::memory::SchemaKind;
use gateway_clients::{
    Cache, DisabledLlmClient, FilesystemObjectStore, HttpMemoryClient, HttpPolicyClient,
    HttpPutObjectStore, InMemoryCache, LlmClient, MemoryClient, ObjectStore, OpenAiLlmClient,
    PolicyClient, RedisCache,
};
use gateway_core::pipeline::{self, AskRequest, PipelineDeps};
use gateway_core::resolver::{self, ResolveInput};
use gateway_core::{Config, GatewayError, Signer, TemplateRegistry};
use gateway_spec::{FallbackReason, PolicyIdentity};
use prometheus::Encoder;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Gateway daemon command line. Logging and the bind address are plain
/// flags; everything domain-specific (timeouts, budget, upstream URLs,
/// signing key) comes from [`Config::from_env`] so it can be reconfigured
/// without touching the process supervisor's argv.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase output verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Override log level (e.g. info, debug, trace).
    #[arg(long, env = "GATEWAY_LOG_LEVEL")]
    log_level: Option<String>,
    /// Emit structured JSON logs instead of the compact dev format.
    #[arg(long, env = "GATEWAY_LOG_JSON")]
    log_json: bool,
    /// HTTP bind address for the gateway API.
    #[arg(long, env = "GATEWAY_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: String,
}

fn init_tracing(cli: &Cli) {
    let level = cli
        .log_level
        .as_deref()
        .map(str::to_ascii_uppercase)
        .map(|lvl| match lvl.as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            _ => Level::INFO,
        })
        .unwrap_or_else(|| match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        });
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(env_filter);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Request-scope counters and latency histograms, gathered the same way
/// a single `Registry` with every metric registered once at startup would
/// be built for any other daemon in this workspace.
struct GatewayMetrics {
    registry: prometheus::Registry,
    requests_total: prometheus::IntCounterVec,
    errors_total: prometheus::IntCounterVec,
    ask_latency_ms: prometheus::Histogram,
    fallback_total: prometheus::IntCounterVec,
    stage_timeouts_total: prometheus::IntCounterVec,
    load_shed_gauge: prometheus::IntGauge,
}

impl GatewayMetrics {
    fn new() -> Self {
        let registry = prometheus::Registry::new();
        let requests_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("gateway_requests_total", "Total requests by route"),
            &["route"],
        )
        .unwrap();
        let errors_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("gateway_errors_total", "Total errors by stable code"),
            &["code"],
        )
        .unwrap();
        let ask_latency_ms = prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(
            "gateway_ask_latency_ms",
            "End-to-end /v2/ask latency in milliseconds",
        ))
        .unwrap();
        let fallback_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("gateway_fallback_total", "Templater fallbacks by reason"),
            &["reason"],
        )
        .unwrap();
        let stage_timeouts_total = prometheus::IntCounterVec::new(
            prometheus::Opts::new("gateway_stage_timeouts_total", "Stage timeouts by stage"),
            &["stage"],
        )
        .unwrap();
        let load_shed_gauge = prometheus::IntGauge::new(
            "gateway_load_shed",
            "Whether the gateway is currently load-shedding (1) or not (0)",
        )
        .unwrap();

        registry.register(Box::new(requests_total.clone())).expect("register requests_total");
        registry.register(Box::new(errors_total.clone())).expect("register errors_total");
        registry.register(Box::new(ask_latency_ms.clone())).expect("register ask_latency_ms");
        registry.register(Box::new(fallback_total.clone())).expect("register fallback_total");
        registry
            .register(Box::new(stage_timeouts_total.clone()))
            .expect("register stage_timeouts_total");
        registry.register(Box::new(load_shed_gauge.clone())).expect("register load_shed_gauge");

        Self {
            registry,
            requests_total,
            errors_total,
            ask_latency_ms,
            fallback_total,
            stage_timeouts_total,
            load_shed_gauge,
        }
    }

    fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn record_error(&self, err: &GatewayError) {
        self.errors_total.with_label_values(&[err.code()]).inc();
        if let GatewayError::UpstreamTimeout { stage } = err {
            self.stage_timeouts_total.with_label_values(&[stage]).inc();
        }
    }

    fn record_fallback(&self, reason: Option<FallbackReason>) {
        let label = match reason {
            Some(FallbackReason::LlmOff) => "llm_off",
            Some(FallbackReason::LlmError) => "llm_error",
            Some(FallbackReason::ValidatorFailed) => "validator_failed",
            Some(FallbackReason::Timeout) => "timeout",
            None => "unknown",
        };
        self.fallback_total.with_label_values(&[label]).inc();
    }
}

/// Every collaborator a request handler needs, built once at startup and
/// shared via `axum::extract::State`.
struct AppState {
    memory: Arc<dyn MemoryClient>,
    policy: Arc<dyn PolicyClient>,
    cache: Arc<dyn Cache>,
    llm: Arc<dyn LlmClient>,
    object_store: Arc<dyn ObjectStore>,
    signer: Signer,
    templates: TemplateRegistry,
    config: Config,
    load_shed: gateway_core::loadshed::LoadShedState,
    metrics: GatewayMetrics,
    request_counter: AtomicU64,
}

impl AppState {
    fn deps(&self) -> PipelineDeps<'_> {
        PipelineDeps {
            memory: self.memory.as_ref(),
            policy: self.policy.as_ref(),
            cache: self.cache.as_ref(),
            llm: self.llm.as_ref(),
            object_store: self.object_store.as_ref(),
            signer: &self.signer,
            templates: &self.templates,
            config: &self.config,
        }
    }

    /// A locally-unique request id: `gw-{pid:x}-{seq}`. No UUID dependency
    /// is pulled in for this alone — the id only needs to be unique within
    /// a single daemon's lifetime, since it is only ever used as the
    /// artefact-persistence path prefix.
    fn next_request_id(&self) -> String {
        let seq = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("gw-{:x}-{seq}", std::process::id())
    }
}

#[derive(Debug, Deserialize)]
struct AskBody {
    #[serde(default)]
    anchor_id: Option<String>,
    #[serde(default)]
    decision_ref: Option<String>,
    /// Used only as the resolver's fallback query text when neither id
    /// field resolves on the fast path.
    #[serde(default)]
    question: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    text: String,
    #[serde(default)]
    #[allow(dead_code)]
    functions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct NoMatchResponse {
    matches: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// Wraps [`GatewayError`] so this crate (not `gateway-core`) owns the
/// HTTP-status mapping; `gateway-core` itself never depends on axum, so
/// implementing `IntoResponse` directly for `GatewayError` would run
/// afoul of the orphan rule (both types are foreign to this crate).
struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn identity_from_headers(headers: &BTreeMap<String, String>) -> PolicyIdentity {
    let roles = headers
        .get("x-roles")
        .map(|v| v.split(',').map(str::trim).map(String::from).collect())
        .unwrap_or_default();
    PolicyIdentity::new(
        headers.get("x-user-id").cloned().unwrap_or_default(),
        headers.get("x-user-email").cloned().unwrap_or_default(),
        headers.get("x-org-id").cloned().unwrap_or_default(),
        headers.get("x-tenant-id").cloned().unwrap_or_default(),
        roles,
    )
}

fn header_map(headers: &axum::http::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

async fn ask_handler(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<AskBody>,
) -> axum::response::Response {
    state.metrics.requests_total.with_label_values(&["ask"]).inc();
    if state.load_shed.is_shedding() {
        let body = ErrorBody {
            code: "LOAD_SHED",
            message: "gateway is shedding load".to_string(),
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }

    let forwarded_headers = header_map(&headers);
    let identity = identity_from_headers(&forwarded_headers);
    let request = AskRequest {
        request_id: state.next_request_id(),
        anchor_id: body.anchor_id,
        decision_ref: body.decision_ref,
        question: body.question.unwrap_or_default(),
        identity,
        headers: forwarded_headers,
        candidates: Vec::new(),
        load_shed: false,
    };

    let started = Instant::now();
    let outcome = pipeline::run_ask(request, &state.deps()).await;
    state.metrics.ask_latency_ms.observe(started.elapsed().as_millis() as f64);

    match outcome {
        Ok(resp) => {
            if resp.meta.fallback_used {
                state.metrics.record_fallback(resp.meta.fallback_reason);
            }
            Json(resp).into_response()
        }
        Err(err) => {
            state.metrics.record_error(&err);
            ApiError(err).into_response()
        }
    }
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<QueryBody>,
) -> Result<axum::response::Response, ApiError> {
    state.metrics.requests_total.with_label_values(&["query"]).inc();

    let resolved = resolver::resolve(
        state.memory.as_ref(),
        ResolveInput::Text(&body.text),
        None,
        state.config.timeouts.search,
    )
    .await?;

    let Some(anchor_id) = resolved else {
        return Ok(Json(NoMatchResponse { matches: Vec::new() }).into_response());
    };

    let forwarded_headers = header_map(&headers);
    let identity = identity_from_headers(&forwarded_headers);
    let request = AskRequest {
        request_id: state.next_request_id(),
        anchor_id: Some(anchor_id),
        decision_ref: None,
        question: body.text,
        identity,
        headers: forwarded_headers,
        candidates: Vec::new(),
        load_shed: false,
    };
    let response = pipeline::run_ask(request, &state.deps()).await.map_err(|err| {
        state.metrics.record_error(&err);
        ApiError(err)
    })?;
    if response.meta.fallback_used {
        state.metrics.record_fallback(response.meta.fallback_reason);
    }
    Ok(Json(response).into_response())
}

async fn schema_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<axum::response::Response, ApiError> {
    let schema_kind = match kind.as_str() {
        "fields" => SchemaKind::Fields,
        "rels" => SchemaKind::Rels,
        other => {
            return Err(ApiError(GatewayError::UpstreamError(format!(
                "unknown schema kind {other}"
            ))))
        }
    };
    let resp = state
        .memory
        .schema(schema_kind)
        .await
        .map_err(|e| ApiError(GatewayError::UpstreamError(e.to_string())))?;

    let mut headers = axum::http::HeaderMap::new();
    if let Some(etag) = &resp.snapshot_etag {
        if let Ok(value) = axum::http::HeaderValue::from_str(etag) {
            headers.insert("x-snapshot-etag", value);
        }
    }
    Ok((headers, Json(resp.body)).into_response())
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    load_shed: bool,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthReport {
        status: "ok",
        load_shed: state.load_shed.is_shedding(),
    })
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.load_shed.is_shedding() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthReport {
                status: "shedding",
                load_shed: true,
            }),
        );
    }
    (
        StatusCode::OK,
        Json(HealthReport {
            status: "ready",
            load_shed: false,
        }),
    )
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.load_shed_gauge.set(i64::from(state.load_shed.is_shedding()));
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v2/ask", post(ask_handler))
        .route("/v2/query", post(query_handler))
        .route("/v2/schema/:kind", get(schema_handler))
        .route("/healthz", get(health_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let signer = Signer::from_config(&config)?;
    let templates = match &config.template_registry_path {
        Some(path) => TemplateRegistry::load(path).await?,
        None => TemplateRegistry::builtin(),
    };

    let http = reqwest::Client::builder().build()?;

    let memory: Arc<dyn MemoryClient> =
        Arc::new(HttpMemoryClient::new(http.clone(), config.memory_api_url.clone()));

    let opa_base = config.opa_url.clone().unwrap_or_default();
    let policy: Arc<dyn PolicyClient> =
        Arc::new(HttpPolicyClient::new(http.clone(), &opa_base, &config.opa_decision_path));

    let cache: Arc<dyn Cache> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::connect(url).await?),
        None => Arc::new(InMemoryCache::new()),
    };

    let llm: Arc<dyn LlmClient> = if config.openai_disabled {
        Arc::new(DisabledLlmClient)
    } else {
        Arc::new(OpenAiLlmClient::new(
            http.clone(),
            "https://api.openai.com/v1",
            config.openai_api_key.clone(),
            config.openai_model.clone(),
            config.openai_max_retries,
        ))
    };

    let object_store: Arc<dyn ObjectStore> = match &config.object_store_put_url {
        Some(url) => Arc::new(HttpPutObjectStore::new(
            http.clone(),
            url.clone(),
            config.object_store_bucket.clone(),
        )),
        None => Arc::new(FilesystemObjectStore::new(
            config.object_store_root.clone(),
            config.object_store_bucket.clone(),
        )),
    };

    let load_shed = gateway_core::loadshed::LoadShedState::new();

    Ok(Arc::new(AppState {
        memory,
        policy,
        cache,
        llm,
        object_store,
        signer,
        templates,
        config,
        load_shed,
        metrics: GatewayMetrics::new(),
        request_counter: AtomicU64::new(0),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = Config::from_env()?;
    let poll_period = config.load_shed_poll_period;
    let heartbeat_cycles = config.load_shed_heartbeat_cycles;
    let state = build_state(config).await?;

    let token = CancellationToken::new();
    let refresher = tokio::spawn(gateway_core::loadshed::run_refresher(
        state.load_shed.clone(),
        state.cache.clone(),
        poll_period,
        heartbeat_cycles,
        token.clone(),
    ));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&cli.bind_addr).await?;
    info!("gatewayd listening on {}", cli.bind_addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    token.cancel();
    let _ = refresher.await;
    Ok(())
}
