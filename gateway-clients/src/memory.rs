//! Memory-graph service client (§4.1, §4.2, §6).

use async_trait::async_trait;
use gateway_spec::{Anchor, Event};
use serde::Deserialize;

use crate::error::ClientError;

/// A single resolver match.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveMatch {
    /// Candidate anchor id.
    pub id: String,
    /// Relevance score (higher is better).
    pub score: f64,
    /// Optional title echoed for display.
    #[serde(default)]
    pub title: Option<String>,
}

/// Response from `POST /api/resolve/text`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveResponse {
    /// Echoed query text.
    pub query: String,
    /// Ranked candidates, best first.
    #[serde(default)]
    pub matches: Vec<ResolveMatch>,
    /// Whether the upstream used vector search.
    #[serde(default)]
    pub vector_used: bool,
}

/// The two shapes `expand_candidates` may respond with: a flat neighbor
/// list, or one already split into events/transitions. Both carry
/// loosely-typed JSON values — the evidence builder does the final
/// typed normalization (§4.2 step 3).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpandNeighbors {
    /// `{"neighbors": [...]}`.
    Flat {
        /// Mixed event/decision neighbor payloads.
        neighbors: Vec<serde_json::Value>,
    },
    /// `{"events": [...], "transitions": [...]}`.
    Nested {
        /// Event neighbor payloads.
        #[serde(default)]
        events: Vec<serde_json::Value>,
        /// Transition neighbor payloads.
        #[serde(default)]
        transitions: Vec<serde_json::Value>,
    },
}

/// `meta` block on an `expand_candidates` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpandMeta {
    /// Opaque version marker.
    pub snapshot_etag: Option<String>,
    /// Set to `"timeout"` when the upstream degraded gracefully instead
    /// of erroring (§5).
    pub fallback_reason: Option<String>,
}

/// Response from `POST /api/graph/expand_candidates`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExpandResponse {
    /// Echoed node id.
    pub node_id: String,
    /// Normalized neighbor payload (see [`ExpandNeighbors`]).
    #[serde(flatten)]
    pub neighbors: ExpandNeighbors,
    /// Bookkeeping metadata.
    #[serde(default)]
    pub meta: ExpandMeta,
}

/// `meta` block on an enrichment response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnrichMeta {
    /// Opaque version marker.
    pub snapshot_etag: Option<String>,
}

/// Response from `GET /api/enrich/decision/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichDecisionResponse {
    /// The decision document itself.
    #[serde(flatten)]
    pub anchor: Anchor,
    /// Bookkeeping metadata.
    #[serde(default)]
    pub meta: EnrichMeta,
}

/// Response from `GET /api/enrich/event/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichEventResponse {
    /// The event document itself.
    #[serde(flatten)]
    pub event: Event,
    /// Bookkeeping metadata.
    #[serde(default)]
    pub meta: EnrichMeta,
}

/// Which schema catalog to fetch.
#[derive(Debug, Clone, Copy)]
pub enum SchemaKind {
    /// `GET /api/schema/fields`.
    Fields,
    /// `GET /api/schema/rels`.
    Rels,
}

impl SchemaKind {
    /// The path segment for this kind.
    #[must_use]
    pub fn path_segment(self) -> &'static str {
        match self {
            SchemaKind::Fields => "fields",
            SchemaKind::Rels => "rels",
        }
    }
}

/// A schema-catalog response, with its upstream etag (forwarded to
/// callers of `GET /v2/schema/{fields,rels}` unchanged).
#[derive(Debug, Clone)]
pub struct SchemaResponse {
    /// Raw catalog body.
    pub body: serde_json::Value,
    /// `x-snapshot-etag` (or equivalent) header from the upstream.
    pub snapshot_etag: Option<String>,
}

/// The memory-graph service's HTTP surface, consumed by the resolver
/// and evidence builder.
#[async_trait]
pub trait MemoryClient: Send + Sync {
    /// `POST /api/resolve/text`.
    async fn resolve_text(&self, query: &str, limit: usize) -> Result<ResolveResponse, ClientError>;
    /// `POST /api/graph/expand_candidates`. `node_id`/`k` are sent as a
    /// relative-path POST body, never as an absolute URL.
    async fn expand_candidates(&self, node_id: &str, k: usize) -> Result<ExpandResponse, ClientError>;
    /// `GET /api/enrich/decision/{id}`.
    async fn enrich_decision(&self, id: &str) -> Result<EnrichDecisionResponse, ClientError>;
    /// `GET /api/enrich/event/{id}`.
    async fn enrich_event(&self, id: &str) -> Result<EnrichEventResponse, ClientError>;
    /// `GET /api/schema/{fields|rels}`.
    async fn schema(&self, kind: SchemaKind) -> Result<SchemaResponse, ClientError>;
}

/// `reqwest`-backed [`MemoryClient`].
pub struct HttpMemoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpMemoryClient {
    /// Build a client against `base_url` (e.g. `MEMORY_API_URL`).
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn extract_etag(headers: &reqwest::header::HeaderMap) -> Option<String> {
        for name in ["etag", "snapshot-etag", "x-snapshot-etag"] {
            if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
                return Some(v.to_string());
            }
        }
        None
    }
}

#[async_trait]
impl MemoryClient for HttpMemoryClient {
    async fn resolve_text(&self, query: &str, limit: usize) -> Result<ResolveResponse, ClientError> {
        let resp = self
            .http
            .post(self.url("/api/resolve/text"))
            .json(&serde_json::json!({"q": query, "limit": limit}))
            .send()
            .await?
            .error_for_status()
            .map_err(ClientError::from)?;
        Ok(resp.json().await?)
    }

    async fn expand_candidates(&self, node_id: &str, k: usize) -> Result<ExpandResponse, ClientError> {
        let resp = self
            .http
            .post(self.url("/api/graph/expand_candidates"))
            .json(&serde_json::json!({"node_id": node_id, "k": k}))
            .send()
            .await?
            .error_for_status()
            .map_err(ClientError::from)?;
        Ok(resp.json().await?)
    }

    async fn enrich_decision(&self, id: &str) -> Result<EnrichDecisionResponse, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/enrich/decision/{id}")))
            .send()
            .await?
            .error_for_status()
            .map_err(ClientError::from)?;
        let etag = Self::extract_etag(resp.headers());
        let mut decoded: EnrichDecisionResponse = resp.json().await?;
        if decoded.meta.snapshot_etag.is_none() {
            decoded.meta.snapshot_etag = etag;
        }
        Ok(decoded)
    }

    async fn enrich_event(&self, id: &str) -> Result<EnrichEventResponse, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/enrich/event/{id}")))
            .send()
            .await?
            .error_for_status()
            .map_err(ClientError::from)?;
        let etag = Self::extract_etag(resp.headers());
        let mut decoded: EnrichEventResponse = resp.json().await?;
        if decoded.meta.snapshot_etag.is_none() {
            decoded.meta.snapshot_etag = etag;
        }
        Ok(decoded)
    }

    async fn schema(&self, kind: SchemaKind) -> Result<SchemaResponse, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/schema/{}", kind.path_segment())))
            .send()
            .await?
            .error_for_status()
            .map_err(ClientError::from)?;
        let snapshot_etag = Self::extract_etag(resp.headers());
        let body = resp.json().await?;
        Ok(SchemaResponse { body, snapshot_etag })
    }
}
