//! Evidence Builder (§4.2): fetch, de-duplicate, normalize, cache.

use std::time::Duration;

use gateway_clients::memory::ExpandNeighbors;
use gateway_clients::{Cache, MemoryClient};
use gateway_spec::{Anchor, Event, EvidenceBundle, Transition, Transitions};
use serde::{Deserialize, Serialize};

use crate::config::StageTimeouts;
use crate::error::GatewayError;

/// Everything needed to compute the cache key and thread timeouts
/// through the builder.
#[derive(Debug, Clone)]
pub struct EvidenceContext {
    /// Canonical anchor id.
    pub anchor_id: String,
    /// Fingerprint of the policy decision in effect, or `"none"` when
    /// the policy gate has not yet run / returned no override.
    pub policy_fp: String,
    /// Best-effort hint of the current snapshot etag, used only to form
    /// the cache key; the authoritative value is whatever the upstream
    /// enrichment call reports.
    pub snapshot_etag_hint: Option<String>,
    /// How many neighbors to request from `expand_candidates`.
    pub neighbor_k: usize,
}

impl EvidenceContext {
    fn cache_key(&self) -> String {
        format!(
            "evidence:{}:{}:{}",
            self.anchor_id,
            self.policy_fp,
            self.snapshot_etag_hint.as_deref().unwrap_or("unknown")
        )
    }
}

/// The on-disk/cache shape of a bundle. `EvidenceBundle` itself skips
/// `snapshot_etag` in its `Serialize`/`Deserialize` impls (it must never
/// appear in the wire response), so the cache uses its own DTO that
/// keeps the etag alongside the rest of the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEvidence {
    anchor: Anchor,
    events: Vec<Event>,
    transitions: Transitions,
    allowed_ids: Vec<String>,
    snapshot_etag: String,
}

impl From<&EvidenceBundle> for CachedEvidence {
    fn from(b: &EvidenceBundle) -> Self {
        Self {
            anchor: b.anchor.clone(),
            events: b.events.clone(),
            transitions: b.transitions.clone(),
            allowed_ids: b.allowed_ids.clone(),
            snapshot_etag: b.snapshot_etag.clone(),
        }
    }
}

impl From<CachedEvidence> for EvidenceBundle {
    fn from(c: CachedEvidence) -> Self {
        Self {
            anchor: c.anchor,
            events: c.events,
            transitions: c.transitions,
            allowed_ids: c.allowed_ids,
            snapshot_etag: c.snapshot_etag,
        }
    }
}

/// Two cache layouts the probe must tolerate without ever raising: a
/// direct blob, or a pointer to a composite key. Anything else (stale
/// pointer resolving to nothing, garbage bytes) degrades to a miss.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CacheEntry {
    Direct(CachedEvidence),
    Pointer { pointer: String },
}

async fn probe_cache(cache: &dyn Cache, ctx: &EvidenceContext) -> Option<EvidenceBundle> {
    let key = ctx.cache_key();
    let bytes = match cache.get(&key).await {
        Ok(Some(b)) => b,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(event = "evidence_cache_unavailable", error = %e, "evidence cache probe failed, treating as miss");
            return None;
        }
    };
    match serde_json::from_slice::<CacheEntry>(&bytes) {
        Ok(CacheEntry::Direct(entry)) => Some(entry.into()),
        Ok(CacheEntry::Pointer { pointer }) => match cache.get(&pointer).await {
            Ok(Some(b)) => serde_json::from_slice::<CachedEvidence>(&b).ok().map(Into::into),
            _ => None,
        },
        Err(_) => None,
    }
}

async fn write_cache(cache: &dyn Cache, ctx: &EvidenceContext, bundle: &EvidenceBundle, ttl: Duration) {
    let dto = CachedEvidence::from(bundle);
    let Ok(bytes) = serde_json::to_vec(&dto) else {
        return;
    };
    if let Err(e) = cache.set_ex(&ctx.cache_key(), bytes, ttl).await {
        tracing::warn!(event = "evidence_cache_write_failed", error = %e, "evidence cache write failed, continuing uncached");
    }
}

/// Jittered backoff: `base + jitter * (attempt mod 3)`.
fn backoff(base: Duration, jitter: Duration, attempt: u32) -> Duration {
    base + jitter * (attempt % 3)
}

/// Retries `f` up to `max_attempts` times, sleeping `backoff(..)` between
/// tries. Returns the result plus how many attempts were made.
async fn with_retries<T, E, F, Fut>(max_attempts: u32, base: Duration, jitter: Duration, mut f: F) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 0..max_attempts.max(1) {
        match f().await {
            Ok(v) => return (Ok(v), attempt + 1),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(backoff(base, jitter, attempt)).await;
                }
            }
        }
    }
    (Err(last_err.expect("loop runs at least once")), max_attempts.max(1))
}

fn value_as_id(v: &serde_json::Value) -> Option<String> {
    v.get("id").and_then(|id| id.as_str()).map(str::to_string)
}

fn value_kind(v: &serde_json::Value) -> String {
    v.get("kind").and_then(|k| k.as_str()).unwrap_or("event").to_string()
}

/// Build the full evidence bundle for `ctx.anchor_id`.
///
/// Returns the bundle and the total number of outbound-call attempts
/// made across every retried operation (`_retry_count`), surfaced in
/// `meta.retries`.
///
/// # Errors
/// `GatewayError::UpstreamTimeout` when either the enrich or expand
/// call exceeds its stage timeout; `GatewayError::UpstreamError` when
/// the upstream call exhausts its retries.
pub async fn build_evidence(
    memory: &dyn MemoryClient,
    cache: &dyn Cache,
    ctx: &EvidenceContext,
    timeouts: &StageTimeouts,
    cache_ttl: Duration,
) -> Result<(EvidenceBundle, u32), GatewayError> {
    if let Some(bundle) = probe_cache(cache, ctx).await {
        return Ok((bundle, 0));
    }

    let base = Duration::from_millis(50);
    let jitter = Duration::from_millis(30);
    let mut total_attempts: u32 = 0;

    let anchor_id = ctx.anchor_id.as_str();

    let (enrich_result, expand_result) = tokio::join!(
        tokio::time::timeout(
            timeouts.enrich,
            with_retries(3, base, jitter, || memory.enrich_decision(anchor_id)),
        ),
        tokio::time::timeout(
            timeouts.expand,
            with_retries(3, base, jitter, || memory.expand_candidates(anchor_id, ctx.neighbor_k)),
        ),
    );

    let (enrich_outcome, enrich_attempts) = enrich_result.map_err(|_| GatewayError::UpstreamTimeout { stage: "enrich" })?;
    let (expand_outcome, expand_attempts) = expand_result.map_err(|_| GatewayError::UpstreamTimeout { stage: "expand" })?;
    total_attempts += enrich_attempts + expand_attempts;

    let enrich_resp = enrich_outcome.map_err(|e| GatewayError::UpstreamError(e.to_string()))?;
    let expand_resp = expand_outcome.map_err(|e| GatewayError::UpstreamError(e.to_string()))?;

    let mut anchor = enrich_resp.anchor;
    anchor.mirror_title_from_option();
    let snapshot_etag = enrich_resp
        .meta
        .snapshot_etag
        .or(expand_resp.meta.snapshot_etag.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let (mut events, mut transitions) = match expand_resp.neighbors {
        ExpandNeighbors::Nested { events, transitions } => (
            events.into_iter().filter_map(|v| serde_json::from_value::<Event>(v).ok()).collect::<Vec<_>>(),
            transitions
                .into_iter()
                .filter_map(|v| serde_json::from_value::<Transition>(v).ok())
                .collect::<Vec<_>>(),
        ),
        ExpandNeighbors::Flat { neighbors } => {
            let (events, transitions, attempts) =
                fetch_flat_neighbors(memory, &ctx.anchor_id, neighbors, timeouts, base, jitter).await?;
            total_attempts += attempts;
            (events, transitions)
        }
    };

    events.retain(|e| !e.id.is_empty());
    for event in &mut events {
        event.bound_snippet();
    }

    let mut split = Transitions::default();
    for t in transitions.drain(..) {
        if t.to == ctx.anchor_id {
            split.preceding.push(t);
        } else {
            split.succeeding.push(t);
        }
    }

    let mut bundle = EvidenceBundle {
        anchor,
        events,
        transitions: split,
        allowed_ids: vec![],
        snapshot_etag,
    };
    bundle.dedupe_and_sort_events();
    bundle.recompute_allowed_ids();

    write_cache(cache, ctx, &bundle, cache_ttl).await;

    Ok((bundle, total_attempts))
}

/// Per-neighbor enrichment for the flat `neighbors[]` shape: each
/// reference is routed to the decision or event endpoint per its
/// declared `kind`, concurrently. `MemoryClient` is a borrowed trait
/// object so fan-out uses a buffered set of borrowed futures rather
/// than `JoinSet` (which requires `'static` tasks).
async fn fetch_flat_neighbors(
    memory: &dyn MemoryClient,
    anchor_id: &str,
    neighbors: Vec<serde_json::Value>,
    timeouts: &StageTimeouts,
    base: Duration,
    jitter: Duration,
) -> Result<(Vec<Event>, Vec<Transition>, u32), GatewayError> {
    use futures::future::join_all;

    let refs: Vec<(String, String)> = neighbors
        .iter()
        .filter_map(|v| value_as_id(v).map(|id| (id, value_kind(v))))
        .collect();

    let calls = refs.iter().map(|(id, kind)| {
        let memory = memory;
        let timeout = timeouts.enrich;
        async move {
            if kind == "decision" {
                let (outcome, attempts) =
                    tokio::time::timeout(timeout, with_retries(2, base, jitter, || memory.enrich_decision(id)))
                        .await
                        .unwrap_or((Err(gateway_clients::ClientError::Timeout), 1));
                (NeighborFetch::Decision(outcome), attempts)
            } else {
                let (outcome, attempts) =
                    tokio::time::timeout(timeout, with_retries(2, base, jitter, || memory.enrich_event(id)))
                        .await
                        .unwrap_or((Err(gateway_clients::ClientError::Timeout), 1));
                (NeighborFetch::Event(outcome), attempts)
            }
        }
    });

    let results = join_all(calls).await;

    let mut events = Vec::new();
    let mut transitions = Vec::new();
    let mut total_attempts = 0u32;
    for (outcome, attempts) in results {
        total_attempts += attempts;
        match outcome {
            NeighborFetch::Event(Ok(resp)) => events.push(resp.event),
            NeighborFetch::Decision(Ok(resp)) => {
                let mut neighbor_anchor = resp.anchor;
                neighbor_anchor.mirror_title_from_option();
                transitions.push(Transition {
                    id: format!("transition:{anchor_id}->{}", neighbor_anchor.id),
                    from: anchor_id.to_string(),
                    to: neighbor_anchor.id.clone(),
                    relation: "related_to".to_string(),
                    reason: neighbor_anchor.title.clone(),
                    timestamp: neighbor_anchor.timestamp.clone(),
                });
            }
            NeighborFetch::Event(Err(e)) | NeighborFetch::Decision(Err(e)) => {
                tracing::warn!(event = "neighbor_enrich_failed", error = %e, "dropping neighbor that failed enrichment");
            }
        }
    }

    Ok((events, transitions, total_attempts))
}

enum NeighborFetch {
    Event(Result<gateway_clients::memory::EnrichEventResponse, gateway_clients::ClientError>),
    Decision(Result<gateway_clients::memory::EnrichDecisionResponse, gateway_clients::ClientError>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_clients::memory::{
        EnrichDecisionResponse, EnrichEventResponse, EnrichMeta, ExpandMeta, ExpandResponse, ResolveResponse,
        SchemaKind, SchemaResponse,
    };
    use gateway_clients::{ClientError, InMemoryCache};
    use gateway_spec::Anchor;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubMemory {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MemoryClient for StubMemory {
        async fn resolve_text(&self, _q: &str, _limit: usize) -> Result<ResolveResponse, ClientError> {
            unimplemented!()
        }
        async fn expand_candidates(&self, _node_id: &str, _k: usize) -> Result<ExpandResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExpandResponse {
                node_id: "anchor:1".into(),
                neighbors: ExpandNeighbors::Nested {
                    events: vec![serde_json::json!({
                        "id": "event:1",
                        "summary": "did a thing",
                        "timestamp": "2024-01-01T00:00:00Z",
                    })],
                    transitions: vec![],
                },
                meta: ExpandMeta { snapshot_etag: Some("etag-1".into()), fallback_reason: None },
            })
        }
        async fn enrich_decision(&self, id: &str) -> Result<EnrichDecisionResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(EnrichDecisionResponse {
                anchor: Anchor {
                    id: id.to_string(),
                    title: Some("A Decision".into()),
                    option: None,
                    rationale: Some("because".into()),
                    timestamp: "2024-01-01T00:00:00Z".into(),
                    tags: vec![],
                    supported_by: vec![],
                    based_on: vec![],
                    transitions: vec![],
                },
                meta: EnrichMeta { snapshot_etag: Some("etag-1".into()) },
            })
        }
        async fn enrich_event(&self, _id: &str) -> Result<EnrichEventResponse, ClientError> {
            unimplemented!()
        }
        async fn schema(&self, _kind: SchemaKind) -> Result<SchemaResponse, ClientError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn builds_bundle_from_nested_shape_and_caches_it() {
        let memory = StubMemory { calls: AtomicU32::new(0) };
        let cache = InMemoryCache::new();
        let ctx = EvidenceContext {
            anchor_id: "anchor:1".into(),
            policy_fp: "none".into(),
            snapshot_etag_hint: None,
            neighbor_k: 5,
        };
        let timeouts = StageTimeouts {
            search: Duration::from_secs(1),
            enrich: Duration::from_secs(1),
            expand: Duration::from_secs(1),
            validate: Duration::from_secs(1),
            llm: Duration::from_secs(1),
        };

        let (bundle, _retries) = build_evidence(&memory, &cache, &ctx, &timeouts, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(bundle.anchor.id, "anchor:1");
        assert_eq!(bundle.events.len(), 1);
        assert_eq!(bundle.snapshot_etag, "etag-1");
        assert!(bundle.allowed_ids.contains(&"anchor:1".to_string()));
        assert!(bundle.allowed_ids.contains(&"event:1".to_string()));

        // Second call hits the cache: no additional upstream calls.
        let calls_before = memory.calls.load(Ordering::SeqCst);
        let (cached, retries) = build_evidence(&memory, &cache, &ctx, &timeouts, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(memory.calls.load(Ordering::SeqCst), calls_before);
        assert_eq!(retries, 0);
        assert_eq!(cached.anchor.id, "anchor:1");
    }
}
