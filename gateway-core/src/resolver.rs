//! Resolver (§4.1): maps a free-text question or a provided anchor
//! reference to a canonical decision identifier.

use std::collections::HashSet;
use std::time::Duration;

use gateway_clients::MemoryClient;
use gateway_spec::is_valid_anchor_id;

use crate::error::GatewayError;

/// What the caller handed the resolver.
#[derive(Debug, Clone, Copy)]
pub enum ResolveInput<'a> {
    /// Already-canonical anchor id, takes precedence over `decision_ref`
    /// when both are present on the request (Open Question resolution).
    AnchorId(&'a str),
    /// An alias for an anchor id, only consulted when `AnchorId` is
    /// absent.
    DecisionRef(&'a str),
    /// Free text to resolve via the memory service / local fallback.
    Text(&'a str),
}

/// A small local candidate pool for the BM25-style fallback scorer,
/// used only when the upstream resolve call misses or errors.
pub type CandidatePool<'a> = &'a [(String, String)];

/// Resolve `input` to a canonical anchor id, or `Ok(None)` for the
/// legitimate "no anchor" outcome.
///
/// # Errors
/// `GatewayError::UpstreamTimeout { stage: "search" }` when the memory
/// call exceeds `timeout`; `GatewayError::UpstreamError` when both the
/// upstream call and the local fallback are unavailable (no candidate
/// pool to fall back to).
pub async fn resolve(
    memory: &dyn MemoryClient,
    input: ResolveInput<'_>,
    candidates: Option<CandidatePool<'_>>,
    timeout: Duration,
) -> Result<Option<String>, GatewayError> {
    let fast_path = match input {
        ResolveInput::AnchorId(id) | ResolveInput::DecisionRef(id) if is_valid_anchor_id(id) => {
            Some(id.to_string())
        }
        ResolveInput::Text(text) if is_valid_anchor_id(text) => Some(text.to_string()),
        _ => None,
    };
    if let Some(id) = fast_path {
        return Ok(Some(id));
    }

    let query = match input {
        ResolveInput::AnchorId(id) | ResolveInput::DecisionRef(id) | ResolveInput::Text(id) => id,
    };

    let upstream = tokio::time::timeout(timeout, memory.resolve_text(query, 5)).await;
    let upstream_result = match upstream {
        Err(_) => return Err(GatewayError::UpstreamTimeout { stage: "search" }),
        Ok(Ok(response)) => Ok(response.matches.into_iter().next().map(|m| m.id)),
        Ok(Err(e)) => Err(e),
    };

    match upstream_result {
        Ok(Some(id)) => Ok(Some(id)),
        Ok(None) => Ok(bm25_fallback(query, candidates)),
        Err(upstream_err) => match candidates {
            Some(pool) => Ok(bm25_fallback(query, Some(pool))),
            None => Err(GatewayError::UpstreamError(upstream_err.to_string())),
        },
    }
}

/// A minimal token-overlap ("BM25-style") scorer: the candidate sharing
/// the most lowercase whitespace-tokens with the query wins, provided at
/// least one token overlaps.
fn bm25_fallback(query: &str, candidates: Option<CandidatePool<'_>>) -> Option<String> {
    let pool = candidates?;
    let query_tokens: HashSet<String> = tokenize(query);
    if query_tokens.is_empty() {
        return None;
    }
    pool.iter()
        .map(|(id, text)| {
            let candidate_tokens = tokenize(text);
            let overlap = query_tokens.intersection(&candidate_tokens).count();
            (id, overlap)
        })
        .filter(|(_, overlap)| *overlap > 0)
        .max_by_key(|(_, overlap)| *overlap)
        .map(|(id, _)| id.clone())
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_clients::memory::{
        EnrichDecisionResponse, EnrichEventResponse, ExpandResponse, ResolveResponse, SchemaKind,
        SchemaResponse,
    };
    use gateway_clients::ClientError;

    struct StubMemory {
        resolve: Box<dyn Fn() -> Result<ResolveResponse, ClientError> + Send + Sync>,
    }

    #[async_trait]
    impl MemoryClient for StubMemory {
        async fn resolve_text(&self, _q: &str, _limit: usize) -> Result<ResolveResponse, ClientError> {
            (self.resolve)()
        }
        async fn expand_candidates(&self, _node_id: &str, _k: usize) -> Result<ExpandResponse, ClientError> {
            unimplemented!()
        }
        async fn enrich_decision(&self, _id: &str) -> Result<EnrichDecisionResponse, ClientError> {
            unimplemented!()
        }
        async fn enrich_event(&self, _id: &str) -> Result<EnrichEventResponse, ClientError> {
            unimplemented!()
        }
        async fn schema(&self, _kind: SchemaKind) -> Result<SchemaResponse, ClientError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn slug_fast_path_skips_upstream() {
        let memory = StubMemory {
            resolve: Box::new(|| panic!("should not be called")),
        };
        let result = resolve(
            &memory,
            ResolveInput::AnchorId("panasonic-exit-plasma-2012"),
            None,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(result.as_deref(), Some("panasonic-exit-plasma-2012"));
    }

    #[tokio::test]
    async fn falls_back_to_local_scorer_on_upstream_miss() {
        let memory = StubMemory {
            resolve: Box::new(|| {
                Ok(ResolveResponse {
                    query: "plasma exit".into(),
                    matches: vec![],
                    vector_used: false,
                })
            }),
        };
        let candidates = vec![(
            "panasonic-exit-plasma-2012".to_string(),
            "panasonic exit plasma manufacturing".to_string(),
        )];
        let result = resolve(
            &memory,
            ResolveInput::Text("plasma exit"),
            Some(&candidates),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(result.as_deref(), Some("panasonic-exit-plasma-2012"));
    }

    #[tokio::test]
    async fn all_miss_is_none_not_an_error() {
        let memory = StubMemory {
            resolve: Box::new(|| {
                Ok(ResolveResponse {
                    query: "nothing".into(),
                    matches: vec![],
                    vector_used: false,
                })
            }),
        };
        let result = resolve(
            &memory,
            ResolveInput::Text("nothing"),
            None,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn anchor_id_takes_precedence_semantics_documented_on_caller() {
        // The precedence rule itself is enforced by the caller choosing
        // which ResolveInput variant to construct; this just documents
        // that both variants share the same fast path.
        let memory = StubMemory {
            resolve: Box::new(|| panic!("should not be called")),
        };
        let result = resolve(
            &memory,
            ResolveInput::DecisionRef("panasonic-exit-plasma-2012"),
            None,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(result.as_deref(), Some("panasonic-exit-plasma-2012"));
    }
}
