//! Policy Gate (§4.3): restrict evidence visibility to what the policy
//! service allows, fingerprint the decision, fail closed by default.

use std::collections::BTreeMap;

use gateway_clients::PolicyClient;
use gateway_spec::{fingerprint, EvidenceBundle, PolicyEdge, PolicyIdentity, PolicyInput, PolicyResource};

use crate::config::Config;
use crate::error::GatewayError;

/// What the Policy Gate produced, threaded into `meta`.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    /// `sha256:`-prefixed fingerprint of the policy decision, or of the
    /// literal string `"fail-open"`/`"unscoped"` when no real decision
    /// was available.
    pub policy_fp: String,
    /// `true` when the gate ran in fail-open degraded mode.
    pub degraded: bool,
}

/// Build the canonical policy input envelope for `bundle`.
#[must_use]
pub fn build_policy_input(
    identity: PolicyIdentity,
    bundle: &EvidenceBundle,
    headers: BTreeMap<String, String>,
) -> PolicyInput {
    let edges = bundle
        .transitions
        .iter()
        .map(|t| PolicyEdge {
            from: t.from.clone(),
            to: t.to.clone(),
            relation: t.relation.clone(),
        })
        .collect();
    PolicyInput {
        identity,
        resource: PolicyResource {
            anchor_id: bundle.anchor.id.clone(),
        },
        intents: PolicyInput::default_intents(),
        edges,
        snapshot_etag: bundle.snapshot_etag.clone(),
        headers,
    }
}

/// Evaluate policy for `bundle`, filter it down to visible ids in place,
/// and return the resulting fingerprint/degraded marker.
///
/// # Errors
/// `GatewayError::PolicyDeny` when the anchor itself is not visible.
/// `GatewayError::PolicyError` when the service is unreachable/erroring
/// and `POLICY_FAIL_OPEN=false` (the default).
pub async fn apply_policy_gate(
    policy: &dyn PolicyClient,
    config: &Config,
    input: &PolicyInput,
    bundle: &mut EvidenceBundle,
) -> Result<PolicyOutcome, GatewayError> {
    if config.opa_url.is_none() {
        return Ok(unscoped());
    }

    let call = tokio::time::timeout(config.opa_timeout, policy.decide(input)).await;
    let decision = match call {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            return policy_unreachable(config, &e.to_string());
        }
        Err(_) => {
            return policy_unreachable(config, "policy decision timed out");
        }
    };

    let mut visible: std::collections::HashSet<String> = decision.allowed_ids.iter().cloned().collect();
    visible.extend(decision.extra_visible.iter().cloned());

    if !visible.contains(&bundle.anchor.id) {
        return Err(GatewayError::PolicyDeny);
    }

    bundle.events.retain(|e| visible.contains(&e.id));
    bundle.transitions.preceding.retain(|t| visible.contains(&t.id));
    bundle.transitions.succeeding.retain(|t| visible.contains(&t.id));
    bundle.recompute_allowed_ids();

    Ok(PolicyOutcome {
        policy_fp: fingerprint(&decision),
        degraded: false,
    })
}

fn policy_unreachable(config: &Config, detail: &str) -> Result<PolicyOutcome, GatewayError> {
    if config.policy_fail_open {
        tracing::warn!(event = "policy_fail_open", detail, "policy service unreachable, failing open per POLICY_FAIL_OPEN");
        Ok(PolicyOutcome {
            policy_fp: "sha256:fail-open".to_string(),
            degraded: true,
        })
    } else {
        Err(GatewayError::PolicyError(detail.to_string()))
    }
}

fn unscoped() -> PolicyOutcome {
    tracing::debug!(event = "policy_unscoped", "no OPA_URL configured, evidence left unscoped");
    PolicyOutcome {
        policy_fp: "sha256:unscoped".to_string(),
        degraded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_clients::ClientError;
    use gateway_spec::{Anchor, Event, PolicyDecision, Transitions};
    use std::time::Duration;

    struct StubPolicy {
        decision: Result<PolicyDecision, &'static str>,
    }

    #[async_trait]
    impl PolicyClient for StubPolicy {
        async fn decide(&self, _input: &PolicyInput) -> Result<PolicyDecision, ClientError> {
            match &self.decision {
                Ok(d) => Ok(d.clone()),
                Err(msg) => Err(ClientError::Http((*msg).to_string())),
            }
        }
    }

    fn base_config(fail_open: bool) -> Config {
        let mut cfg = Config::from_env().expect("defaults parse");
        cfg.opa_url = Some("http://policy.internal".to_string());
        cfg.policy_fail_open = fail_open;
        cfg.opa_timeout = Duration::from_millis(200);
        cfg
    }

    fn sample_bundle() -> EvidenceBundle {
        EvidenceBundle {
            anchor: Anchor {
                id: "anchor:1".into(),
                title: Some("t".into()),
                option: None,
                rationale: None,
                timestamp: "2024-01-01T00:00:00Z".into(),
                tags: vec![],
                supported_by: vec![],
                based_on: vec![],
                transitions: vec![],
            },
            events: vec![Event {
                id: "event:1".into(),
                summary: "s".into(),
                timestamp: "2024-01-01T00:00:00Z".into(),
                snippet: None,
                tags: vec![],
            }],
            transitions: Transitions::default(),
            allowed_ids: vec!["anchor:1".into(), "event:1".into()],
            snapshot_etag: "etag-1".into(),
        }
    }

    #[tokio::test]
    async fn filters_events_not_in_policy_decision() {
        let policy = StubPolicy {
            decision: Ok(PolicyDecision {
                allowed_ids: vec!["anchor:1".into()],
                extra_visible: vec![],
                policy_fingerprint: "pf-1".into(),
            }),
        };
        let config = base_config(false);
        let mut bundle = sample_bundle();
        let identity = PolicyIdentity::new("u", "u@example.com", "org", "tenant", std::iter::empty());
        let input = build_policy_input(identity, &bundle, BTreeMap::new());

        let outcome = apply_policy_gate(&policy, &config, &input, &mut bundle).await.unwrap();
        assert!(bundle.events.is_empty());
        assert_eq!(bundle.allowed_ids, vec!["anchor:1".to_string()]);
        assert!(!outcome.degraded);
    }

    #[tokio::test]
    async fn denies_when_anchor_not_visible() {
        let policy = StubPolicy {
            decision: Ok(PolicyDecision {
                allowed_ids: vec![],
                extra_visible: vec![],
                policy_fingerprint: "pf-1".into(),
            }),
        };
        let config = base_config(false);
        let mut bundle = sample_bundle();
        let identity = PolicyIdentity::default();
        let input = build_policy_input(identity, &bundle, BTreeMap::new());

        let err = apply_policy_gate(&policy, &config, &input, &mut bundle).await.unwrap_err();
        assert!(matches!(err, GatewayError::PolicyDeny));
    }

    #[tokio::test]
    async fn fails_closed_by_default_on_unreachable_policy_service() {
        let policy = StubPolicy {
            decision: Err("connection refused"),
        };
        let config = base_config(false);
        let mut bundle = sample_bundle();
        let identity = PolicyIdentity::default();
        let input = build_policy_input(identity, &bundle, BTreeMap::new());

        let err = apply_policy_gate(&policy, &config, &input, &mut bundle).await.unwrap_err();
        assert!(matches!(err, GatewayError::PolicyError(_)));
    }

    #[tokio::test]
    async fn fails_open_when_configured() {
        let policy = StubPolicy {
            decision: Err("connection refused"),
        };
        let config = base_config(true);
        let mut bundle = sample_bundle();
        let identity = PolicyIdentity::default();
        let input = build_policy_input(identity, &bundle, BTreeMap::new());

        let outcome = apply_policy_gate(&policy, &config, &input, &mut bundle).await.unwrap();
        assert!(outcome.degraded);
        // Unscoped: nothing was filtered out.
        assert_eq!(bundle.events.len(), 1);
    }
}
