//! Policy-service request/response envelope shapes.
//!
//! The exact shape below mirrors the OPA input envelope built by the
//! source system's identity module: `identity`, `resource`, `intents`,
//! `edges`, `snapshot_etag`, and `headers`, with roles deduplicated and
//! sorted before being placed in the envelope.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Caller identity forwarded to the policy service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyIdentity {
    /// Authenticated user id, empty string when anonymous.
    #[serde(default)]
    pub user_id: String,
    /// Authenticated user email, empty string when unknown.
    #[serde(default)]
    pub email: String,
    /// Organization id, empty string when absent.
    #[serde(default)]
    pub org_id: String,
    /// Tenant id, empty string when absent.
    #[serde(default)]
    pub tenant_id: String,
    /// Deduplicated, sorted role names.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl PolicyIdentity {
    /// Build an identity with its roles deduplicated and sorted,
    /// matching the source system's `sorted(dict.fromkeys(...))` idiom.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        email: impl Into<String>,
        org_id: impl Into<String>,
        tenant_id: impl Into<String>,
        roles: impl IntoIterator<Item = String>,
    ) -> Self {
        let deduped: BTreeSet<String> = roles.into_iter().collect();
        Self {
            user_id: user_id.into(),
            email: email.into(),
            org_id: org_id.into(),
            tenant_id: tenant_id.into(),
            roles: deduped.into_iter().collect(),
        }
    }
}

/// The resource being asked about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyResource {
    /// The anchor id under question.
    pub anchor_id: String,
}

/// A candidate edge (transition) presented to the policy service for
/// visibility evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyEdge {
    /// Source id.
    pub from: String,
    /// Destination id.
    pub to: String,
    /// Relation label.
    pub relation: String,
}

/// The canonical policy input envelope POSTed to `{opa_url}{decision_path}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyInput {
    /// Caller identity.
    pub identity: PolicyIdentity,
    /// The resource being asked about.
    pub resource: PolicyResource,
    /// Requested intents, default `["enrich"]`.
    pub intents: Vec<String>,
    /// Candidate edges under consideration.
    pub edges: Vec<PolicyEdge>,
    /// Opaque version marker from the memory service.
    pub snapshot_etag: String,
    /// Forwarded request headers relevant to policy evaluation.
    pub headers: BTreeMap<String, String>,
}

impl PolicyInput {
    /// Default intents: `["enrich"]`.
    #[must_use]
    pub fn default_intents() -> Vec<String> {
        vec!["enrich".to_string()]
    }
}

/// The policy service's decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Ids visible to this caller.
    pub allowed_ids: Vec<String>,
    /// Ids visible beyond what was requested (e.g. redaction exceptions).
    #[serde(default)]
    pub extra_visible: Vec<String>,
    /// Fingerprint of the policy bundle/decision used.
    pub policy_fingerprint: String,
}

/// The policy service's HTTP response envelope: `{"result": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyResult {
    /// The decision payload.
    pub result: PolicyDecision,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_dedupes_and_sorts_roles() {
        let identity = PolicyIdentity::new(
            "u1",
            "u1@example.com",
            "org1",
            "tenant1",
            ["viewer".to_string(), "admin".to_string(), "viewer".to_string()],
        );
        assert_eq!(identity.roles, vec!["admin", "viewer"]);
    }

    #[test]
    fn serializes_with_expected_field_names() {
        let input = PolicyInput {
            identity: PolicyIdentity::default(),
            resource: PolicyResource {
                anchor_id: "a-b-c-d".into(),
            },
            intents: PolicyInput::default_intents(),
            edges: vec![],
            snapshot_etag: "etag-1".into(),
            headers: BTreeMap::new(),
        };
        let v = serde_json::to_value(&input).unwrap();
        assert_eq!(v["intents"][0], "enrich");
        assert_eq!(v["resource"]["anchor_id"], "a-b-c-d");
    }
}
