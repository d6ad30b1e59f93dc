//! Validator + Deterministic Repair (§4.7): check the model's raw JSON
//! against the strict Answer contract and repair every violation
//! deterministically rather than re-prompting.

use std::collections::HashSet;

use gateway_spec::{Answer, CompletenessFlags, EvidenceBundle, RepairCode};
use serde_json::Value;

use crate::error::GatewayError;

/// The repaired answer, the recomputed completeness flags, and every
/// repair applied, in the order each check ran.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// The validated (and possibly repaired) answer.
    pub answer: Answer,
    /// Completeness flags recomputed from the (possibly trimmed) bundle.
    /// Never taken from the model.
    pub completeness_flags: CompletenessFlags,
    /// Every repair applied, in application order.
    pub repair_codes: Vec<RepairCode>,
}

/// Parse `raw` against the minimal Answer shape.
///
/// # Errors
/// A string describing what's missing/malformed; the caller turns this
/// into `GatewayError::ValidationFailed` and escalates to the templater
/// (this is the one failure deterministic repair cannot fix, since there
/// is nothing resembling an answer to repair).
fn parse_answer(raw: &Value) -> Result<Answer, String> {
    let short_answer = raw
        .get("short_answer")
        .and_then(Value::as_str)
        .ok_or_else(|| "short_answer missing or not a string".to_string())?
        .to_string();
    let supporting_ids = raw
        .get("supporting_ids")
        .and_then(Value::as_array)
        .ok_or_else(|| "supporting_ids missing or not an array".to_string())?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    Ok(Answer {
        short_answer,
        supporting_ids,
    })
}

fn dedup_preserve_order(ids: &mut Vec<String>) {
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}

/// Validate `raw` against `bundle` and repair every contract violation
/// in place, deterministically, in the following order:
///
/// 1. Drop evidence-layer items with no real event shape.
/// 2. Recompute `allowed_ids` as the exact set union.
/// 3. Drop `supporting_ids` entries outside `allowed_ids`.
/// 4. Add the anchor id to `supporting_ids` if missing.
/// 5. Add every transition id to `supporting_ids` if missing.
/// 6. If `CITE_ALL_IDS` is set, force `supporting_ids := allowed_ids`;
///    otherwise just de-duplicate.
/// 7. Bound `short_answer` to its max length.
/// 8. Recompute `completeness_flags` from the final bundle.
///
/// # Errors
/// `GatewayError::ValidationFailed` when `raw` isn't even shaped like an
/// answer (missing/mistyped `short_answer` or `supporting_ids`).
pub fn validate_and_repair(
    raw: &Value,
    bundle: &mut EvidenceBundle,
    cite_all_ids: bool,
) -> Result<ValidationOutcome, GatewayError> {
    let mut answer = parse_answer(raw).map_err(GatewayError::ValidationFailed)?;
    let mut repair_codes = Vec::new();

    let events_before = bundle.events.len();
    bundle.events.retain(|e| !e.id.is_empty() && !e.summary.is_empty());
    let events_dropped = bundle.events.len() != events_before;
    if events_dropped {
        repair_codes.push(RepairCode::EventsDroppedNonEvent);
        bundle.dedupe_and_sort_events();
    }

    if bundle.recompute_allowed_ids() {
        repair_codes.push(RepairCode::AllowedIdsExactUnionViolation);
    }

    let allowed: HashSet<&str> = bundle.allowed_ids.iter().map(String::as_str).collect();
    let supporting_before = answer.supporting_ids.len();
    answer.supporting_ids.retain(|id| allowed.contains(id.as_str()));
    if answer.supporting_ids.len() != supporting_before {
        repair_codes.push(RepairCode::SupportingIdsRemovedInvalid);
    }

    if !answer.supporting_ids.iter().any(|id| id == &bundle.anchor.id) {
        answer.supporting_ids.push(bundle.anchor.id.clone());
        repair_codes.push(RepairCode::SupportingIdsMissingAnchor);
    }

    let missing_transition = bundle
        .transitions
        .iter()
        .filter(|t| !answer.supporting_ids.iter().any(|id| id == &t.id))
        .map(|t| t.id.clone())
        .collect::<Vec<_>>();
    if !missing_transition.is_empty() {
        answer.supporting_ids.extend(missing_transition);
        repair_codes.push(RepairCode::SupportingIdsMissingTransition);
    }

    if cite_all_ids {
        answer.supporting_ids = bundle.allowed_ids.clone();
        repair_codes.push(RepairCode::SupportingIdsEnforcedCiteAllIds);
    } else {
        dedup_preserve_order(&mut answer.supporting_ids);
    }

    answer.bound_short_answer();

    if events_dropped {
        repair_codes.push(RepairCode::CompletenessEventCountMismatch);
    }
    let completeness_flags = bundle.completeness_flags();

    Ok(ValidationOutcome {
        answer,
        completeness_flags,
        repair_codes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_spec::{Anchor, Event, Transition, Transitions};

    fn bundle() -> EvidenceBundle {
        let mut b = EvidenceBundle {
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
            transitions: Transitions {
                preceding: vec![Transition {
                    id: "transition:1".into(),
                    from: "anchor:0".into(),
                    to: "anchor:1".into(),
                    relation: "superseded_by".into(),
                    reason: None,
                    timestamp: "2023-01-01T00:00:00Z".into(),
                }],
                succeeding: vec![],
            },
            allowed_ids: vec![],
            snapshot_etag: "etag-1".into(),
        };
        b.recompute_allowed_ids();
        b
    }

    #[test]
    fn rejects_non_answer_shape() {
        let mut b = bundle();
        let raw = serde_json::json!({"not_an_answer": true});
        let err = validate_and_repair(&raw, &mut b, false).unwrap_err();
        assert!(matches!(err, GatewayError::ValidationFailed(_)));
    }

    #[test]
    fn drops_ids_outside_allowed_set() {
        let mut b = bundle();
        let raw = serde_json::json!({"short_answer": "because", "supporting_ids": ["anchor:1", "not-allowed"]});
        let outcome = validate_and_repair(&raw, &mut b, false).unwrap();
        assert!(!outcome.answer.supporting_ids.contains(&"not-allowed".to_string()));
        assert!(outcome.repair_codes.contains(&RepairCode::SupportingIdsRemovedInvalid));
    }

    #[test]
    fn adds_missing_anchor_and_transition_ids() {
        let mut b = bundle();
        let raw = serde_json::json!({"short_answer": "because", "supporting_ids": []});
        let outcome = validate_and_repair(&raw, &mut b, false).unwrap();
        assert!(outcome.answer.supporting_ids.contains(&"anchor:1".to_string()));
        assert!(outcome.answer.supporting_ids.contains(&"transition:1".to_string()));
        assert!(outcome.repair_codes.contains(&RepairCode::SupportingIdsMissingAnchor));
        assert!(outcome.repair_codes.contains(&RepairCode::SupportingIdsMissingTransition));
    }

    #[test]
    fn cite_all_ids_overrides_supporting_ids() {
        let mut b = bundle();
        let raw = serde_json::json!({"short_answer": "because", "supporting_ids": ["anchor:1"]});
        let outcome = validate_and_repair(&raw, &mut b, true).unwrap();
        assert_eq!(outcome.answer.supporting_ids, b.allowed_ids);
        assert!(outcome.repair_codes.contains(&RepairCode::SupportingIdsEnforcedCiteAllIds));
    }

    #[test]
    fn drops_events_missing_summary_and_flags_completeness_mismatch() {
        let mut b = bundle();
        b.events.push(Event {
            id: String::new(),
            summary: String::new(),
            timestamp: "2024-01-02T00:00:00Z".into(),
            snippet: None,
            tags: vec![],
        });
        let raw = serde_json::json!({"short_answer": "because", "supporting_ids": ["anchor:1", "transition:1"]});
        let outcome = validate_and_repair(&raw, &mut b, false).unwrap();
        assert_eq!(b.events.len(), 1);
        assert_eq!(outcome.completeness_flags.event_count, 1);
        assert!(outcome.repair_codes.contains(&RepairCode::EventsDroppedNonEvent));
        assert!(outcome.repair_codes.contains(&RepairCode::CompletenessEventCountMismatch));
    }
}
