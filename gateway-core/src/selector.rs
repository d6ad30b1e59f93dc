//! Selector / Budget Gate (§4.4): fit the evidence bundle into the
//! model's context window, deterministically dropping the lowest-ranked
//! evidence first, then shrinking the completion budget.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use gateway_spec::{canonical_bytes, EvidenceBundle, Event, PromptConstraints, PromptEnvelope, Transition};

use crate::config::BudgetGateConfig;
use crate::tokens::estimate_tokens;

/// The selected prompt plus the bookkeeping the response's `meta` block
/// needs (`prompt_tokens`, `dropped_evidence_ids`, `selector_truncation`,
/// `total_neighbors_found`, `final_evidence_count`).
#[derive(Debug, Clone)]
pub struct Selection {
    /// The envelope that will be sent to the LLM (or templater).
    pub envelope: PromptEnvelope,
    /// Estimated tokens of the rendered prompt.
    pub prompt_tokens: u32,
    /// Completion token ceiling for this request, possibly shrunk from
    /// `budget.desired_completion_tokens`.
    pub max_tokens: u32,
    /// Ids dropped to fit the budget, in drop order.
    pub dropped_evidence_ids: Vec<String>,
    /// `true` iff any evidence was dropped.
    pub selector_truncation: bool,
    /// Evidence neighbor count before selection.
    pub total_neighbors_found: usize,
    /// Evidence count after selection (events + transitions).
    pub final_evidence_count: usize,
}

/// Render a [`PromptEnvelope`] as the two messages the token estimator
/// and the LLM client both consume: a fixed system instruction, then the
/// canonical-JSON envelope as the user turn.
#[must_use]
pub fn render_messages(envelope: &PromptEnvelope) -> Vec<String> {
    let system = "Answer strictly from the evidence bundle provided. \
Respond with JSON matching the contract: {\"short_answer\": string, \"supporting_ids\": [string]}. \
Never cite an id outside allowed_ids."
        .to_string();
    let user = serde_json::to_string(envelope).unwrap_or_default();
    vec![system, user]
}

fn envelope_bytes(envelope: &PromptEnvelope) -> usize {
    canonical_bytes(&serde_json::to_value(envelope).expect("PromptEnvelope always serializes")).len()
}

/// Find the index of the oldest (lowest-ranked) transition in `group`.
fn oldest_transition_index(group: &[Transition]) -> Option<usize> {
    group.iter().enumerate().min_by_key(|(_, t)| t.sort_key()).map(|(i, _)| i)
}

/// `true` if `event` shares a tag with the anchor's own tags — the
/// "same-slug cohort" the events ranking rule prioritizes, since tags are
/// the only slug-shaped attribute an anchor and an event have in common.
/// An anchor with no tags has no cohort, so nothing can match it.
fn in_anchor_cohort(event: &Event, anchor_tags: &BTreeSet<&str>) -> bool {
    !anchor_tags.is_empty() && event.tags.iter().any(|t| anchor_tags.contains(t.as_str()))
}

/// Rank key for dropping: ascending order puts the least-ranked event
/// first, i.e. out-of-cohort before in-cohort, oldest before newest, and
/// (within a tie) the lexicographically greatest id before the least —
/// the exact reverse of the ranking rule's priority order (same-slug
/// cohort first, then recency, then id lexicographic tiebreak).
fn event_drop_key<'a>(event: &'a Event, anchor_tags: &BTreeSet<&str>) -> (u8, &'a str, Reverse<&'a str>) {
    let cohort = u8::from(in_anchor_cohort(event, anchor_tags));
    (cohort, event.timestamp.as_str(), Reverse(event.id.as_str()))
}

/// Drop exactly one piece of evidence: the lowest-ranked event if any
/// remain (out-of-cohort events before same-slug-cohort ones, then
/// oldest first, then id tiebreak), else the oldest preceding
/// transition, else the oldest succeeding transition. Returns the
/// dropped id, or `None` if the bundle is down to just the anchor.
fn drop_lowest_ranked(bundle: &mut EvidenceBundle) -> Option<String> {
    if !bundle.events.is_empty() {
        let anchor_tags: BTreeSet<&str> = bundle.anchor.tags.iter().map(String::as_str).collect();
        let idx = bundle
            .events
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| event_drop_key(e, &anchor_tags))
            .map(|(i, _)| i)
            .expect("events checked non-empty above");
        return Some(bundle.events.remove(idx).id);
    }
    if let Some(idx) = oldest_transition_index(&bundle.transitions.preceding) {
        return Some(bundle.transitions.preceding.remove(idx).id);
    }
    if let Some(idx) = oldest_transition_index(&bundle.transitions.succeeding) {
        return Some(bundle.transitions.succeeding.remove(idx).id);
    }
    None
}

/// Shrink `desired_completion_tokens` by `shrink_factor` until the
/// estimated prompt plus guard plus completion fits the context window,
/// or `max_retries` shrinks have been applied.
fn shrink_max_tokens(prompt_tokens: u32, budget: &BudgetGateConfig) -> u32 {
    let mut max_tokens = budget.desired_completion_tokens;
    let mut attempt = 0;
    while attempt < budget.max_retries
        && prompt_tokens + budget.guard_tokens + max_tokens > budget.context_window
    {
        max_tokens = ((f64::from(max_tokens)) * budget.shrink_factor).floor() as u32;
        attempt += 1;
    }
    max_tokens.max(1)
}

/// Fit `bundle` into `budget`, dropping evidence deterministically until
/// it fits (or nothing more can be dropped), then compute the
/// completion token ceiling for the request.
///
/// Pure and deterministic: identical inputs always produce an identical
/// selection, which the end-to-end truncation-threshold scenario relies
/// on for reproducibility.
#[must_use]
pub fn select(intent: &str, question: &str, mut bundle: EvidenceBundle, budget: &BudgetGateConfig) -> Selection {
    let total_neighbors_found =
        bundle.events.len() + bundle.transitions.preceding.len() + bundle.transitions.succeeding.len();
    let mut dropped_evidence_ids = Vec::new();

    loop {
        bundle.recompute_allowed_ids();
        let envelope = PromptEnvelope {
            intent: intent.to_string(),
            question: question.to_string(),
            allowed_ids: bundle.allowed_ids.clone(),
            evidence: bundle.clone(),
            constraints: PromptConstraints {
                max_tokens: budget.desired_completion_tokens,
            },
        };
        let messages = render_messages(&envelope);
        let prompt_tokens = estimate_tokens(&messages);
        let bytes_len = envelope_bytes(&envelope) as u64;

        let over_token_budget = prompt_tokens + budget.guard_tokens + budget.desired_completion_tokens > budget.context_window;
        let over_byte_ceiling = bytes_len > budget.max_prompt_bytes;
        let past_truncation_threshold = bytes_len > budget.selector_truncation_threshold;

        let must_drop_more = over_token_budget || over_byte_ceiling || past_truncation_threshold;
        if must_drop_more {
            if let Some(dropped) = drop_lowest_ranked(&mut bundle) {
                dropped_evidence_ids.push(dropped);
                continue;
            }
        }

        let final_evidence_count =
            bundle.events.len() + bundle.transitions.preceding.len() + bundle.transitions.succeeding.len();
        let max_tokens = shrink_max_tokens(prompt_tokens, budget);
        return Selection {
            envelope,
            prompt_tokens,
            max_tokens,
            selector_truncation: !dropped_evidence_ids.is_empty(),
            dropped_evidence_ids,
            total_neighbors_found,
            final_evidence_count,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_spec::{Anchor, Event, Transitions};

    fn config() -> BudgetGateConfig {
        BudgetGateConfig {
            context_window: 5_000,
            guard_tokens: 50,
            desired_completion_tokens: 200,
            max_retries: 2,
            shrink_factor: 0.5,
            jitter_pct: 0.1,
            max_prompt_bytes: 1_000_000,
            selector_truncation_threshold: 1_000_000,
        }
    }

    fn bundle_with_events(n: usize) -> EvidenceBundle {
        let events = (0..n)
            .map(|i| Event {
                id: format!("event:{i:03}"),
                summary: "x".repeat(40),
                timestamp: format!("2024-01-01T00:{:02}:{:02}Z", (i / 60) % 24, i % 60),
                snippet: None,
                tags: vec![],
            })
            .collect();
        let mut bundle = EvidenceBundle {
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
            events,
            transitions: Transitions::default(),
            allowed_ids: vec![],
            snapshot_etag: "etag-1".into(),
        };
        bundle.recompute_allowed_ids();
        bundle
    }

    #[test]
    fn keeps_everything_when_it_fits() {
        let bundle = bundle_with_events(1);
        let selection = select("why_decision", "why?", bundle, &config());
        assert!(!selection.selector_truncation);
        assert!(selection.dropped_evidence_ids.is_empty());
    }

    #[test]
    fn drops_oldest_events_first_when_over_budget() {
        let bundle = bundle_with_events(500);
        let selection = select("why_decision", "why?", bundle, &config());
        assert!(selection.selector_truncation);
        // Oldest (lowest index / earliest timestamp) ids are dropped first.
        assert_eq!(selection.dropped_evidence_ids.first(), Some(&"event:000".to_string()));
    }

    #[test]
    fn keeps_same_slug_cohort_events_over_older_non_cohort_ones() {
        let mut bundle = bundle_with_events(0);
        bundle.anchor.tags = vec!["plasma".into()];
        bundle.events = vec![
            Event {
                id: "event:cohort".into(),
                summary: "x".repeat(40),
                timestamp: "2024-01-01T00:00:00Z".into(),
                snippet: None,
                tags: vec!["plasma".into()],
            },
            Event {
                id: "event:newer".into(),
                summary: "x".repeat(40),
                timestamp: "2024-06-01T00:00:00Z".into(),
                snippet: None,
                tags: vec![],
            },
        ];
        bundle.recompute_allowed_ids();
        // The cohort event is oldest by timestamp but must still be dropped
        // after the newer, out-of-cohort event.
        let dropped = drop_lowest_ranked(&mut bundle);
        assert_eq!(dropped, Some("event:newer".to_string()));
        assert_eq!(bundle.events.len(), 1);
        assert_eq!(bundle.events[0].id, "event:cohort");
    }

    #[test]
    fn is_deterministic_across_runs() {
        let a = select("why_decision", "why?", bundle_with_events(500), &config());
        let b = select("why_decision", "why?", bundle_with_events(500), &config());
        assert_eq!(a.dropped_evidence_ids, b.dropped_evidence_ids);
        assert_eq!(a.prompt_tokens, b.prompt_tokens);
        assert_eq!(a.max_tokens, b.max_tokens);
    }

    #[test]
    fn shrinks_max_tokens_when_still_over_after_dropping() {
        let mut tight = config();
        tight.context_window = 40;
        tight.desired_completion_tokens = 30;
        let bundle = bundle_with_events(0);
        let selection = select("why_decision", "why?", bundle, &tight);
        assert!(selection.max_tokens < tight.desired_completion_tokens);
    }
}
