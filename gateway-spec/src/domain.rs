//! Core domain entities: anchors, events, transitions, evidence bundles,
//! prompt envelopes, answers, and the final signed response.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// `true` if `id` matches the canonical anchor-id slug shape
/// `^[a-z0-9][a-z0-9_-]{2,}[a-z0-9]$`: lowercase alphanumerics, `_`, and
/// `-`, starting and ending with an alphanumeric, at least 4 chars total.
/// Implemented as a hand-rolled byte scan rather than a regex — this is
/// the resolver's hot-path fast path and the rule is small and fixed.
#[must_use]
pub fn is_valid_anchor_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.len() < 4 {
        return false;
    }
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes
        .iter()
        .all(|&b| is_alnum(b) || b == b'_' || b == b'-')
}

/// The decision under question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Anchor {
    /// Canonical slug id, see [`is_valid_anchor_id`].
    pub id: String,
    /// Human-readable title. Mirrored from `option` at the evidence layer
    /// when absent (never at persistence — the raw upstream shape is what
    /// gets written to `evidence_pre.json`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// The option this anchor represents, as returned by the memory
    /// service. Source for `title` mirroring when `title` is absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
    /// Why the decision was made, in the source system's own words.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// RFC-3339 UTC timestamp with a `Z` suffix.
    pub timestamp: String,
    /// Free-form slugified tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Ids of anchors/events that support this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_by: Vec<String>,
    /// Ids of anchors/events this one is based on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub based_on: Vec<String>,
    /// Ids of transitions touching this anchor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<String>,
}

impl Anchor {
    /// Mirror `option` into `title` when `title` is absent. Only ever
    /// called at the evidence-building layer, never when replaying a
    /// persisted artefact.
    pub fn mirror_title_from_option(&mut self) {
        if self.title.is_none() {
            if let Some(option) = &self.option {
                self.title = Some(option.clone());
            }
        }
    }
}

/// A one-hop neighbor of a decision on a `LED_TO` relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event id.
    pub id: String,
    /// Short description.
    pub summary: String,
    /// RFC-3339 UTC timestamp with a `Z` suffix.
    pub timestamp: String,
    /// Optional excerpt, bounded to 120 chars by the evidence builder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Slugified tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

const EVENT_SNIPPET_MAX_CHARS: usize = 120;

impl Event {
    /// Bound `snippet` to [`EVENT_SNIPPET_MAX_CHARS`] characters.
    pub fn bound_snippet(&mut self) {
        if let Some(snippet) = &mut self.snippet {
            if snippet.chars().count() > EVENT_SNIPPET_MAX_CHARS {
                *snippet = snippet.chars().take(EVENT_SNIPPET_MAX_CHARS).collect();
            }
        }
    }

    /// Sort key used for the deterministic tie-break: ascending
    /// timestamp, then ascending id (byte-wise lexicographic).
    #[must_use]
    pub fn sort_key(&self) -> (&str, &str) {
        (&self.timestamp, &self.id)
    }
}

/// An ordered link between two decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transition {
    /// Source anchor id.
    pub from: String,
    /// Destination anchor id.
    pub to: String,
    /// Relation label, e.g. `"superseded_by"`.
    pub relation: String,
    /// Why the transition happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// RFC-3339 UTC timestamp with a `Z` suffix.
    pub timestamp: String,
    /// Id of this transition, used in `allowed_ids`/`supporting_ids`.
    pub id: String,
}

impl Transition {
    /// Sort key used for the deterministic tie-break.
    #[must_use]
    pub fn sort_key(&self) -> (&str, &str) {
        (&self.timestamp, &self.id)
    }
}

/// Transitions split by direction relative to the anchor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transitions {
    /// Transitions where `to == anchor.id`.
    #[serde(default)]
    pub preceding: Vec<Transition>,
    /// Transitions where `from == anchor.id`.
    #[serde(default)]
    pub succeeding: Vec<Transition>,
}

impl Transitions {
    /// Iterate over every transition, preceding first, in id order
    /// within each group.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.preceding.iter().chain(self.succeeding.iter())
    }

    /// `true` when there is at least one preceding transition.
    #[must_use]
    pub fn has_preceding(&self) -> bool {
        !self.preceding.is_empty()
    }

    /// `true` when there is at least one succeeding transition.
    #[must_use]
    pub fn has_succeeding(&self) -> bool {
        !self.succeeding.is_empty()
    }
}

/// The full evidence collected for an anchor.
///
/// `snapshot_etag` is intentionally not part of this struct's wire
/// representation (`#[serde(skip)]`): the spec requires it never appear
/// as a top-level bundle field. It travels alongside the bundle in code
/// (set from upstream headers) and is surfaced only under `meta`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceBundle {
    /// The decision under question.
    pub anchor: Anchor,
    /// One-hop event neighbors, ordered per [`Event::sort_key`].
    #[serde(default)]
    pub events: Vec<Event>,
    /// One-hop transition neighbors.
    #[serde(default)]
    pub transitions: Transitions,
    /// Exact set union of anchor id, event ids, and transition ids, in
    /// the canonical order (anchor, then events, then transitions).
    #[serde(default)]
    pub allowed_ids: Vec<String>,
    /// Opaque version marker from the memory service. Never serialized
    /// as part of this struct.
    #[serde(skip)]
    pub snapshot_etag: String,
}

impl EvidenceBundle {
    /// Recompute `allowed_ids` as the exact set union `{anchor.id} ∪
    /// {event ids} ∪ {transition ids}`, in canonical order, and write it
    /// back onto `self`. Returns `true` if the stored value changed.
    pub fn recompute_allowed_ids(&mut self) -> bool {
        let recomputed = self.compute_allowed_ids();
        let changed = recomputed != self.allowed_ids;
        self.allowed_ids = recomputed;
        changed
    }

    /// The exact set union in canonical order, without mutating `self`.
    #[must_use]
    pub fn compute_allowed_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(1 + self.events.len() + self.transitions.preceding.len() + self.transitions.succeeding.len());
        let mut seen = BTreeSet::new();
        seen.insert(self.anchor.id.clone());
        ids.push(self.anchor.id.clone());
        let mut sorted_events: Vec<&Event> = self.events.iter().collect();
        sorted_events.sort_by_key(|e| e.sort_key());
        for event in sorted_events {
            if seen.insert(event.id.clone()) {
                ids.push(event.id.clone());
            }
        }
        for transition in self.transitions.iter() {
            if seen.insert(transition.id.clone()) {
                ids.push(transition.id.clone());
            }
        }
        ids
    }

    /// Deduplicate `events` by id, keeping the first occurrence, then
    /// sort by [`Event::sort_key`].
    pub fn dedupe_and_sort_events(&mut self) {
        let mut seen = BTreeSet::new();
        self.events.retain(|e| seen.insert(e.id.clone()));
        self.events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    /// Completeness flags computed from the current state of the bundle.
    #[must_use]
    pub fn completeness_flags(&self) -> CompletenessFlags {
        CompletenessFlags {
            event_count: self.events.len(),
            has_preceding: self.transitions.has_preceding(),
            has_succeeding: self.transitions.has_succeeding(),
        }
    }

    /// The most recent event by timestamp, if any.
    #[must_use]
    pub fn latest_event(&self) -> Option<&Event> {
        self.events.iter().max_by_key(|e| e.sort_key())
    }
}

/// What the LLM (or templater) is asked to answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptEnvelope {
    /// Request intent, e.g. `"why_decision"`.
    pub intent: String,
    /// The question being asked, verbatim.
    pub question: String,
    /// The bundle being reasoned over.
    pub evidence: EvidenceBundle,
    /// Flattened for convenience; identical to `evidence.allowed_ids`.
    pub allowed_ids: Vec<String>,
    /// Token budget constraints.
    pub constraints: PromptConstraints,
}

/// Token budget constraints attached to a [`PromptEnvelope`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptConstraints {
    /// Maximum completion tokens requested of the LLM.
    pub max_tokens: u32,
}

/// The strict Why-Decision answer contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Answer {
    /// Bounded to 320 chars by the validator.
    pub short_answer: String,
    /// Must be a subset of `allowed_ids`, must contain the anchor id,
    /// and must contain every transition id in the bundle.
    pub supporting_ids: Vec<String>,
}

const SHORT_ANSWER_MAX_CHARS: usize = 320;

impl Answer {
    /// Truncate `short_answer` to [`SHORT_ANSWER_MAX_CHARS`] chars,
    /// appending an ellipsis when truncation occurred. Returns `true` if
    /// truncation was necessary.
    pub fn bound_short_answer(&mut self) -> bool {
        if self.short_answer.chars().count() <= SHORT_ANSWER_MAX_CHARS {
            return false;
        }
        let budget = SHORT_ANSWER_MAX_CHARS - 1;
        let truncated: String = self.short_answer.chars().take(budget).collect();
        self.short_answer = format!("{truncated}\u{2026}");
        true
    }
}

/// Counts and flags computed from the final evidence bundle, never
/// supplied by the LLM.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletenessFlags {
    /// Number of events in the bundle.
    pub event_count: usize,
    /// Whether any preceding transition exists.
    pub has_preceding: bool,
    /// Whether any succeeding transition exists.
    pub has_succeeding: bool,
}

/// Structured repair codes emitted by the validator. Serialized as
/// `snake_case` strings so `validator_report.json` and log lines stay
/// stable across versions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepairCode {
    /// `allowed_ids` did not equal the recomputed exact set union.
    AllowedIdsExactUnionViolation,
    /// A `supporting_ids` entry was not in `allowed_ids` and was dropped.
    SupportingIdsRemovedInvalid,
    /// The anchor id was missing from `supporting_ids` and was added.
    SupportingIdsMissingAnchor,
    /// A transition id was missing from `supporting_ids` and was added.
    SupportingIdsMissingTransition,
    /// `CITE_ALL_IDS` forced `supporting_ids := allowed_ids`.
    SupportingIdsEnforcedCiteAllIds,
    /// An item in `events` did not have event shape and was dropped.
    EventsDroppedNonEvent,
    /// `completeness_flags` did not match the bundle and was recomputed.
    CompletenessEventCountMismatch,
}

/// Why the templater fallback was used instead of (or after) the LLM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// `OPENAI_DISABLED` was set.
    LlmOff,
    /// The LLM call failed (non-2xx, timeout, or undecodable JSON).
    LlmError,
    /// The validator could not repair the LLM's answer into a
    /// contract-compliant one.
    ValidatorFailed,
    /// A stage deadline fired.
    Timeout,
}

/// Per-stage deadlines (§5) and the `stage_timeouts_total{stage}` metric
/// label.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Resolver's memory text-resolve call.
    Search,
    /// Evidence builder's expand-candidates call.
    Expand,
    /// Evidence builder's per-neighbor enrichment calls.
    Enrich,
    /// Validator pass.
    Validate,
    /// LLM invocation.
    Llm,
}

impl StageName {
    /// Stable lowercase label used in metrics and log lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Search => "search",
            StageName::Expand => "expand",
            StageName::Enrich => "enrich",
            StageName::Validate => "validate",
            StageName::Llm => "llm",
        }
    }
}

/// The detached Ed25519 signature over a response's `covered` digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    /// Always `"ed25519"`.
    pub alg: String,
    /// Identifies which signing key was used (`GATEWAY_SIGN_KEY_ID`).
    pub key_id: String,
    /// Base64-encoded raw signature bytes.
    pub sig: String,
    /// Hex sha256 of the canonical response with `meta.bundle_fp`
    /// removed. `bundle_fp == "sha256:" + covered`.
    pub covered: String,
    /// RFC-3339 UTC timestamp with a `Z` suffix.
    pub signed_at: String,
}

/// Fingerprints, bookkeeping, and audit metadata attached to every
/// response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meta {
    /// Request id, used as the artefact-persistence prefix.
    pub request_id: String,
    /// `sha256:`-prefixed fingerprint of the prompt envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_fp: Option<String>,
    /// `sha256:`-prefixed fingerprint of the response (this field
    /// excluded). Absent while being computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_fp: Option<String>,
    /// Opaque version marker from the memory service.
    pub snapshot_etag: String,
    /// `sha256:`-prefixed fingerprint of the policy decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_fp: Option<String>,
    /// `sha256:`-prefixed fingerprint of `allowed_ids`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_ids_fp: Option<String>,
    /// Estimated prompt tokens actually rendered.
    pub prompt_tokens: u32,
    /// Prompt token ceiling enforced by the budget gate for this
    /// request (may have shrunk from the configured default).
    pub max_prompt_tokens: u32,
    /// Ids dropped by the selector to fit the budget.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_evidence_ids: Vec<String>,
    /// Whether the selector had to drop any evidence.
    pub selector_truncation: bool,
    /// Neighbor count before selection.
    pub total_neighbors_found: usize,
    /// Evidence count after selection.
    pub final_evidence_count: usize,
    /// Total attempts made by the evidence builder's retry policy.
    pub retries: u32,
    /// Whether the templater fallback was used instead of (or after)
    /// the LLM.
    pub fallback_used: bool,
    /// Populated iff `fallback_used`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
    /// Structured repair codes emitted by the validator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repair_codes: Vec<RepairCode>,
    /// Wall-clock request latency in milliseconds.
    pub latency_ms: u64,
    /// `GATEWAY_VERSION`, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_version: Option<String>,
    /// Present once the response is signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    /// `true` iff the gateway is currently load-shedding.
    #[serde(default, skip_serializing_if = "is_false")]
    pub load_shed: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The full signed, audited answer to a why-decision question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    /// Request intent, e.g. `"why_decision"`.
    pub intent: String,
    /// The evidence the answer was derived from.
    pub evidence: EvidenceBundle,
    /// The validated (and possibly repaired or templated) answer.
    pub answer: Answer,
    /// Counts and flags recomputed from `evidence`, never from the LLM.
    pub completeness_flags: CompletenessFlags,
    /// Fingerprints, bookkeeping, and signature.
    pub meta: Meta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_id_pattern_accepts_and_rejects() {
        assert!(is_valid_anchor_id("panasonic-exit-plasma-2012"));
        assert!(is_valid_anchor_id("abcd"));
        assert!(!is_valid_anchor_id("abc"));
        assert!(!is_valid_anchor_id("ab"));
        assert!(!is_valid_anchor_id("Abc-def"));
        assert!(!is_valid_anchor_id("-abc"));
        assert!(!is_valid_anchor_id("abc-"));
    }

    #[test]
    fn title_mirrors_from_option_only_when_absent() {
        let mut a = Anchor {
            id: "x-y-z".into(),
            title: None,
            option: Some("Exit plasma manufacturing".into()),
            rationale: None,
            timestamp: "2012-01-01T00:00:00Z".into(),
            tags: vec![],
            supported_by: vec![],
            based_on: vec![],
            transitions: vec![],
        };
        a.mirror_title_from_option();
        assert_eq!(a.title.as_deref(), Some("Exit plasma manufacturing"));

        let mut b = a.clone();
        b.option = Some("something else".into());
        b.mirror_title_from_option();
        assert_eq!(b.title.as_deref(), Some("Exit plasma manufacturing"));
    }

    fn sample_bundle() -> EvidenceBundle {
        EvidenceBundle {
            anchor: Anchor {
                id: "panasonic-exit-plasma-2012".into(),
                title: Some("Exit plasma".into()),
                option: None,
                rationale: Some("Because of reasons.".into()),
                timestamp: "2012-01-01T00:00:00Z".into(),
                tags: vec![],
                supported_by: vec![],
                based_on: vec![],
                transitions: vec![],
            },
            events: vec![
                Event {
                    id: "evt-b".into(),
                    summary: "second".into(),
                    timestamp: "2012-02-01T00:00:00Z".into(),
                    snippet: None,
                    tags: vec![],
                },
                Event {
                    id: "evt-a".into(),
                    summary: "first".into(),
                    timestamp: "2012-01-15T00:00:00Z".into(),
                    snippet: None,
                    tags: vec![],
                },
            ],
            transitions: Transitions::default(),
            allowed_ids: vec![],
            snapshot_etag: "etag-1".into(),
        }
    }

    #[test]
    fn allowed_ids_is_anchor_then_events_ascending() {
        let mut bundle = sample_bundle();
        bundle.dedupe_and_sort_events();
        bundle.recompute_allowed_ids();
        assert_eq!(
            bundle.allowed_ids,
            vec!["panasonic-exit-plasma-2012", "evt-a", "evt-b"]
        );
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let mut bundle = sample_bundle();
        bundle.events.push(Event {
            id: "evt-a".into(),
            summary: "duplicate".into(),
            timestamp: "2012-03-01T00:00:00Z".into(),
            snippet: None,
            tags: vec![],
        });
        bundle.dedupe_and_sort_events();
        assert_eq!(bundle.events.len(), 2);
        assert_eq!(bundle.events[0].summary, "first");
    }

    #[test]
    fn snapshot_etag_never_serializes() {
        let bundle = sample_bundle();
        let v = serde_json::to_value(&bundle).unwrap();
        assert!(v.get("snapshot_etag").is_none());
    }

    #[test]
    fn short_answer_truncates_with_ellipsis() {
        let mut answer = Answer {
            short_answer: "x".repeat(400),
            supporting_ids: vec![],
        };
        assert!(answer.bound_short_answer());
        assert_eq!(answer.short_answer.chars().count(), 320);
        assert!(answer.short_answer.ends_with('\u{2026}'));
    }

    #[test]
    fn short_answer_untouched_when_within_bound() {
        let mut answer = Answer {
            short_answer: "short".into(),
            supporting_ids: vec![],
        };
        assert!(!answer.bound_short_answer());
        assert_eq!(answer.short_answer, "short");
    }
}
