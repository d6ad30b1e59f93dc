//! Templater fallback (§4.7): deterministic, stock-phrase answers used
//! whenever the LLM is off, errored, or the validator couldn't repair
//! its output into a contract-compliant shape.
//!
//! Grounded in the source system's template-registry pattern: phrasing
//! is keyed by whether the anchor carries a rationale, whether any event
//! evidence exists, and whether preceding/succeeding transitions exist.
//! A deployment can override the registry via
//! `GATEWAY_TEMPLATE_REGISTRY_PATH` without a rebuild; otherwise a small
//! built-in default registry is used.

use std::collections::BTreeMap;

use gateway_spec::{Answer, EvidenceBundle};

use crate::error::GatewayError;

/// Which combination of evidence shapes a template is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TemplateKey {
    has_rationale: bool,
    has_events: bool,
    has_preceding: bool,
    has_succeeding: bool,
}

impl TemplateKey {
    fn from_bundle(bundle: &EvidenceBundle) -> Self {
        Self {
            has_rationale: bundle.anchor.rationale.is_some(),
            has_events: !bundle.events.is_empty(),
            has_preceding: bundle.transitions.has_preceding(),
            has_succeeding: bundle.transitions.has_succeeding(),
        }
    }

    /// `"rationale,events,preceding,succeeding"`-style registry key, only
    /// naming the flags that are set (an empty string means none are).
    fn registry_key(self) -> String {
        let mut parts = Vec::new();
        if self.has_rationale {
            parts.push("rationale");
        }
        if self.has_events {
            parts.push("events");
        }
        if self.has_preceding {
            parts.push("preceding");
        }
        if self.has_succeeding {
            parts.push("succeeding");
        }
        parts.join(",")
    }
}

const DEFAULT_STOCK_PHRASE: &str =
    "No rationale was recorded for {title}; this answer reflects only the evidence on file.";

/// A small set of deterministic phrasing templates, keyed by evidence
/// shape. Placeholders `{title}`, `{rationale}`, `{latest_event}` are
/// substituted from the bundle at render time. The evidence counts are
/// not a template placeholder — [`TemplateRegistry::render`] always
/// appends them after the template is filled in.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, String>,
    default_template: String,
}

impl TemplateRegistry {
    /// The built-in registry used when `GATEWAY_TEMPLATE_REGISTRY_PATH`
    /// is unset. Every template leads with the rationale (or the stock
    /// phrase, when the registry falls through to `default_template`) so
    /// the rendered answer always starts with the anchor's own reasoning
    /// rather than its title.
    #[must_use]
    pub fn builtin() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(
            "rationale".to_string(),
            "{rationale}.".to_string(),
        );
        templates.insert(
            "rationale,events".to_string(),
            "{rationale}. Most recently: {latest_event}.".to_string(),
        );
        templates.insert(
            "rationale,preceding".to_string(),
            "{rationale}, superseding an earlier decision.".to_string(),
        );
        templates.insert(
            "rationale,succeeding".to_string(),
            "{rationale}; it was later revisited.".to_string(),
        );
        templates.insert(
            "events".to_string(),
            "No rationale was recorded for {title}. Most recently: {latest_event}.".to_string(),
        );
        Self {
            templates,
            default_template: DEFAULT_STOCK_PHRASE.to_string(),
        }
    }

    /// Load a registry from a JSON file: a flat object mapping a
    /// comma-joined flag key (any of `rationale`, `events`, `preceding`,
    /// `succeeding`, sorted, or omitted entirely for the default) to a
    /// template string. A `"default"` key overrides the built-in stock
    /// phrase.
    ///
    /// # Errors
    /// `GatewayError::Internal` if the file can't be read or doesn't
    /// decode as a JSON object of strings.
    pub async fn load(path: &str) -> Result<Self, GatewayError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to read template registry {path}: {e}")))?;
        let mut parsed: BTreeMap<String, String> = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Internal(format!("malformed template registry {path}: {e}")))?;
        let default_template = parsed
            .remove("default")
            .unwrap_or_else(|| DEFAULT_STOCK_PHRASE.to_string());
        Ok(Self {
            templates: parsed,
            default_template,
        })
    }

    fn template_for(&self, key: TemplateKey) -> &str {
        self.templates
            .get(&key.registry_key())
            .map_or(self.default_template.as_str(), String::as_str)
    }

    /// Render a deterministic answer for `bundle`. `supporting_ids` is
    /// always the full `allowed_ids` set — the templater makes no claim
    /// about relevance, only about what the caller is entitled to see.
    ///
    /// The rendered text always leads with the rationale (or the stock
    /// phrase, when none was recorded) and always ends with the evidence
    /// counts, per the `event_count`/preceding/succeeding accounting
    /// required alongside the answer.
    #[must_use]
    pub fn render(&self, bundle: &EvidenceBundle) -> Answer {
        let key = TemplateKey::from_bundle(bundle);
        let template = self.template_for(key);
        let title = bundle.anchor.title.as_deref().unwrap_or(&bundle.anchor.id);
        let rationale = bundle.anchor.rationale.as_deref().unwrap_or("");
        let rationale = rationale.trim_end_matches('.');
        let latest_event = bundle.latest_event().map_or(String::new(), |e| e.summary.clone());

        let mut short_answer = template
            .replace("{title}", title)
            .replace("{rationale}", rationale)
            .replace("{latest_event}", &latest_event);
        if short_answer.is_empty() {
            short_answer = DEFAULT_STOCK_PHRASE.replace("{title}", title);
        }

        let flags = bundle.completeness_flags();
        short_answer.push_str(&format!(
            " ({} event{}, {} preceding, {} succeeding)",
            flags.event_count,
            if flags.event_count == 1 { "" } else { "s" },
            if flags.has_preceding { "has" } else { "no" },
            if flags.has_succeeding { "has" } else { "no" },
        ));

        let mut answer = Answer {
            short_answer,
            supporting_ids: bundle.allowed_ids.clone(),
        };
        answer.bound_short_answer();
        answer
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_spec::{Anchor, Event, Transition, Transitions};

    fn bundle_with(rationale: Option<&str>, events: Vec<Event>, preceding: bool) -> EvidenceBundle {
        let mut transitions = Transitions::default();
        if preceding {
            transitions.preceding.push(Transition {
                id: "transition:1".into(),
                from: "anchor:0".into(),
                to: "anchor:1".into(),
                relation: "superseded_by".into(),
                reason: None,
                timestamp: "2023-01-01T00:00:00Z".into(),
            });
        }
        let mut b = EvidenceBundle {
            anchor: Anchor {
                id: "anchor:1".into(),
                title: Some("Exit plasma manufacturing".into()),
                option: None,
                rationale: rationale.map(str::to_string),
                timestamp: "2024-01-01T00:00:00Z".into(),
                tags: vec![],
                supported_by: vec![],
                based_on: vec![],
                transitions: vec![],
            },
            events,
            transitions,
            allowed_ids: vec![],
            snapshot_etag: "etag-1".into(),
        };
        b.recompute_allowed_ids();
        b
    }

    #[test]
    fn uses_rationale_template_when_present() {
        let bundle = bundle_with(Some("demand collapsed"), vec![], false);
        let answer = TemplateRegistry::builtin().render(&bundle);
        assert!(answer.short_answer.starts_with("demand collapsed"));
        assert!(answer.short_answer.contains("0 events, no preceding, no succeeding"));
        assert_eq!(answer.supporting_ids, bundle.allowed_ids);
    }

    #[test]
    fn starts_with_rationale_verbatim() {
        let bundle = bundle_with(Some("Because of reasons."), vec![], false);
        let answer = TemplateRegistry::builtin().render(&bundle);
        assert!(answer.short_answer.starts_with("Because of reasons"));
    }

    #[test]
    fn falls_back_to_stock_phrase_without_rationale() {
        let bundle = bundle_with(None, vec![], false);
        let answer = TemplateRegistry::builtin().render(&bundle);
        assert!(answer.short_answer.contains("No rationale was recorded"));
        assert!(answer.short_answer.contains("0 events, no preceding, no succeeding"));
    }

    #[test]
    fn prefers_rationale_plus_events_template() {
        let bundle = bundle_with(
            Some("demand collapsed"),
            vec![Event {
                id: "event:1".into(),
                summary: "plant closure announced".into(),
                timestamp: "2024-02-01T00:00:00Z".into(),
                snippet: None,
                tags: vec![],
            }],
            false,
        );
        let answer = TemplateRegistry::builtin().render(&bundle);
        assert!(answer.short_answer.starts_with("demand collapsed"));
        assert!(answer.short_answer.contains("plant closure announced"));
        assert!(answer.short_answer.contains("1 event, no preceding, no succeeding"));
    }
}
