//! Deterministic, heuristic token estimation (§4.4, §9).
//!
//! Resolved precisely from the source system's token-accounting module:
//! content tokens are `floor(len(text) / 4)`; each message adds a flat
//! per-message overhead of 4 tokens; a single per-prompt overhead of 16
//! tokens is added once, only when the message list is non-empty. This
//! is intentionally simple — it must be stable across languages and
//! implementations, not a precise tokenizer.

const CHARS_PER_TOKEN: usize = 4;
const PER_MESSAGE_OVERHEAD: u32 = 4;
const PER_PROMPT_OVERHEAD: u32 = 16;

/// Estimate the token count of a rendered prompt, given as a list of
/// message contents (e.g. one system message, one user message).
///
/// This is the single function used identically by the budget planner
/// and the gate loop — there must never be a second implementation of
/// this arithmetic.
#[must_use]
pub fn estimate_tokens<S: AsRef<str>>(messages: &[S]) -> u32 {
    if messages.is_empty() {
        return 0;
    }
    let mut total = PER_PROMPT_OVERHEAD;
    for message in messages {
        let content_tokens = (message.as_ref().len() / CHARS_PER_TOKEN) as u32;
        total += content_tokens + PER_MESSAGE_OVERHEAD;
    }
    total
}
