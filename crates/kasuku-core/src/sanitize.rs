//! User-input sanitization
//!
//! Applied to user-authored content at the point of submission, before it
//! enters the transcript or reaches the engine. Assistant output is never
//! re-sanitized.

/// Hard cap on a single user message, in characters.
pub const MAX_INPUT_CHARS: usize = 4000;

/// Strip control characters (newlines and tabs survive), trim surrounding
/// whitespace and cap the length.
pub fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    cleaned.trim().chars().take(MAX_INPUT_CHARS).collect()
}
