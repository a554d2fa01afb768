//! Quota-exhaustion detection in worker replies
//!
//! The remote service reports a spent allowance inline, as reply text on
//! the conversation itself rather than as a distinct error channel. The
//! correlator checks every matched event against these patterns before
//! diffing, so limit notices are treated as a hard session failure instead
//! of leaking to the caller as output.

/// Limit-notice phrases observed in worker replies.
///
/// Matching any of these means the credential's allowance for the current
/// target is spent: the credential is invalidated and the request fails
/// over to a fresh session.
const LIMIT_PATTERNS: &[&str] = &[
    "exceeded your monthly usage limit",
    "exceeded your daily usage limit",
    "usage limit for this bot",
    "message limit reached",
];

/// Whether reply text is a quota/limit notice rather than an answer.
pub fn limit_exceeded(text: &str) -> bool {
    let lower = text.to_lowercase();
    LIMIT_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}
