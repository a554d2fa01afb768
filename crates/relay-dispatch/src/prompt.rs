//! Prompt normalization ahead of dispatch
//!
//! Three concerns before a prompt may reach a worker:
//! - role-collision keywords in free text are rewritten so the remote
//!   service does not mistake quoted transcript for turn boundaries
//! - raw hyperlinks are masked so the worker's auto-linker cannot rewrite
//!   them into injected markup
//! - long-context capabilities take one flattened window: serialized
//!   history inside a `<history>` tag block plus the final question,
//!   truncated to the capability's budget by a pluggable policy

use std::sync::OnceLock;

use regex::Regex;

use crate::request::{ChatRequest, Turn, TurnRole};

/// Truncation policy: trims history until it fits the character budget.
pub type TruncationPolicy = fn(Vec<Turn>, usize) -> Vec<Turn>;

/// Rewrite role keywords that collide with the remote turn format.
pub fn sanitize_roles(text: &str) -> String {
    text.replace("assistant", "result")
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\b(https?):(//)").expect("static link pattern"))
}

/// Break auto-linking of raw URLs.
///
/// Inserts a zero-width space between scheme and authority; the text
/// stays readable but no longer parses as a hyperlink on the worker side.
pub fn mask_links(text: &str) -> String {
    link_pattern().replace_all(text, "${1}:\u{200b}${2}").into_owned()
}

/// Default truncation: drop the oldest turns until the rest fits.
pub fn drop_oldest(mut history: Vec<Turn>, budget: usize) -> Vec<Turn> {
    let mut total: usize = history.iter().map(|t| t.content.chars().count()).sum();
    let mut cut = 0;
    while total > budget && cut < history.len() {
        total -= history[cut].content.chars().count();
        cut += 1;
    }
    history.drain(..cut);
    history
}

/// Serialize history and question into one flattened context window.
pub fn flatten_history(history: &[Turn], question: &str) -> String {
    let mut flattened = String::from(
        "Our prior conversation is inside the <history> tag. Answer the question that follows it.\n<history>\n",
    );
    for turn in history {
        let role = match turn.role {
            TurnRole::User => "user",
            TurnRole::Assistant => "result",
        };
        flattened.push_str(role);
        flattened.push_str(": ");
        flattened.push_str(&turn.content);
        flattened.push('\n');
    }
    flattened.push_str("</history>\n");
    flattened.push_str(question);
    flattened
}

/// Produce the wire prompt for a request.
///
/// Applies keyword and link normalization, flattens history for
/// capabilities that take a single context window, and clamps the result
/// to `budget` characters, keeping the tail so the question survives.
pub fn normalize(request: &ChatRequest, budget: usize, truncation: TruncationPolicy) -> String {
    let question = mask_links(&sanitize_roles(&request.prompt));

    let prompt = if request.capability.flat_history() && !request.history.is_empty() {
        let question_len = question.chars().count();
        let history_budget = budget.saturating_sub(question_len);
        let history: Vec<Turn> = request
            .history
            .iter()
            .map(|t| Turn {
                role: t.role,
                content: mask_links(&sanitize_roles(&t.content)),
            })
            .collect();
        let history = truncation(history, history_budget);
        flatten_history(&history, &question)
    } else {
        question
    };

    clamp_tail(prompt, budget)
}

fn clamp_tail(prompt: String, budget: usize) -> String {
    let len = prompt.chars().count();
    if len <= budget {
        return prompt;
    }
    prompt.chars().skip(len - budget).collect()
}
