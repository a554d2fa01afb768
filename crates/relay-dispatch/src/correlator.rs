//! Stream correlation
//!
//! The worker transport is a shared firehose: events from concurrent
//! conversations, our own echoed prompt, and system chatter all arrive
//! on one subscription. The correlator binds one request to its reply:
//!
//! 1. watch for our prompt echoed back as a human-role event (fuzzy
//!    match, the worker normalizes text) and capture its correlation id
//! 2. from then on accept only agent-role events carrying that id
//! 3. agent events carry cumulative text; diff against what was already
//!    emitted and surface only the new suffix
//! 4. a complete-state agent event closes the request; later events for
//!    the same id are dropped

use relay_transport::{EventRole, EventState, WorkerEvent};
use tracing::{debug, trace};

use relay_pool::limit_exceeded;

use crate::similarity::{dice_similarity, SimilarityFn, DEFAULT_SIMILARITY_THRESHOLD};

/// What the supervisor should do with one observed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Not ours, or nothing new. Drop silently.
    Ignore,
    /// New reply text to forward to the caller.
    Delta(String),
    /// Our reply finished; `trailing` carries any final unseen suffix.
    Complete { trailing: Option<String> },
    /// The reply is a quota-limit notice, not an answer.
    QuotaExhausted,
}

/// Per-request correlation state. One correlator per attempt; retries
/// start fresh.
pub struct Correlator {
    prompt: String,
    similarity: SimilarityFn,
    threshold: f64,
    correlation_id: Option<String>,
    emitted: usize,
    finished: bool,
}

impl Correlator {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self::with_similarity(prompt, dice_similarity, DEFAULT_SIMILARITY_THRESHOLD)
    }

    pub fn with_similarity(
        prompt: impl Into<String>,
        similarity: SimilarityFn,
        threshold: f64,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            similarity,
            threshold,
            correlation_id: None,
            emitted: 0,
            finished: false,
        }
    }

    /// Whether the prompt echo has been seen yet.
    pub fn bound(&self) -> bool {
        self.correlation_id.is_some()
    }

    /// Classify one firehose event.
    pub fn observe(&mut self, event: &WorkerEvent) -> Action {
        if self.finished {
            return Action::Ignore;
        }

        match event.role {
            EventRole::System => Action::Ignore,
            EventRole::Human => self.observe_echo(event),
            EventRole::Agent => self.observe_reply(event),
        }
    }

    fn observe_echo(&mut self, event: &WorkerEvent) -> Action {
        if self.correlation_id.is_some() {
            return Action::Ignore;
        }
        let score = (self.similarity)(&self.prompt, &event.text);
        if score >= self.threshold {
            debug!(
                correlation_id = %event.correlation_id,
                score,
                "bound request to conversation"
            );
            self.correlation_id = Some(event.correlation_id.clone());
        } else {
            trace!(score, "human event did not match prompt echo");
        }
        Action::Ignore
    }

    fn observe_reply(&mut self, event: &WorkerEvent) -> Action {
        let Some(id) = self.correlation_id.as_deref() else {
            // Agent traffic before our echo belongs to someone else.
            return Action::Ignore;
        };
        if event.correlation_id != id {
            return Action::Ignore;
        }

        if limit_exceeded(&event.text) {
            self.finished = true;
            return Action::QuotaExhausted;
        }

        // Cumulative text: emit only the unseen suffix. A shrunk or
        // rewritten body yields nothing rather than duplicate output.
        let suffix = event
            .text
            .get(self.emitted..)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if suffix.is_some() {
            self.emitted = event.text.len();
        }

        match event.state {
            EventState::Incomplete => match suffix {
                Some(delta) => Action::Delta(delta),
                None => Action::Ignore,
            },
            EventState::Complete => {
                self.finished = true;
                Action::Complete { trailing: suffix }
            }
        }
    }
}
