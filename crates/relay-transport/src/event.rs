//! Raw worker event shape
//!
//! Workers emit conversation updates as whole-text snapshots, possibly
//! interleaved with echoes of the sent prompt and leftovers from prior
//! turns on the same worker. The correlator downstream is responsible for
//! filtering and diffing; this module only defines the wire shape.

use serde::{Deserialize, Serialize};

/// Who authored the text carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventRole {
    /// Echo of the caller's prompt as received by the worker.
    Human,
    /// The worker's reply.
    Agent,
    /// Service chatter (conversation breaks, notices). Never correlated.
    System,
}

/// Whether the carried text is still growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventState {
    Incomplete,
    Complete,
}

/// One raw event observed on a live worker.
///
/// `text` is cumulative, not a delta: each event carries the whole message
/// so far. `correlation_id` ties events to one conversation message; the
/// id of the prompt echo identifies the reply stream for this request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub correlation_id: String,
    pub role: EventRole,
    pub state: EventState,
    pub text: String,
}

impl WorkerEvent {
    /// Convenience constructor used heavily in tests and transports.
    pub fn new(
        correlation_id: impl Into<String>,
        role: EventRole,
        state: EventState,
        text: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            role,
            state,
            text: text.into(),
        }
    }
}
