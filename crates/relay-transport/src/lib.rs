//! Transport abstraction for external worker sessions
//!
//! Defines the `WorkerTransport` / `WorkerHandle` traits that decouple the
//! session pool and dispatcher from how a worker is actually driven
//! (browser automation, websocket taps, UI interaction all live behind
//! these traits). The core only sees: establish a worker for a credential,
//! send it a prompt, subscribe to its raw event stream, reset its context,
//! destroy it.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn WorkerTransport>` is shared across the pool and supervisor).

pub mod capability;
pub mod event;

pub use capability::Capability;
pub use event::{EventRole, EventState, WorkerEvent};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use common::Secret;
use tokio::sync::mpsc;

/// Boxed future alias used by the dyn-compatible traits below.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Classification of worker failures, driving pool state transitions.
///
/// - `Transient` recycles the worker handle but keeps the credential
/// - `QuotaExhausted` invalidates the credential and fails over
/// - `Permanent` invalidates the credential (lost login, revoked access)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    QuotaExhausted,
    Permanent,
}

impl FailureKind {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::QuotaExhausted => "quota_exhausted",
            FailureKind::Permanent => "permanent",
        }
    }
}

/// Error reported by transport operations.
#[derive(Debug, thiserror::Error)]
#[error("transport failure ({}): {message}", .kind.label())]
pub struct TransportError {
    pub kind: FailureKind,
    pub message: String,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn quota_exhausted(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::QuotaExhausted,
            message: message.into(),
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Factory for live workers, one implementation per remote provider.
///
/// The dispatcher selects a transport by capability (`context_budget > 0`),
/// so provider polymorphism is a registry lookup rather than inheritance.
pub trait WorkerTransport: Send + Sync {
    /// Identifier for logging and health reporting (e.g. "poe", "pika").
    fn id(&self) -> &str;

    /// Maximum prompt budget in characters for a capability.
    ///
    /// Returns 0 when this transport cannot serve the capability; the
    /// dispatcher uses that as the routing predicate.
    fn context_budget(&self, capability: Capability) -> usize;

    /// Bring up a worker authenticated with `secret`, navigated to the
    /// target for `capability`.
    ///
    /// A `Permanent` error means the credential itself is unusable (login
    /// rejected, subscription lapsed) and the pool invalidates it; any
    /// other error counts one establishment failure against the credential.
    fn establish<'a>(
        &'a self,
        secret: &'a Secret<String>,
        capability: Capability,
    ) -> BoxFuture<'a, Result<Arc<dyn WorkerHandle>>>;
}

/// A live, single-occupancy worker bound to one credential.
pub trait WorkerHandle: Send + Sync {
    /// Deliver a prompt to the worker. Completion of this future means the
    /// prompt was submitted, not that the worker acknowledged it; the
    /// acknowledgement arrives as a `Human` echo event on the subscription.
    fn send<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Subscribe to the worker's raw event stream.
    ///
    /// Events may be interleaved, duplicated, or left over from prior
    /// turns; correlation is the consumer's job.
    fn subscribe(&self) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<WorkerEvent>>>;

    /// Clear the worker's conversation context. Best-effort: callers
    /// ignore the error and carry on.
    fn reset(&self) -> BoxFuture<'_, Result<()>>;

    /// Read the remaining per-capability allowance from the worker's
    /// account page. Capabilities absent from the map are unmetered.
    fn probe_quota(&self) -> BoxFuture<'_, Result<HashMap<Capability, u32>>>;

    /// Tear the worker down. Infallible by contract; transports log their
    /// own cleanup problems.
    fn destroy(&self) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display_carries_kind_and_message() {
        let err = TransportError::permanent("login rejected");
        assert_eq!(
            err.to_string(),
            "transport failure (permanent): login rejected"
        );
        assert_eq!(err.kind, FailureKind::Permanent);
    }

    #[test]
    fn failure_kind_labels() {
        assert_eq!(FailureKind::Transient.label(), "transient");
        assert_eq!(FailureKind::QuotaExhausted.label(), "quota_exhausted");
        assert_eq!(FailureKind::Permanent.label(), "permanent");
    }
}
