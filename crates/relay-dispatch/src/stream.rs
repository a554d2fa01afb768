//! Output stream plumbing
//!
//! One request produces one ordered stream of `Message` deltas closed by
//! exactly one terminal: `Done` on success, or `Error` followed by an
//! empty `Done` on failure (the wire shape long-poll consumers expect).
//! The sink enforces the single-terminal rule so the correlator and the
//! watchdog can race without double-closing the stream.

use tokio::sync::mpsc;
use tracing::debug;

/// Event visible to the caller of `ask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental reply text.
    Message { content: String },
    /// Success terminal; `content` carries any final trailing text
    /// (usually empty).
    Done { content: String },
    /// Failure notice; always followed by an empty `Done`.
    Error { error: String },
}

/// Create a connected sink/stream pair for one request.
pub fn channel() -> (EventSink, OutputStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx: Some(tx) }, OutputStream { rx })
}

/// Consumer half, owned by the caller.
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl OutputStream {
    /// Next event, `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain the stream into an aggregated response, for callers that
    /// don't want incremental delivery.
    pub async fn collect(mut self) -> CollectedResponse {
        let mut content = String::new();
        let mut error = None;
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Message { content: delta } => content.push_str(&delta),
                StreamEvent::Done { content: trailing } => {
                    content.push_str(&trailing);
                    break;
                }
                StreamEvent::Error { error: reason } => error = Some(reason),
            }
        }
        CollectedResponse { content, error }
    }
}

/// Aggregated result of [`OutputStream::collect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedResponse {
    pub content: String,
    pub error: Option<String>,
}

/// Producer half, owned by the supervisor task.
///
/// Holds the sender until a terminal is emitted; `done`/`fail` drop it,
/// so consumers see the stream end right after the terminal event rather
/// than whenever the producing task happens to exit.
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl EventSink {
    /// Emit a delta. Returns false when the caller abandoned the stream
    /// or a terminal was already sent; the producer should stop.
    pub fn message(&mut self, delta: &str) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        tx.send(StreamEvent::Message {
            content: delta.to_string(),
        })
        .is_ok()
    }

    /// Success terminal. Only the first terminal wins; it closes the
    /// stream.
    pub fn done(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let _ = tx.send(StreamEvent::Done {
            content: String::new(),
        });
    }

    /// Failure terminal: one `Error` plus the empty completion, then the
    /// stream closes. Partial output already emitted stays emitted.
    pub fn fail(&mut self, reason: &str) {
        let Some(tx) = self.tx.take() else {
            debug!("suppressing second terminal for request stream");
            return;
        };
        let _ = tx.send(StreamEvent::Error {
            error: reason.to_string(),
        });
        let _ = tx.send(StreamEvent::Done {
            content: String::new(),
        });
    }

    /// Whether a terminal has been emitted.
    pub fn is_terminated(&self) -> bool {
        self.tx.is_none()
    }

    /// Whether the caller dropped the stream.
    pub fn is_abandoned(&self) -> bool {
        match &self.tx {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}
