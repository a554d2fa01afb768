//! Per-request supervision: watchdog and bounded retry
//!
//! One supervisor task drives one request end to end. It acquires a
//! session, runs the correlated event loop under a rolling watchdog
//! deadline, and reacts to each outcome: completion releases the session
//! back to the pool, a quota notice force-evicts and resubmits on another
//! credential, and stalls or transport failures recycle the session and
//! retry up to a bound before the caller sees a failure.

use std::sync::Arc;
use std::time::Duration;

use relay_pool::{Session, SessionPool};
use relay_transport::{Capability, FailureKind};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::correlator::{Action, Correlator};
use crate::similarity::{dice_similarity, SimilarityFn, DEFAULT_SIMILARITY_THRESHOLD};
use crate::stream::EventSink;

/// Supervision tunables.
#[derive(Clone)]
pub struct SupervisorConfig {
    /// Rolling inactivity deadline; any correlated or uncorrelated event
    /// pushes it forward.
    pub watchdog_timeout: Duration,
    /// Retries after the first attempt before the request fails.
    pub max_retries: u32,
    /// Echo-matching predicate and acceptance threshold.
    pub similarity: SimilarityFn,
    pub similarity_threshold: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(20),
            max_retries: 3,
            similarity: dice_similarity,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

enum Outcome {
    Completed,
    Stalled,
    TransportFailed(String),
    QuotaExhausted,
    Abandoned,
}

/// Drive one request to a terminal on `sink`.
///
/// Always emits exactly one terminal (unless the caller abandons the
/// stream first); partial output already forwarded stays forwarded.
pub async fn run_request(
    pool: Arc<SessionPool>,
    prompt: String,
    capability: Capability,
    mut sink: EventSink,
    config: SupervisorConfig,
) {
    let mut attempt: u32 = 0;
    loop {
        let session = match pool.acquire(capability).await {
            Ok(session) => session,
            Err(e) => {
                metrics::counter!("relay_dispatch_requests_total", "outcome" => "rejected")
                    .increment(1);
                sink.fail(&e.to_string());
                return;
            }
        };
        debug!(
            credential_id = session.credential_id(),
            attempt, "attempt started"
        );

        match run_attempt(&session, &prompt, &mut sink, &config).await {
            Outcome::Completed => {
                // Clear conversation context before the worker is parked.
                if let Err(e) = session.handle().reset().await {
                    warn!(credential_id = session.credential_id(), error = %e, "post-turn reset failed");
                }
                pool.release(session).await;
                metrics::counter!("relay_dispatch_requests_total", "outcome" => "completed")
                    .increment(1);
                sink.done();
                return;
            }
            Outcome::Abandoned => {
                debug!(
                    credential_id = session.credential_id(),
                    "caller abandoned the stream"
                );
                // The turn never completed for the caller; free the slot
                // without billing quota.
                pool.park(session).await;
                metrics::counter!("relay_dispatch_requests_total", "outcome" => "abandoned")
                    .increment(1);
                return;
            }
            Outcome::QuotaExhausted => {
                // The credential is spent; resubmit transparently on the
                // next one. Not counted against the retry budget.
                info!(
                    credential_id = session.credential_id(),
                    "quota notice from worker, failing over"
                );
                pool.evict(session, true).await;
                metrics::counter!("relay_dispatch_failovers_total").increment(1);
            }
            Outcome::Stalled => {
                warn!(
                    credential_id = session.credential_id(),
                    attempt, "watchdog expired"
                );
                recycle(&pool, session).await;
                attempt += 1;
                if attempt > config.max_retries {
                    metrics::counter!("relay_dispatch_requests_total", "outcome" => "timed_out")
                        .increment(1);
                    sink.fail("worker stalled and retries are exhausted");
                    return;
                }
                metrics::counter!("relay_dispatch_retries_total", "cause" => "stall").increment(1);
            }
            Outcome::TransportFailed(reason) => {
                warn!(
                    credential_id = session.credential_id(),
                    attempt,
                    error = %reason,
                    "attempt failed"
                );
                recycle(&pool, session).await;
                attempt += 1;
                if attempt > config.max_retries {
                    metrics::counter!("relay_dispatch_requests_total", "outcome" => "failed")
                        .increment(1);
                    sink.fail(&reason);
                    return;
                }
                metrics::counter!("relay_dispatch_retries_total", "cause" => "transport")
                    .increment(1);
            }
        }
    }
}

/// Count the failure and destroy the worker; the credential stays
/// eligible for a fresh establishment unless it hits the ceiling.
async fn recycle(pool: &SessionPool, session: Session) {
    if let Err(e) = session.handle().reset().await {
        debug!(credential_id = session.credential_id(), error = %e, "reset before recycle failed");
    }
    pool.report_failure(&session).await;
    pool.evict(session, false).await;
}

async fn run_attempt(
    session: &Session,
    prompt: &str,
    sink: &mut EventSink,
    config: &SupervisorConfig,
) -> Outcome {
    let handle = session.handle();

    let mut events = match handle.subscribe().await {
        Ok(rx) => rx,
        Err(e) => return Outcome::TransportFailed(format!("subscribe failed: {e}")),
    };
    // Fresh context for this turn, regardless of what the reused worker
    // saw before.
    if let Err(e) = handle.reset().await {
        return Outcome::TransportFailed(format!("reset failed: {e}"));
    }
    if let Err(e) = handle.send(prompt).await {
        if e.kind == FailureKind::QuotaExhausted {
            return Outcome::QuotaExhausted;
        }
        return Outcome::TransportFailed(format!("send failed: {e}"));
    }

    let mut correlator =
        Correlator::with_similarity(prompt, config.similarity, config.similarity_threshold);
    let mut deadline = Instant::now() + config.watchdog_timeout;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return Outcome::TransportFailed("worker event stream closed".into());
                };
                // Any traffic proves the worker is alive.
                deadline = Instant::now() + config.watchdog_timeout;
                match correlator.observe(&event) {
                    Action::Ignore => {}
                    Action::Delta(delta) => {
                        if !sink.message(&delta) {
                            return Outcome::Abandoned;
                        }
                    }
                    Action::Complete { trailing } => {
                        if let Some(trailing) = trailing {
                            if !sink.message(&trailing) {
                                return Outcome::Abandoned;
                            }
                        }
                        return Outcome::Completed;
                    }
                    Action::QuotaExhausted => return Outcome::QuotaExhausted,
                }
            }
            _ = sleep_until(deadline) => {
                return Outcome::Stalled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    use relay_transport::{EventRole, EventState, TransportError, WorkerEvent};

    use super::*;
    use crate::stream::{channel, StreamEvent};
    use crate::testutil::{complete, echo, partial, pool_with, ScriptedHandle, ScriptedTransport, Step};

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            watchdog_timeout: Duration::from_secs(5),
            ..SupervisorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_streams_deltas_and_completes() {
        let handle = ScriptedHandle::new(vec![vec![
            echo("conv-1", "what is rust"),
            partial("conv-1", "Rust is"),
            partial("conv-1", "Rust is a language"),
            complete("conv-1", "Rust is a language."),
        ]]);
        let (pool, _dir) = pool_with(ScriptedTransport::new(vec![handle.clone()]), 1).await;
        let (sink, stream) = channel();

        run_request(
            pool.clone(),
            "what is rust".into(),
            Capability::Chat,
            sink,
            config(),
        )
        .await;

        let collected = stream.collect().await;
        assert_eq!(collected.content, "Rust is a language.");
        assert_eq!(collected.error, None);
        // Success parks the worker instead of destroying it.
        assert!(!handle.destroyed.load(Ordering::SeqCst));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_conversation_traffic_is_filtered_out() {
        let handle = ScriptedHandle::new(vec![vec![
            Step::Emit(WorkerEvent::new(
                "conv-9",
                EventRole::Agent,
                EventState::Incomplete,
                "someone else's reply",
            )),
            echo("conv-1", "my question"),
            Step::Emit(WorkerEvent::new(
                "conv-9",
                EventRole::Agent,
                EventState::Complete,
                "someone else's reply, finished",
            )),
            partial("conv-1", "mine"),
            complete("conv-1", "mine."),
        ]]);
        let (pool, _dir) = pool_with(ScriptedTransport::new(vec![handle]), 1).await;
        let (sink, stream) = channel();

        run_request(
            pool.clone(),
            "my question".into(),
            Capability::Chat,
            sink,
            config(),
        )
        .await;

        let collected = stream.collect().await;
        assert_eq!(collected.content, "mine.");
        assert_eq!(collected.error, None);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stall_retries_on_a_fresh_worker() {
        // First worker binds then goes silent past the watchdog window;
        // the second answers.
        let stalling = ScriptedHandle::new(vec![vec![
            echo("conv-1", "q"),
            partial("conv-1", "par"),
            Step::SleepMs(60_000),
        ]]);
        let healthy = ScriptedHandle::new(vec![vec![
            echo("conv-2", "q"),
            complete("conv-2", "full answer"),
        ]]);
        let transport = ScriptedTransport::new(vec![stalling.clone(), healthy]);
        let (pool, _dir) = pool_with(transport.clone(), 1).await;
        let (sink, stream) = channel();

        run_request(pool.clone(), "q".into(), Capability::Chat, sink, config()).await;

        let collected = stream.collect().await;
        assert_eq!(collected.error, None);
        assert!(collected.content.ends_with("full answer"));
        assert!(stalling.destroyed.load(Ordering::SeqCst));
        assert_eq!(transport.established.load(Ordering::SeqCst), 2);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_one_error() {
        let scripts = |id: String| vec![vec![echo(&id, "q"), Step::SleepMs(60_000)]];
        let handles: Vec<_> = (0..4)
            .map(|i| ScriptedHandle::new(scripts(format!("conv-{i}"))))
            .collect();
        let (pool, _dir) = pool_with(ScriptedTransport::new(handles), 1).await;
        let (sink, mut stream) = channel();

        run_request(pool.clone(), "q".into(), Capability::Chat, sink, config()).await;

        let mut errors = 0;
        let mut dones = 0;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Error { .. } => errors += 1,
                StreamEvent::Done { content } => {
                    assert!(content.is_empty());
                    dones += 1;
                }
                StreamEvent::Message { .. } => {}
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(dones, 1);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn quota_notice_fails_over_without_surfacing() {
        let spent = ScriptedHandle::new(vec![vec![
            echo("conv-1", "q"),
            complete("conv-1", "You have exceeded your daily usage limit for this bot."),
        ]]);
        let fresh = ScriptedHandle::new(vec![vec![
            echo("conv-2", "q"),
            complete("conv-2", "real answer"),
        ]]);
        let (pool, _dir) = pool_with(ScriptedTransport::new(vec![spent.clone(), fresh]), 2).await;
        let (sink, stream) = channel();

        run_request(pool.clone(), "q".into(), Capability::Chat, sink, config()).await;

        let collected = stream.collect().await;
        assert_eq!(collected.content, "real answer");
        assert_eq!(collected.error, None);
        assert!(spent.destroyed.load(Ordering::SeqCst));

        // Force-eviction invalidated the spent credential.
        let invalid = pool
            .store()
            .snapshot()
            .await
            .iter()
            .filter(|c| c.invalid)
            .count();
        assert_eq!(invalid, 1);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_retries_then_succeeds() {
        let flaky = ScriptedHandle::new(vec![vec![
            echo("conv-2", "q"),
            complete("conv-2", "after retry"),
        ]]);
        flaky.fail_next_send(TransportError::transient("connection reset"));
        let recovered = ScriptedHandle::new(vec![vec![
            echo("conv-3", "q"),
            complete("conv-3", "after retry"),
        ]]);
        let (pool, _dir) =
            pool_with(ScriptedTransport::new(vec![flaky, recovered]), 1).await;
        let (sink, stream) = channel();

        run_request(pool.clone(), "q".into(), Capability::Chat, sink, config()).await;

        let collected = stream.collect().await;
        assert_eq!(collected.content, "after retry");
        assert_eq!(collected.error, None);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_stream_releases_the_session() {
        let handle = ScriptedHandle::new(vec![vec![
            echo("conv-1", "q"),
            partial("conv-1", "some output"),
            Step::SleepMs(1_000),
            partial("conv-1", "some output, more"),
            complete("conv-1", "some output, more."),
        ]]);
        let (pool, _dir) = pool_with(ScriptedTransport::new(vec![handle.clone()]), 1).await;
        let (sink, stream) = channel();
        drop(stream);

        run_request(pool.clone(), "q".into(), Capability::Chat, sink, config()).await;

        // The slot is free again: a second request can acquire.
        let session = pool.acquire(Capability::Chat).await.unwrap();
        pool.release(session).await;
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn completion_consumes_quota() {
        let handle = ScriptedHandle::new(vec![vec![
            echo("conv-1", "q"),
            complete("conv-1", "answer"),
        ]]);
        let (pool, _dir) = pool_with(ScriptedTransport::new(vec![handle]), 1).await;
        let credential_id = pool.store().snapshot().await[0].id.clone();
        pool.store()
            .set_quota(
                &credential_id,
                HashMap::from([(Capability::Advanced, 5u32)]),
            )
            .await
            .unwrap();
        let (sink, stream) = channel();

        run_request(pool.clone(), "q".into(), Capability::Advanced, sink, config()).await;
        stream.collect().await;

        let snapshot = pool.store().snapshot().await;
        assert_eq!(snapshot[0].remaining(Capability::Advanced), Some(4));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_turn_is_not_billed() {
        let handle = ScriptedHandle::new(vec![vec![
            echo("conv-1", "q"),
            partial("conv-1", "output nobody reads"),
        ]]);
        let (pool, _dir) = pool_with(ScriptedTransport::new(vec![handle]), 1).await;
        let credential_id = pool.store().snapshot().await[0].id.clone();
        pool.store()
            .set_quota(
                &credential_id,
                HashMap::from([(Capability::Advanced, 5u32)]),
            )
            .await
            .unwrap();
        let (sink, stream) = channel();
        drop(stream);

        run_request(pool.clone(), "q".into(), Capability::Advanced, sink, config()).await;

        let snapshot = pool.store().snapshot().await;
        assert_eq!(
            snapshot[0].remaining(Capability::Advanced),
            Some(5),
            "abandoned turn must not consume quota"
        );
        pool.shutdown().await;
    }
}
