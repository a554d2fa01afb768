//! Session pool: credential selection and worker slot lifecycle
//!
//! The pool binds credentials to live worker handles, one worker per
//! in-use credential, at most `pool_size` busy at once. The credential
//! store is the single source of truth for quota/health; the pool reads a
//! snapshot at selection time and keeps only the slot state (busy set,
//! idle handles, retired set) itself.
//!
//! Selection prefers the credential with the most remaining quota for the
//! requested capability, ties broken by id so the order is deterministic.
//! Exhaustion is sticky: a credential whose tracked buckets are all zero
//! is marked invalid and never scanned again. There is no queueing: when
//! every slot is busy or no credential is eligible, `acquire` fails fast
//! and the caller surfaces the error.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use relay_transport::{Capability, FailureKind, WorkerHandle, WorkerTransport};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialStore};
use crate::error::{Error, Result};
use crate::flush::spawn_flush_task;

/// Tunables for the pool. All plain numbers, loaded from the TOML surface
/// by the dispatch layer.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrently busy worker sessions.
    pub pool_size: usize,
    /// Consecutive failures before a credential is retired for the rest
    /// of the process lifetime.
    pub max_failures: u32,
    /// Debounce window for coalesced credential persistence.
    pub persist_debounce: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            max_failures: 10,
            persist_debounce: Duration::from_millis(500),
        }
    }
}

/// A live binding between one credential and one worker handle.
///
/// Sessions move by value: `release` and `evict` consume them, so a slot
/// can never be returned twice for the same acquisition.
pub struct Session {
    credential_id: String,
    capability: Capability,
    handle: Arc<dyn WorkerHandle>,
}

impl Session {
    pub fn credential_id(&self) -> &str {
        &self.credential_id
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn handle(&self) -> &Arc<dyn WorkerHandle> {
        &self.handle
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("credential_id", &self.credential_id)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

/// Slot bookkeeping guarded by the pool mutex.
///
/// A credential id in `in_use` is Busy; an entry in `idle` is an Idle
/// worker kept warm for reuse; `retired` holds failure-ceiling exclusions.
/// Destroying is the transient span inside `evict` after the id has left
/// both maps and before `destroy()` resolves.
#[derive(Default)]
struct PoolState {
    in_use: HashSet<String>,
    idle: HashMap<String, Arc<dyn WorkerHandle>>,
    retired: HashSet<String>,
}

enum Picked {
    AllSlotsBusy,
    NoCredential,
    Chosen {
        credential: Credential,
        reused: Option<Arc<dyn WorkerHandle>>,
    },
}

/// Process-scoped pool with explicit lifecycle (`init` / `shutdown`).
pub struct SessionPool {
    config: PoolConfig,
    store: Arc<CredentialStore>,
    transport: Arc<dyn WorkerTransport>,
    state: Mutex<PoolState>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionPool {
    /// Create the pool and start the background persistence task.
    ///
    /// Must run inside a tokio runtime. Configured secrets should already
    /// be merged into the store.
    pub fn init(
        config: PoolConfig,
        store: Arc<CredentialStore>,
        transport: Arc<dyn WorkerTransport>,
    ) -> Arc<Self> {
        let flush = spawn_flush_task(store.clone(), config.persist_debounce);
        info!(
            pool_size = config.pool_size,
            max_failures = config.max_failures,
            transport = transport.id(),
            "session pool initialized"
        );
        Arc::new(Self {
            config,
            store,
            transport,
            state: Mutex::new(PoolState::default()),
            flush_task: Mutex::new(Some(flush)),
        })
    }

    /// Stop the flush task, tear down idle workers, write a final
    /// credential snapshot. Busy sessions stay with their owners.
    pub async fn shutdown(&self) {
        if let Some(task) = self.flush_task.lock().await.take() {
            task.abort();
        }
        let (idle, busy) = {
            let mut state = self.state.lock().await;
            let idle: Vec<_> = state.idle.drain().map(|(_, handle)| handle).collect();
            (idle, state.in_use.len())
        };
        for handle in idle {
            handle.destroy().await;
        }
        if busy > 0 {
            warn!(busy, "shutting down with busy sessions still outstanding");
        }
        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "final credential flush failed");
        }
        info!("session pool shut down");
    }

    /// The credential store backing this pool.
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Prompt budget for a capability, 0 when the transport cannot serve
    /// it. The dispatcher routes on this.
    pub fn context_budget(&self, capability: Capability) -> usize {
        self.transport.context_budget(capability)
    }

    /// Acquire a session for a capability.
    ///
    /// Scans eligible credentials best-quota-first. Establishment failures
    /// increment the credential's failure counter (`Permanent` ones mark
    /// it invalid) and the scan moves to the next candidate; each
    /// candidate is tried at most once per call, so only a fully drained
    /// candidate set or a full busy set fails the call. Never blocks
    /// waiting for a slot.
    pub async fn acquire(&self, capability: Capability) -> Result<Session> {
        let mut attempted: HashSet<String> = HashSet::new();
        loop {
            let snapshot = self.store.snapshot().await;
            let mut newly_exhausted: Vec<String> = Vec::new();

            let picked = {
                let mut state = self.state.lock().await;
                if state.in_use.len() >= self.config.pool_size {
                    Picked::AllSlotsBusy
                } else {
                    let mut candidates: Vec<&Credential> = snapshot
                        .iter()
                        .filter(|c| {
                            !c.invalid
                                && !attempted.contains(&c.id)
                                && !state.retired.contains(&c.id)
                                && !state.in_use.contains(&c.id)
                        })
                        .collect();
                    candidates.retain(|c| {
                        if c.remaining(capability) == Some(0) {
                            if c.exhausted() {
                                newly_exhausted.push(c.id.clone());
                            }
                            false
                        } else {
                            true
                        }
                    });
                    candidates.sort_by(|a, b| {
                        b.selection_weight(capability)
                            .cmp(&a.selection_weight(capability))
                            .then_with(|| a.id.cmp(&b.id))
                    });
                    match candidates.first() {
                        None => Picked::NoCredential,
                        Some(best) => {
                            state.in_use.insert(best.id.clone());
                            let reused = state.idle.remove(&best.id);
                            Picked::Chosen {
                                credential: (*best).clone(),
                                reused,
                            }
                        }
                    }
                }
            };

            // Sticky exhaustion: spent credentials leave the candidate set
            // for good.
            for id in &newly_exhausted {
                if let Err(e) = self.store.mark_invalid(id).await {
                    warn!(credential_id = %id, error = %e, "failed to invalidate exhausted credential");
                }
            }

            match picked {
                Picked::AllSlotsBusy => {
                    metrics::counter!("relay_pool_acquisitions_total", "outcome" => "exhausted")
                        .increment(1);
                    return Err(Error::PoolExhausted(format!(
                        "all {} worker slots busy",
                        self.config.pool_size
                    )));
                }
                Picked::NoCredential => {
                    metrics::counter!("relay_pool_acquisitions_total", "outcome" => "exhausted")
                        .increment(1);
                    return Err(Error::PoolExhausted("no eligible credential".into()));
                }
                Picked::Chosen {
                    credential,
                    reused: Some(handle),
                } => {
                    debug!(
                        credential_id = credential.id,
                        capability = capability.label(),
                        "reusing idle worker"
                    );
                    metrics::counter!("relay_pool_acquisitions_total", "outcome" => "reused")
                        .increment(1);
                    return Ok(Session {
                        credential_id: credential.id,
                        capability,
                        handle,
                    });
                }
                Picked::Chosen {
                    credential,
                    reused: None,
                } => match self.transport.establish(&credential.secret, capability).await {
                    Ok(handle) => {
                        self.refresh_quota(&credential.id, &handle).await;
                        info!(
                            credential_id = credential.id,
                            capability = capability.label(),
                            transport = self.transport.id(),
                            "worker established"
                        );
                        metrics::counter!("relay_pool_acquisitions_total", "outcome" => "established")
                            .increment(1);
                        return Ok(Session {
                            credential_id: credential.id,
                            capability,
                            handle,
                        });
                    }
                    Err(e) => {
                        attempted.insert(credential.id.clone());
                        {
                            let mut state = self.state.lock().await;
                            state.in_use.remove(&credential.id);
                        }
                        metrics::counter!("relay_pool_establish_failures_total", "kind" => e.kind.label())
                            .increment(1);
                        warn!(
                            credential_id = credential.id,
                            error = %e,
                            "worker establishment failed, trying next credential"
                        );
                        if e.kind == FailureKind::Permanent {
                            if let Err(e) = self.store.mark_invalid(&credential.id).await {
                                warn!(credential_id = credential.id, error = %e, "failed to invalidate credential");
                            }
                        } else {
                            match self.store.record_failure(&credential.id).await {
                                Ok(count) if count >= self.config.max_failures => {
                                    self.retire(&credential.id).await;
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!(credential_id = credential.id, error = %e, "failed to record establishment failure");
                                }
                            }
                        }
                        // Establishment failure never terminates the
                        // caller's request; scan continues.
                    }
                },
            }
        }
    }

    /// Return a session after a successful turn.
    ///
    /// Consumes one quota unit for the served capability (unmetered
    /// capabilities are never billed), forgives accumulated failures, and
    /// parks the worker for reuse.
    pub async fn release(&self, session: Session) {
        let Session {
            credential_id,
            capability,
            handle,
        } = session;
        if capability.metered() {
            if let Err(e) = self.store.consume_quota(&credential_id, capability).await {
                warn!(credential_id, error = %e, "failed to consume quota on release");
            }
        }
        if let Err(e) = self.store.reset_failures(&credential_id).await {
            warn!(credential_id, error = %e, "failed to reset failures on release");
        }
        self.park_handle(&credential_id, handle).await;
        debug!(
            credential_id,
            capability = capability.label(),
            "session released"
        );
    }

    /// Return a session without billing a turn.
    ///
    /// For turns that never completed for the caller (abandoned stream):
    /// the slot frees up and the worker is parked for reuse, but quota and
    /// the failure counter are left alone.
    pub async fn park(&self, session: Session) {
        let Session {
            credential_id,
            handle,
            ..
        } = session;
        self.park_handle(&credential_id, handle).await;
        debug!(credential_id, "session parked, turn not billed");
    }

    async fn park_handle(&self, credential_id: &str, handle: Arc<dyn WorkerHandle>) {
        let stale = {
            let mut state = self.state.lock().await;
            state.in_use.remove(credential_id);
            if state.retired.contains(credential_id) {
                true
            } else {
                state.idle.insert(credential_id.to_string(), handle.clone());
                false
            }
        };
        if stale {
            // Credential was retired while the session was out; don't park
            // a worker nothing will ever reuse.
            handle.destroy().await;
        }
    }

    /// Destroy a session's worker.
    ///
    /// `force` additionally invalidates the credential (quota spent, login
    /// lost); otherwise the credential stays eligible and a fresh worker
    /// is established on its next acquisition.
    pub async fn evict(&self, session: Session, force: bool) {
        let Session {
            credential_id,
            handle,
            ..
        } = session;
        {
            let mut state = self.state.lock().await;
            state.in_use.remove(&credential_id);
            state.idle.remove(&credential_id);
        }
        handle.destroy().await;
        metrics::counter!("relay_pool_evictions_total", "forced" => if force { "true" } else { "false" })
            .increment(1);
        if force {
            if let Err(e) = self.store.mark_invalid(&credential_id).await {
                warn!(credential_id, error = %e, "failed to invalidate evicted credential");
            }
            info!(credential_id, "session evicted, credential invalidated");
        } else {
            debug!(credential_id, "session recycled");
        }
    }

    /// Count one failure against the session's credential, retiring it at
    /// the ceiling. Returns the new count.
    pub async fn report_failure(&self, session: &Session) -> u32 {
        match self.store.record_failure(&session.credential_id).await {
            Ok(count) => {
                if count >= self.config.max_failures {
                    self.retire(&session.credential_id).await;
                }
                count
            }
            Err(e) => {
                warn!(credential_id = session.credential_id, error = %e, "failed to record failure");
                0
            }
        }
    }

    /// Pool health summary.
    ///
    /// Per-credential status plus overall health: all usable → healthy,
    /// some usable → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let snapshot = self.store.snapshot().await;
        let state = self.state.lock().await;

        let mut credentials = Vec::new();
        let mut usable = 0usize;
        for credential in &snapshot {
            let status = if state.in_use.contains(&credential.id) {
                "busy"
            } else if credential.invalid {
                "invalid"
            } else if state.retired.contains(&credential.id) {
                "retired"
            } else if state.idle.contains_key(&credential.id) {
                "idle"
            } else {
                "available"
            };
            if !credential.invalid && !state.retired.contains(&credential.id) {
                usable += 1;
            }
            credentials.push(serde_json::json!({
                "id": credential.id,
                "status": status,
                "consecutive_failures": credential.consecutive_failures,
                "quota": credential.quota,
            }));
        }

        let total = snapshot.len();
        let status = if usable == total && total > 0 {
            "healthy"
        } else if usable > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "transport": self.transport.id(),
            "pool_size": self.config.pool_size,
            "slots_busy": state.in_use.len(),
            "credentials_total": total,
            "credentials_usable": usable,
            "credentials": credentials,
        })
    }

    async fn refresh_quota(&self, credential_id: &str, handle: &Arc<dyn WorkerHandle>) {
        match handle.probe_quota().await {
            Ok(probed) => {
                if !probed.is_empty() {
                    if let Err(e) = self.store.set_quota(credential_id, probed).await {
                        warn!(credential_id, error = %e, "failed to store probed quota");
                    }
                }
            }
            Err(e) => {
                debug!(credential_id, error = %e, "quota probe failed, keeping persisted numbers");
            }
        }
    }

    async fn retire(&self, credential_id: &str) {
        let idle = {
            let mut state = self.state.lock().await;
            state.retired.insert(credential_id.to_string());
            state.idle.remove(credential_id)
        };
        if let Some(handle) = idle {
            handle.destroy().await;
        }
        warn!(credential_id, "credential retired after repeated failures");
    }
}
