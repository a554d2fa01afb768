//! Scripted transport doubles shared by the supervisor and dispatcher
//! tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use common::Secret;
use relay_pool::{CredentialStore, PoolConfig, SessionPool};
use relay_transport::{
    BoxFuture, Capability, EventRole, EventState, Result, TransportError, WorkerEvent,
    WorkerHandle, WorkerTransport,
};
use tokio::sync::mpsc;

pub(crate) enum Step {
    SleepMs(u64),
    Emit(WorkerEvent),
}

pub(crate) fn echo(id: &str, text: &str) -> Step {
    Step::Emit(WorkerEvent::new(
        id,
        EventRole::Human,
        EventState::Complete,
        text,
    ))
}

pub(crate) fn partial(id: &str, text: &str) -> Step {
    Step::Emit(WorkerEvent::new(
        id,
        EventRole::Agent,
        EventState::Incomplete,
        text,
    ))
}

pub(crate) fn complete(id: &str, text: &str) -> Step {
    Step::Emit(WorkerEvent::new(
        id,
        EventRole::Agent,
        EventState::Complete,
        text,
    ))
}

/// Replays one script per `send` call into the subscription channel.
pub(crate) struct ScriptedHandle {
    scripts: StdMutex<VecDeque<Vec<Step>>>,
    send_errors: StdMutex<VecDeque<TransportError>>,
    subscriber: StdMutex<Option<mpsc::UnboundedSender<WorkerEvent>>>,
    prompts: StdMutex<Vec<String>>,
    pub(crate) resets: AtomicUsize,
    pub(crate) destroyed: AtomicBool,
}

impl ScriptedHandle {
    pub(crate) fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(scripts.into_iter().collect()),
            send_errors: StdMutex::new(VecDeque::new()),
            subscriber: StdMutex::new(None),
            prompts: StdMutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    pub(crate) fn fail_next_send(&self, error: TransportError) {
        self.send_errors.lock().unwrap().push_back(error);
    }

    /// The prompt text the last `send` call carried.
    pub(crate) fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

impl WorkerHandle for ScriptedHandle {
    fn send<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(error) = self.send_errors.lock().unwrap().pop_front() {
                return Err(error);
            }
            self.prompts.lock().unwrap().push(prompt.to_string());
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            let tx = self.subscriber.lock().unwrap().clone();
            if let Some(tx) = tx {
                tokio::spawn(async move {
                    for step in script {
                        match step {
                            Step::SleepMs(ms) => {
                                tokio::time::sleep(Duration::from_millis(ms)).await;
                            }
                            Step::Emit(event) => {
                                let _ = tx.send(event);
                            }
                        }
                    }
                });
            }
            Ok(())
        })
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<WorkerEvent>>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.subscriber.lock().unwrap() = Some(tx);
            Ok(rx)
        })
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn probe_quota(&self) -> BoxFuture<'_, Result<HashMap<Capability, u32>>> {
        Box::pin(async move { Ok(HashMap::new()) })
    }

    fn destroy(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.destroyed.store(true, Ordering::SeqCst);
        })
    }
}

/// Hands out pre-built handles in order, one per establishment.
pub(crate) struct ScriptedTransport {
    handles: StdMutex<VecDeque<Arc<ScriptedHandle>>>,
    budgets: StdMutex<HashMap<Capability, usize>>,
    pub(crate) established: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(handles: Vec<Arc<ScriptedHandle>>) -> Arc<Self> {
        Arc::new(Self {
            handles: StdMutex::new(handles.into_iter().collect()),
            budgets: StdMutex::new(HashMap::new()),
            established: AtomicUsize::new(0),
        })
    }

    /// Override the context budget for one capability (0 = unsupported).
    pub(crate) fn set_budget(&self, capability: Capability, budget: usize) {
        self.budgets.lock().unwrap().insert(capability, budget);
    }
}

impl WorkerTransport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    fn context_budget(&self, capability: Capability) -> usize {
        self.budgets
            .lock()
            .unwrap()
            .get(&capability)
            .copied()
            .unwrap_or(4000)
    }

    fn establish<'a>(
        &'a self,
        _secret: &'a Secret<String>,
        _capability: Capability,
    ) -> BoxFuture<'a, Result<Arc<dyn WorkerHandle>>> {
        Box::pin(async move {
            self.established.fetch_add(1, Ordering::SeqCst);
            let handle = self
                .handles
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::transient("no scripted handle left"))?;
            Ok(handle as Arc<dyn WorkerHandle>)
        })
    }
}

/// Pool over a fresh temp-file credential store with `secrets` entries.
pub(crate) async fn pool_with(
    transport: Arc<dyn WorkerTransport>,
    secrets: usize,
) -> (Arc<SessionPool>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::load(dir.path().join("credentials.json"))
        .await
        .unwrap();
    let secrets: Vec<Secret<String>> = (0..secrets)
        .map(|i| Secret::new(format!("secret-{i}")))
        .collect();
    store.merge_configured(&secrets).await;
    let pool = SessionPool::init(PoolConfig::default(), Arc::new(store), transport);
    (pool, dir)
}
