//! Request entry point
//!
//! The dispatcher owns one session pool per transport, routes each
//! request to the first pool whose transport supports the requested
//! capability, normalizes the prompt to that transport's context budget,
//! and hands the rest to a spawned supervisor task. `ask` never blocks
//! on the worker: callers get their output stream immediately.

use std::sync::Arc;

use relay_pool::SessionPool;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::prompt::{drop_oldest, normalize, TruncationPolicy};
use crate::request::ChatRequest;
use crate::stream::{channel, OutputStream};
use crate::supervisor::{run_request, SupervisorConfig};

pub struct Dispatcher {
    pools: Vec<Arc<SessionPool>>,
    supervisor: SupervisorConfig,
    truncation: TruncationPolicy,
}

impl Dispatcher {
    pub fn new(pools: Vec<Arc<SessionPool>>, supervisor: SupervisorConfig) -> Self {
        Self {
            pools,
            supervisor,
            truncation: drop_oldest,
        }
    }

    /// Swap the history truncation policy.
    pub fn with_truncation(mut self, truncation: TruncationPolicy) -> Self {
        self.truncation = truncation;
        self
    }

    /// Submit a request.
    ///
    /// Returns the output stream immediately; delivery, retries, and the
    /// terminal event all happen in a background task. Dropping the
    /// stream cancels interest without tearing down the worker.
    pub fn ask(&self, request: ChatRequest) -> OutputStream {
        let (mut sink, stream) = channel();
        let request_id = Uuid::new_v4();

        let Some(pool) = self
            .pools
            .iter()
            .find(|p| p.context_budget(request.capability) > 0)
        else {
            metrics::counter!("relay_dispatch_requests_total", "outcome" => "unroutable")
                .increment(1);
            sink.fail(&format!(
                "no transport supports capability {}",
                request.capability.label()
            ));
            return stream;
        };

        let budget = pool.context_budget(request.capability);
        let prompt = normalize(&request, budget, self.truncation);
        debug!(
            %request_id,
            capability = request.capability.label(),
            prompt_chars = prompt.chars().count(),
            "request dispatched"
        );

        let span = info_span!("request", %request_id, capability = request.capability.label());
        tokio::spawn(
            run_request(
                pool.clone(),
                prompt,
                request.capability,
                sink,
                self.supervisor.clone(),
            )
            .instrument(span),
        );
        stream
    }

    /// Aggregated health of every pool.
    pub async fn health(&self) -> serde_json::Value {
        let mut pools = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            pools.push(pool.health().await);
        }
        serde_json::json!({ "pools": pools })
    }

    /// Stop background tasks and destroy idle workers.
    pub async fn shutdown(&self) {
        for pool in &self.pools {
            pool.shutdown().await;
        }
    }
}
