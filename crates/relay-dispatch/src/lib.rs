//! Request dispatch over pooled worker sessions
//!
//! Ties the layers together: a [`Dispatcher`] routes each chat request to
//! a session pool by capability, normalizes the prompt to the transport's
//! context budget, and spawns a supervisor task that correlates the
//! worker's shared event firehose back into one ordered output stream,
//! retrying on stalls and failing over on spent quota.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use relay_dispatch::{ChatRequest, Dispatcher, RelayConfig, StreamEvent};
//! use relay_pool::{CredentialStore, SessionPool};
//! use relay_transport::{Capability, WorkerTransport};
//!
//! async fn run(transport: Arc<dyn WorkerTransport>) -> common::Result<()> {
//!     let config = RelayConfig::load("relay.toml").await?;
//!     let store = Arc::new(CredentialStore::load(config.credential_file.clone()).await
//!         .map_err(|e| common::Error::Config(e.to_string()))?);
//!     store.merge_configured(&config.secrets()).await;
//!
//!     let pool = SessionPool::init(config.pool_config(), store, transport);
//!     let dispatcher = Dispatcher::new(vec![pool], config.supervisor_config());
//!
//!     let mut stream = dispatcher.ask(ChatRequest::new(Capability::Chat, "hello"));
//!     while let Some(event) = stream.next().await {
//!         if let StreamEvent::Message { content } = event {
//!             print!("{content}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod prompt;
pub mod request;
pub mod similarity;
pub mod stream;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::RelayConfig;
pub use correlator::{Action, Correlator};
pub use dispatcher::Dispatcher;
pub use prompt::{drop_oldest, normalize, TruncationPolicy};
pub use request::{ChatRequest, Turn, TurnRole};
pub use similarity::{dice_similarity, SimilarityFn, DEFAULT_SIMILARITY_THRESHOLD};
pub use stream::{CollectedResponse, OutputStream, StreamEvent};
pub use supervisor::SupervisorConfig;
