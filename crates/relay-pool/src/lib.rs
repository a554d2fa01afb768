//! Worker session pool over scarce external credentials
//!
//! Brokers a small set of credentials (each with a per-capability usage
//! allowance) across many concurrent requests. Each credential backs at
//! most one live worker at a time; the pool hands out sessions, tracks
//! quota and health, and recycles or invalidates credentials as workers
//! fail.
//!
//! Credential lifecycle:
//! 1. Configured secrets are merged into the persisted store at startup
//! 2. `acquire` picks the eligible credential with the most remaining
//!    quota and establishes (or reuses) its worker
//! 3. `release` after a successful turn consumes one quota unit and parks
//!    the worker for reuse
//! 4. Failures increment a per-credential counter; at the ceiling the
//!    credential is retired for the rest of the process
//! 5. Quota exhaustion or lost login invalidates the credential: sticky,
//!    persisted, never auto-reset
//! 6. A background task coalesces state changes into debounced file writes

pub mod credentials;
pub mod error;
pub mod flush;
pub mod pool;
pub mod quota;

pub use credentials::{Credential, CredentialStore};
pub use error::{Error, Result};
pub use flush::spawn_flush_task;
pub use pool::{PoolConfig, Session, SessionPool};
pub use quota::limit_exceeded;
