//! Error types for credential and pool operations

/// Errors from credential store and pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential file I/O: {0}")]
    Io(String),

    #[error("credential file parse: {0}")]
    CredentialParse(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
