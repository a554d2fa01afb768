//! Common types for the worker session relay

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
