//! Credential bookkeeping and durable storage
//!
//! Manages a JSON file mapping credential ids to quota/health state. The
//! file survives restarts: `invalid` and remaining quota persist, while
//! `consecutive_failures` is forgiven on every load. Writes are atomic
//! (temp file + rename) but not inline: mutators flag a dirty bit and a
//! background flush task coalesces bursts into one write, keeping
//! persistence off the request-serving path.
//!
//! The store is the single source of truth for credential state; the pool
//! reads a snapshot at selection time and routes every mutation through
//! the methods here, serialized by one Mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use common::Secret;
use relay_transport::Capability;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One external-service identity with its usage bookkeeping.
///
/// `quota` maps metered capabilities to the remaining allowance as last
/// observed; capabilities absent from the map are untracked (unlimited as
/// far as selection is concerned). `invalid` is sticky for the process
/// lifetime and beyond: it is persisted and never auto-reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Stable identity, generated once at first sight of the secret.
    pub id: String,
    /// Opaque auth token for the remote service.
    pub secret: Secret<String>,
    #[serde(default)]
    pub quota: HashMap<Capability, u32>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub invalid: bool,
}

impl Credential {
    /// Fresh credential for a newly configured secret.
    pub fn new(secret: Secret<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            secret,
            quota: HashMap::new(),
            consecutive_failures: 0,
            invalid: false,
        }
    }

    /// Remaining tracked allowance for a capability. `None` = untracked.
    pub fn remaining(&self, capability: Capability) -> Option<u32> {
        self.quota.get(&capability).copied()
    }

    /// Selection sort key: untracked counts as unlimited.
    pub fn selection_weight(&self, capability: Capability) -> u32 {
        self.remaining(capability).unwrap_or(u32::MAX)
    }

    /// Whether every tracked bucket has hit zero. Exhaustion across the
    /// board means the subscription is spent; the pool marks such
    /// credentials invalid rather than re-scanning them forever.
    pub fn exhausted(&self) -> bool {
        !self.quota.is_empty() && self.quota.values().all(|v| *v == 0)
    }
}

/// Thread-safe credential file manager with coalesced persistence.
///
/// Mutators update in-memory state and signal `dirty`; the flush task
/// spawned by [`crate::flush::spawn_flush_task`] sleeps a debounce window
/// and then writes one snapshot. A crash inside the window loses at most
/// that window of bookkeeping, which the quota model tolerates.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Credential>>,
    dirty: Notify,
}

impl CredentialStore {
    /// Load credentials from the given file path.
    ///
    /// Missing file cold-starts as `{}`. A restart forgives transient
    /// failures: every loaded credential gets `consecutive_failures = 0`.
    /// `invalid` flags are kept as persisted.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let mut credentials: HashMap<String, Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            for credential in credentials.values_mut() {
                credential.consecutive_failures = 0;
            }
            info!(path = %path.display(), credentials = credentials.len(), "loaded credentials");
            credentials
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let store = HashMap::new();
            // Create the empty file so future loads don't need the cold-start path
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
            dirty: Notify::new(),
        })
    }

    /// Merge configured secrets with the persisted state.
    ///
    /// Secrets already known (matched by value) keep their accumulated
    /// quota and `invalid` flag; unseen secrets get fresh entries with
    /// generated ids. Returns the number of newly added credentials.
    pub async fn merge_configured(&self, secrets: &[Secret<String>]) -> usize {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for secret in secrets {
            if state.values().any(|c| c.secret == *secret) {
                continue;
            }
            let credential = Credential::new(secret.clone());
            debug!(credential_id = credential.id, "registered configured credential");
            state.insert(credential.id.clone(), credential);
            added += 1;
        }
        if added > 0 {
            info!(added, total = state.len(), "merged configured credentials");
            self.dirty.notify_one();
        }
        added
    }

    /// Get a clone of a specific credential.
    pub async fn get(&self, credential_id: &str) -> Option<Credential> {
        let state = self.state.lock().await;
        state.get(credential_id).cloned()
    }

    /// Clone the full credential set for candidate selection.
    pub async fn snapshot(&self) -> Vec<Credential> {
        let state = self.state.lock().await;
        state.values().cloned().collect()
    }

    /// Consume one quota unit for a capability.
    ///
    /// Saturating: a tracked bucket never goes below zero. Untracked
    /// capabilities are a no-op.
    pub async fn consume_quota(&self, credential_id: &str, capability: Capability) -> Result<()> {
        let mut state = self.state.lock().await;
        let credential = state
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        if let Some(remaining) = credential.quota.get_mut(&capability) {
            *remaining = remaining.saturating_sub(1);
            debug!(
                credential_id,
                capability = capability.label(),
                remaining = *remaining,
                "quota consumed"
            );
            self.dirty.notify_one();
        }
        Ok(())
    }

    /// Overlay probed quota numbers onto the tracked buckets.
    ///
    /// Only the probed capabilities are replaced; an empty probe leaves
    /// the persisted numbers alone. This is the one path where quota may
    /// go up (the remote service refreshed its allowance).
    pub async fn set_quota(
        &self,
        credential_id: &str,
        probed: HashMap<Capability, u32>,
    ) -> Result<()> {
        if probed.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let credential = state
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        for (capability, remaining) in probed {
            credential.quota.insert(capability, remaining);
        }
        debug!(credential_id, "quota refreshed from probe");
        self.dirty.notify_one();
        Ok(())
    }

    /// Increment the failure counter, returning the new count.
    pub async fn record_failure(&self, credential_id: &str) -> Result<u32> {
        let mut state = self.state.lock().await;
        let credential = state
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        credential.consecutive_failures += 1;
        let count = credential.consecutive_failures;
        self.dirty.notify_one();
        Ok(count)
    }

    /// Reset the failure counter after a successful turn.
    pub async fn reset_failures(&self, credential_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let credential = state
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        if credential.consecutive_failures != 0 {
            credential.consecutive_failures = 0;
            self.dirty.notify_one();
        }
        Ok(())
    }

    /// Mark a credential invalid. Terminal: nothing in this process ever
    /// clears the flag, and it persists across restarts.
    pub async fn mark_invalid(&self, credential_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let credential = state
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(credential_id.to_string()))?;
        if !credential.invalid {
            credential.invalid = true;
            warn!(credential_id, "credential marked invalid");
            self.dirty.notify_one();
        }
        Ok(())
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait until a mutator signals unpersisted state.
    pub(crate) async fn dirty_notified(&self) {
        self.dirty.notified().await;
    }

    /// Write the current in-memory state to disk.
    ///
    /// Called by the flush task after the debounce window, and directly on
    /// shutdown. Uses atomic write (temp file + rename), 0600 permissions.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.lock().await;
            state.clone()
        };
        write_atomic(&self.path, &snapshot).await
    }
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. This prevents corruption if the process crashes mid-write.
/// Sets file permissions to 0600 (owner read/write only) since the file
/// contains auth secrets.
async fn write_atomic(path: &Path, data: &HashMap<String, Credential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    // Set 0600 permissions (unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
