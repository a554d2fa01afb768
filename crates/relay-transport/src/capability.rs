//! Capability routing and context budgets
//!
//! A capability names the service variant a request wants. It selects the
//! worker target the transport navigates to, the quota bucket the pool
//! charges, and the shape of the context window the dispatcher assembles.

use serde::{Deserialize, Serialize};

/// Requested service variant.
///
/// `Chat` is the unmetered baseline. The other variants are metered: the
/// remote service tracks a per-account remaining count for each, which the
/// pool mirrors in the credential quota map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Baseline chat target, no usage metering.
    Chat,
    /// Large-context chat target.
    ChatLong,
    /// Premium target with a small monthly allowance.
    Advanced,
    /// Premium large-context target.
    AdvancedLong,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Chat,
        Capability::ChatLong,
        Capability::Advanced,
        Capability::AdvancedLong,
    ];

    /// Label for logging and health reporting.
    pub fn label(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::ChatLong => "chat-long",
            Capability::Advanced => "advanced",
            Capability::AdvancedLong => "advanced-long",
        }
    }

    /// Whether the remote service meters this capability per account.
    ///
    /// Unmetered capabilities never appear in the credential quota map and
    /// never drive exhaustion-based invalidation.
    pub fn metered(&self) -> bool {
        !matches!(self, Capability::Chat)
    }

    /// Whether this capability takes one flattened context window instead
    /// of structured turns. Long-context targets accept a single combined
    /// prompt with the history serialized inline.
    pub fn flat_history(&self) -> bool {
        matches!(self, Capability::ChatLong | Capability::AdvancedLong)
    }
}
