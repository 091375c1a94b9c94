//! Tunables shared by every tracker created through a [`PresenceRegistry`].
//!
//! [`PresenceRegistry`]: crate::registry::PresenceRegistry

use serde::{Deserialize, Serialize};

/// Presence configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Ask peers to re-send their presence with every outbound message until
    /// the server has confirmed the document's presence channel.
    pub request_until_subscribed: bool,
    /// Maximum ops buffered while catching up a stale remote value.
    /// Exceeding it abandons the catch-up and waits for a fresh value.
    pub max_cached_ops: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            request_until_subscribed: true,
            max_cached_ops: 1024,
        }
    }
}

impl PresenceConfig {
    /// Parse from JSON; missing fields fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
