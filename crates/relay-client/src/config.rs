//! Client configuration.

use relay_core::backoff::RetryConfig;
use relay_core::ids::ClientId;
use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::ConnectionController`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket URL of the server, e.g. `ws://127.0.0.1:4000/ws`.
    pub url: String,
    /// Stable client identity declared at handshake.
    ///
    /// Reusing an identity across processes lets the server evict a stale
    /// predecessor; omit it to get a fresh one.
    #[serde(default)]
    pub client_id: Option<ClientId>,
    /// Chunk size in bytes for split frames and upload data (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Frames larger than this are sent as split sequences.
    ///
    /// `0` means "use the default of `10 × chunk_size`".
    #[serde(default)]
    pub split_threshold: usize,
    /// Reconnect backoff behavior.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

impl ClientConfig {
    /// Config for a URL with defaults everywhere else.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_id: None,
            chunk_size: default_chunk_size(),
            split_threshold: 0,
            retry: RetryConfig::default(),
        }
    }

    /// Effective split threshold in bytes.
    #[must_use]
    pub fn effective_split_threshold(&self) -> usize {
        if self.split_threshold == 0 {
            self.chunk_size.saturating_mul(10)
        } else {
            self.split_threshold
        }
    }
}
