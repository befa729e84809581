//! Connection state machine, observable through a watch channel.

use std::fmt;

/// Lifecycle of the controller's single logical connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt in progress.
    Connecting,
    /// Handshake complete; requests flow.
    Connected,
    /// Socket lost; the controller is retrying with backoff.
    Reconnecting,
    /// Closed explicitly by the caller. Terminal.
    Closed,
    /// Every reconnect attempt failed. Terminal.
    Failed,
}

impl ConnectionState {
    /// Whether requests can currently be issued.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// Whether the controller will never connect again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
