//! Server configuration with environment variable overrides.

use serde::{Deserialize, Serialize};

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Chunk size in bytes for split frames (default 64 KiB).
    pub chunk_size: usize,
    /// Frames larger than this are sent as split sequences.
    ///
    /// `0` means "use the default of `10 × chunk_size`".
    pub split_threshold: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between server-initiated Ping frames, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long to wait for the identity handshake before closing, in ms.
    pub handshake_timeout_ms: u64,
    /// Hard cap on graceful shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Production mode: error responses omit the diagnostic `stack` field.
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            chunk_size: 64 * 1024,
            split_threshold: 0,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            heartbeat_interval_ms: 30_000,
            handshake_timeout_ms: 10_000,
            shutdown_timeout_ms: 10_000,
            production: false,
        }
    }
}

impl ServerConfig {
    /// Effective split threshold in bytes.
    #[must_use]
    pub fn effective_split_threshold(&self) -> usize {
        if self.split_threshold == 0 {
            self.chunk_size.saturating_mul(10)
        } else {
            self.split_threshold
        }
    }

    /// Defaults with `RELAY_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides (highest priority).
    ///
    /// Invalid or out-of-range values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = read_env_string("RELAY_HOST") {
            self.host = v;
        }
        if let Some(v) = read_env_u16("RELAY_PORT", 0, 65535) {
            self.port = v;
        }
        if let Some(v) = read_env_usize("RELAY_CHUNK_SIZE", 1024, 16 * 1024 * 1024) {
            self.chunk_size = v;
        }
        if let Some(v) = read_env_usize("RELAY_SPLIT_THRESHOLD", 1024, 256 * 1024 * 1024) {
            self.split_threshold = v;
        }
        if let Some(v) = read_env_usize("RELAY_MAX_MESSAGE_SIZE", 1024, 256 * 1024 * 1024) {
            self.max_message_size = v;
        }
        if let Some(v) = read_env_u64("RELAY_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = read_env_u64("RELAY_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
            self.handshake_timeout_ms = v;
        }
        if let Some(v) = read_env_u64("RELAY_SHUTDOWN_TIMEOUT_MS", 100, 600_000) {
            self.shutdown_timeout_ms = v;
        }
        if let Some(v) = read_env_bool("RELAY_PRODUCTION") {
            self.production = v;
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
