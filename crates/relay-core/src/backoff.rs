//! Reconnect backoff configuration and delay calculation.
//!
//! Sync-only building blocks; the client drives the actual async retry loop.

use serde::{Deserialize, Serialize};

/// Default maximum reconnect attempts before surfacing a terminal failure.
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Configuration for the reconnect retry loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of reconnect attempts (default: 10).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff in ms (default: 500).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 (default: 0.2).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Calculate exponential backoff delay with explicit randomness.
///
/// Formula: `min(max_delay, base_delay * 2^attempt) * (1 + random * jitter)`
/// where `random` is a value in `[0.0, 1.0)` from the caller's PRNG and
/// `attempt` is the zero-based attempt index.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_delay_ms(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);
    let with_jitter = (capped as f64) * (1.0 + random * jitter_factor);
    with_jitter.round() as u64
}

impl RetryConfig {
    /// Delay before the given zero-based attempt, using caller randomness.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32, random: f64) -> u64 {
        backoff_delay_ms(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(cfg.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        assert_eq!(cfg.max_delay_ms, DEFAULT_MAX_DELAY_MS);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let d0 = backoff_delay_ms(0, 500, 30_000, 0.0, 0.0);
        let d1 = backoff_delay_ms(1, 500, 30_000, 0.0, 0.0);
        let d2 = backoff_delay_ms(2, 500, 30_000, 0.0, 0.0);
        assert_eq!(d0, 500);
        assert_eq!(d1, 1000);
        assert_eq!(d2, 2000);
    }

    #[test]
    fn backoff_caps_at_max() {
        let d = backoff_delay_ms(20, 500, 30_000, 0.0, 0.0);
        assert_eq!(d, 30_000);
    }

    #[test]
    fn jitter_increases_delay() {
        let base = backoff_delay_ms(0, 1000, 30_000, 0.2, 0.0);
        let jittered = backoff_delay_ms(0, 1000, 30_000, 0.2, 0.999);
        assert_eq!(base, 1000);
        assert!(jittered > base);
        assert!(jittered <= 1200);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let d = backoff_delay_ms(u32::MAX, u64::MAX / 2, u64::MAX, 0.0, 0.0);
        assert!(d > 0);
    }

    #[test]
    fn config_delay_uses_fields() {
        let cfg = RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 250,
            jitter_factor: 0.0,
        };
        assert_eq!(cfg.delay_ms(0, 0.0), 100);
        assert_eq!(cfg.delay_ms(1, 0.0), 200);
        assert_eq!(cfg.delay_ms(2, 0.0), 250);
    }

    #[test]
    fn serde_fills_defaults() {
        let cfg: RetryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_retries, DEFAULT_MAX_RETRIES);
        let cfg: RetryConfig = serde_json::from_str(r#"{"maxRetries": 2}"#).unwrap();
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.base_delay_ms, DEFAULT_BASE_DELAY_MS);
    }
}
