//! Backoff math for reconnect loops and publish retries.
//!
//! Sync-only building blocks: the async sleep/retry loops live in the
//! components that own a runtime. Delays grow exponentially with jitter,
//! cap at a ceiling, and stay at the ceiling indefinitely — a reconnect
//! loop never gives up on its own.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default ceiling in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;
/// Rebase attempts before a version conflict escalates to the caller.
pub const REBASE_RETRY_BUDGET: u32 = 5;

/// Configuration for exponential backoff.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Base delay for attempt 0, in ms.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling, in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 applied symmetrically around the delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
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

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffConfig {
    /// Delay before the given attempt (0-based), with jitter.
    ///
    /// Attempts past the ceiling keep returning the (jittered) ceiling.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20); // 2^20 * base already dwarfs any ceiling
        let raw = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);

        let jittered = if self.jitter_factor > 0.0 {
            let spread = (raw as f64) * self.jitter_factor;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            ((raw as f64) + offset).max(0.0) as u64
        } else {
            raw
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn delays_double_until_ceiling() {
        let cfg = no_jitter();
        assert_eq!(cfg.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(cfg.delay_for_attempt(4), Duration::from_millis(1000));
    }

    #[test]
    fn ceiling_holds_forever() {
        let cfg = no_jitter();
        assert_eq!(cfg.delay_for_attempt(10), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for_attempt(1_000), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for_attempt(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let cfg = BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 1000,
            jitter_factor: 0.5,
        };
        for _ in 0..100 {
            let d = cfg.delay_for_attempt(0).as_millis() as u64;
            assert!((500..=1500).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let cfg = BackoffConfig {
            base_delay_ms: u64::MAX / 2,
            max_delay_ms: u64::MAX,
            jitter_factor: 0.0,
        };
        // Must not panic
        let _ = cfg.delay_for_attempt(u32::MAX);
    }

    #[test]
    fn serde_defaults_fill_in() {
        let cfg: BackoffConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        assert_eq!(cfg.max_delay_ms, DEFAULT_MAX_DELAY_MS);
    }

    #[test]
    fn rebase_budget_is_five() {
        assert_eq!(REBASE_RETRY_BUDGET, 5);
    }
}
