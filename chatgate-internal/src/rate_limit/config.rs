use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Algorithm to use for rate limiting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Fixed window counter. Allows bursts of up to twice the limit across a window boundary.
    #[default]
    FixedWindow,
    /// Sliding window counter, weighting the previous window by its remaining overlap
    SlidingWindow,
}

/// Configuration for the per-IP edge rate limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Algorithm to use
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,

    /// Requests allowed per client per window
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// How often stale client windows are dropped, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_requests_per_window() -> u32 {
    60
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            algorithm: RateLimitAlgorithm::default(),
            requests_per_window: default_requests_per_window(),
            window_ms: default_window_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero interval would make `tokio::time::interval` panic
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_config_defaults() {
        let config = RateLimitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.algorithm, RateLimitAlgorithm::FixedWindow);
        assert_eq!(config.requests_per_window, 60);
        assert_eq!(config.window(), Duration::from_secs(60));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let config = RateLimitConfig {
            sweep_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_millis(1));
    }
}
