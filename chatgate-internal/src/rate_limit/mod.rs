pub mod config;
pub mod limiter;
pub mod middleware;

pub use config::{RateLimitAlgorithm, RateLimitConfig};
pub use limiter::EdgeRateLimiter;
pub use middleware::{rate_limit_middleware, RateLimitError};

use axum::http::{HeaderMap, HeaderValue};
use std::sync::atomic::{AtomicU64, Ordering};

/// Headers returned with rate limit information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,               // Unix timestamp
    pub retry_after: Option<u64>, // Seconds
}

impl RateLimitHeaders {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(self.remaining));
        headers.insert("X-RateLimit-Reset", HeaderValue::from(self.reset));
        if let Some(retry_after) = self.retry_after {
            headers.insert("Retry-After", HeaderValue::from(retry_after));
        }

        headers
    }
}

/// Result of a rate limit check
#[derive(Debug)]
pub enum RateLimitDecision {
    Allow(RateLimitHeaders),
    Deny(RateLimitHeaders),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow(_))
    }

    pub fn headers(&self) -> &RateLimitHeaders {
        match self {
            RateLimitDecision::Allow(h) | RateLimitDecision::Deny(h) => h,
        }
    }
}

/// Metrics for rate limiter monitoring
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub allowed: AtomicU64,
    pub rate_limit_exceeded: AtomicU64,
    pub windows_reset: AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_exceeded(&self) {
        self.rate_limit_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_reset(&self) {
        self.windows_reset.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_headers() {
        let headers = RateLimitHeaders {
            limit: 60,
            remaining: 45,
            reset: 1234567890,
            retry_after: None,
        };

        let header_map = headers.to_header_map();

        assert_eq!(header_map["X-RateLimit-Limit"], "60");
        assert_eq!(header_map["X-RateLimit-Remaining"], "45");
        assert_eq!(header_map["X-RateLimit-Reset"], "1234567890");
        assert!(!header_map.contains_key("Retry-After"));
    }

    #[test]
    fn test_rate_limit_headers_with_retry_after() {
        let headers = RateLimitHeaders {
            limit: 60,
            remaining: 0,
            reset: 1234567890,
            retry_after: Some(42),
        };

        let header_map = headers.to_header_map();
        assert_eq!(header_map["Retry-After"], "42");
    }

    #[test]
    fn test_rate_limit_decision() {
        let headers = RateLimitHeaders {
            limit: 60,
            remaining: 0,
            reset: 1234567890,
            retry_after: Some(60),
        };

        let decision = RateLimitDecision::Deny(headers.clone());
        assert!(!decision.is_allowed());
        assert_eq!(decision.headers().retry_after, Some(60));

        let decision = RateLimitDecision::Allow(headers);
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_rate_limiter_metrics() {
        let metrics = RateLimiterMetrics::default();

        metrics.record_allowed();
        metrics.record_allowed();
        metrics.record_rate_limit_exceeded();
        metrics.record_window_reset();

        assert_eq!(metrics.allowed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.rate_limit_exceeded.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.windows_reset.load(Ordering::Relaxed), 1);
    }
}
