use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, warn};

use crate::rate_limit::{
    RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, RateLimitHeaders, RateLimiterMetrics,
};

/// Helper function to get current Unix timestamp.
/// Returns 0 if system time is before UNIX_EPOCH (extremely rare).
fn get_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Request counter for one client IP
#[derive(Debug, Clone, Copy)]
struct ClientWindow {
    window_start: Instant,
    count: u32,
    /// Requests counted in the window before `window_start` (sliding window only)
    previous_count: u32,
}

/// Per-IP request throttle kept entirely in memory.
///
/// With the default fixed window, the first request from an IP opens a window and every
/// later request inside it increments the count, including rejected ones. A request
/// arriving more than `window_ms` after the window opened starts a fresh window.
pub struct EdgeRateLimiter {
    windows: Arc<DashMap<IpAddr, ClientWindow>>,
    algorithm: RateLimitAlgorithm,
    limit: u32,
    window: Duration,
    sweep_interval: Duration,
    metrics: Arc<RateLimiterMetrics>,
    sweep_handle: RwLock<Option<JoinHandle<()>>>,
}

impl EdgeRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            algorithm: config.algorithm,
            limit: config.requests_per_window,
            window: config.window(),
            sweep_interval: config.sweep_interval(),
            metrics: Arc::new(RateLimiterMetrics::default()),
            sweep_handle: RwLock::new(None),
        }
    }

    pub fn metrics(&self) -> &RateLimiterMetrics {
        &self.metrics
    }

    /// Number of client IPs with a window in memory
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    pub fn check(&self, ip: IpAddr) -> RateLimitDecision {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> RateLimitDecision {
        let (admitted, count, window_start) = match self.algorithm {
            RateLimitAlgorithm::FixedWindow => self.check_fixed(ip, now),
            RateLimitAlgorithm::SlidingWindow => self.check_sliding(ip, now),
        };

        let reset_in = self
            .window
            .saturating_sub(now.saturating_duration_since(window_start));
        let headers = RateLimitHeaders {
            limit: self.limit,
            remaining: self.limit.saturating_sub(count),
            reset: get_unix_timestamp() + ceil_secs(reset_in),
            retry_after: (!admitted).then(|| ceil_secs(reset_in).max(1)),
        };

        if admitted {
            self.metrics.record_allowed();
            debug!(%ip, count, limit = self.limit, "Rate limit check passed");
            RateLimitDecision::Allow(headers)
        } else {
            self.metrics.record_rate_limit_exceeded();
            warn!(%ip, count, limit = self.limit, "Rate limit exceeded");
            RateLimitDecision::Deny(headers)
        }
    }

    fn check_fixed(&self, ip: IpAddr, now: Instant) -> (bool, u32, Instant) {
        let window = match self.windows.entry(ip) {
            Entry::Vacant(vacant) => *vacant.insert(ClientWindow {
                window_start: now,
                count: 1,
                previous_count: 0,
            }),
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if now.saturating_duration_since(current.window_start) > self.window {
                    current.window_start = now;
                    current.count = 1;
                    self.metrics.record_window_reset();
                } else {
                    current.count = current.count.saturating_add(1);
                }
                *current
            }
        };
        (window.count <= self.limit, window.count, window.window_start)
    }

    /// Weighted two-window estimate. Rejected requests are not counted.
    fn check_sliding(&self, ip: IpAddr, now: Instant) -> (bool, u32, Instant) {
        let mut current = self.windows.entry(ip).or_insert(ClientWindow {
            window_start: now,
            count: 0,
            previous_count: 0,
        });

        let elapsed = now.saturating_duration_since(current.window_start);
        if elapsed > self.window * 2 {
            current.window_start = now;
            current.previous_count = 0;
            current.count = 0;
            self.metrics.record_window_reset();
        } else if elapsed > self.window {
            current.window_start += self.window;
            current.previous_count = current.count;
            current.count = 0;
            self.metrics.record_window_reset();
        }

        let elapsed = now.saturating_duration_since(current.window_start);
        let overlap = 1.0 - (elapsed.as_secs_f64() / self.window.as_secs_f64()).min(1.0);
        let weighted = (f64::from(current.previous_count) * overlap).floor() as u32;
        let estimate = weighted.saturating_add(current.count).saturating_add(1);

        let admitted = estimate <= self.limit;
        if admitted {
            current.count += 1;
        }
        (admitted, estimate, current.window_start)
    }

    /// Drop windows that can no longer affect a decision. Returns how many were removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        sweep_windows(&self.windows, self.algorithm, self.window, now)
    }

    /// Start periodically dropping stale client windows
    pub async fn start_background_sweep(&self) {
        let windows = Arc::clone(&self.windows);
        let algorithm = self.algorithm;
        let window = self.window;
        let period = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut sweep_interval = interval(period);
            loop {
                sweep_interval.tick().await;
                let removed = sweep_windows(&windows, algorithm, window, Instant::now());
                if removed > 0 {
                    debug!(removed, "Swept stale rate limit windows");
                }
            }
        });

        if let Some(previous) = self.sweep_handle.write().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the background sweep task
    pub async fn stop_background_sweep(&self) {
        if let Some(handle) = self.sweep_handle.write().await.take() {
            handle.abort();
        }
    }
}

impl Drop for EdgeRateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.get_mut().take() {
            handle.abort();
        }
    }
}

fn sweep_windows(
    windows: &DashMap<IpAddr, ClientWindow>,
    algorithm: RateLimitAlgorithm,
    window: Duration,
    now: Instant,
) -> usize {
    let max_age = match algorithm {
        RateLimitAlgorithm::FixedWindow => window,
        RateLimitAlgorithm::SlidingWindow => window * 2,
    };
    let before = windows.len();
    windows.retain(|_, w| now.saturating_duration_since(w.window_start) <= max_age);
    before.saturating_sub(windows.len())
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
