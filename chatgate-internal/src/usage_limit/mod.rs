pub mod entitlements;
pub mod limiter;
pub mod middleware;
pub mod store;

pub use entitlements::{Entitlement, EntitlementsConfig, MessageLimit};
pub use limiter::{UsageLimiterMetrics, UsageQuotaCounter};
pub use middleware::{usage_limit_middleware, UsageLimitError};
pub use store::{InMemoryUsageStore, RedisUsageStore, UsageStore};

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::cache::{CacheKey, CacheKind, EphemeralCache};

/// The party a daily message count is charged to. Exactly one of user or IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    User(String),
    Ip(IpAddr),
}

impl Principal {
    pub fn kind(&self) -> &'static str {
        match self {
            Principal::User(_) => "user",
            Principal::Ip(_) => "ip",
        }
    }

    /// Key under which this principal's usage snapshot for `date` is cached
    pub fn snapshot_cache_key(&self, date: NaiveDate) -> CacheKey {
        CacheKey::new(
            CacheKind::Custom("usage".to_string()),
            format_args!("{self}:{}", date.format("%Y-%m-%d")),
        )
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(id) => write!(f, "user:{id}"),
            Principal::Ip(ip) => write!(f, "ip:{ip}"),
        }
    }
}

/// One ledger row: messages sent by a principal on one UTC day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub principal: Principal,
    pub date: NaiveDate,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(principal: Principal, date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            principal,
            date,
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageDecision {
    pub admitted: bool,
    /// `None` when the tier is unlimited
    pub remaining: Option<u64>,
    pub limit: MessageLimit,
}

impl UsageDecision {
    pub fn is_allowed(&self) -> bool {
        self.admitted
    }
}

/// Usage as reported to clients. Unlimited values are `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub tokens_used: u64,
    pub messages_limit: i64,
    pub remaining: i64,
    /// Set when the counter could not be read and a conservative answer was substituted
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl UsageSnapshot {
    pub fn new(count: u64, limit: MessageLimit) -> Self {
        let remaining = match limit.remaining(count) {
            Some(remaining) => i64::try_from(remaining).unwrap_or(i64::MAX),
            None => entitlements::UNLIMITED,
        };
        Self {
            tokens_used: count,
            messages_limit: limit.as_wire(),
            remaining,
            degraded: false,
        }
    }
}

/// How long a usage snapshot may be served from cache
pub const USAGE_SNAPSHOT_TTL: Duration = Duration::from_secs(5);

/// Cache `snapshot` as `principal`'s usage on `date` and return the snapshot the cache
/// now holds. Counts only grow within a day, so an already cached snapshot with a count
/// at least as high is kept. Degraded snapshots are never cached.
pub fn cache_snapshot(
    cache: &EphemeralCache,
    principal: &Principal,
    date: NaiveDate,
    snapshot: UsageSnapshot,
) -> UsageSnapshot {
    if snapshot.degraded {
        return snapshot;
    }
    let count = snapshot.tokens_used;
    match cache.set_unless(
        principal.snapshot_cache_key(date),
        snapshot,
        Some(USAGE_SNAPSHOT_TTL),
        |current: &UsageSnapshot| !current.degraded && current.tokens_used >= count,
    ) {
        Ok(cached) => cached,
        Err(e) => {
            warn!(%principal, error = %e, "Failed to cache usage snapshot");
            snapshot
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStoreKind {
    #[default]
    Memory,
    Redis,
}

/// Configuration for the usage ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageConfig {
    /// Which backend keeps the daily counters
    #[serde(default)]
    pub store: UsageStoreKind,

    /// Redis operation timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,

    /// Days a Redis daily counter is kept after its last increment. Unset keeps
    /// counters indefinitely.
    #[serde(default)]
    pub redis_retention_days: Option<u32>,
}

impl UsageConfig {
    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn redis_retention(&self) -> Option<Duration> {
        self.redis_retention_days
            .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60))
    }
}

fn default_redis_timeout_ms() -> u64 {
    100
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            store: UsageStoreKind::default(),
            redis_timeout_ms: default_redis_timeout_ms(),
            redis_retention_days: None,
        }
    }
}
