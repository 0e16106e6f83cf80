use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};
use crate::usage_limit::{Principal, UsageRecord};

/// Storage for per-principal daily message counts.
///
/// `increment` must be atomic: for any (principal, date), `n` concurrent calls
/// leave the count exactly `n` higher.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Messages recorded so far; 0 when there is no record
    async fn get_count(&self, principal: &Principal, date: NaiveDate) -> Result<u64, Error>;

    /// Add one message, creating the record if needed. Returns the new count.
    async fn increment(&self, principal: &Principal, date: NaiveDate) -> Result<u64, Error>;

    fn name(&self) -> &'static str;
}

/// Process-local ledger
#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    records: DashMap<(Principal, NaiveDate), UsageRecord>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, principal: &Principal, date: NaiveDate) -> Option<UsageRecord> {
        self.records
            .get(&(principal.clone(), date))
            .map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn get_count(&self, principal: &Principal, date: NaiveDate) -> Result<u64, Error> {
        Ok(self
            .records
            .get(&(principal.clone(), date))
            .map(|r| r.message_count)
            .unwrap_or(0))
    }

    async fn increment(&self, principal: &Principal, date: NaiveDate) -> Result<u64, Error> {
        let now = Utc::now();
        // The entry guard holds the shard write lock, so read-modify-write is atomic
        let mut record = self
            .records
            .entry((principal.clone(), date))
            .or_insert_with(|| UsageRecord::new(principal.clone(), date, now));
        record.message_count += 1;
        record.updated_at = now;
        Ok(record.message_count)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Ledger shared between gateway instances via Redis `INCR`
pub struct RedisUsageStore {
    connection: redis::aio::MultiplexedConnection,
    timeout: Duration,
    /// `EXPIRE` applied on every increment; `None` keeps counters forever
    retention_seconds: Option<i64>,
}

impl RedisUsageStore {
    pub async fn new(
        redis_url: &str,
        timeout: Duration,
        retention: Option<Duration>,
    ) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            Error::new(ErrorDetails::UsageStoreUnavailable {
                backend: "redis".to_string(),
                message: format!("Invalid Redis URL: {}", DisplayOrDebugGateway::new(e)),
            })
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::UsageStoreUnavailable {
                    backend: "redis".to_string(),
                    message: format!("Failed to connect: {}", DisplayOrDebugGateway::new(e)),
                })
            })?;
        info!("Connected to Redis for usage counting");
        Ok(Self {
            connection,
            timeout,
            retention_seconds: retention_seconds(retention),
        })
    }

    /// `usage:{user|ip}:{id}:{YYYY-MM-DD}`
    pub fn key(principal: &Principal, date: NaiveDate) -> String {
        format!("usage:{principal}:{}", date.format("%Y-%m-%d"))
    }

    fn unavailable(&self, key: &str, message: String) -> Error {
        Error::new(ErrorDetails::UsageStoreUnavailable {
            backend: "redis".to_string(),
            message: format!("{message} (key `{key}`)"),
        })
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    async fn get_count(&self, principal: &Principal, date: NaiveDate) -> Result<u64, Error> {
        let key = Self::key(principal, date);
        let mut conn = self.connection.clone();
        match timeout(self.timeout, conn.get::<_, Option<u64>>(&key)).await {
            Ok(Ok(count)) => Ok(count.unwrap_or(0)),
            Ok(Err(e)) => Err(self.unavailable(
                &key,
                format!("GET failed: {}", DisplayOrDebugGateway::new(e)),
            )),
            Err(_) => Err(self.unavailable(
                &key,
                format!("GET timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }

    async fn increment(&self, principal: &Principal, date: NaiveDate) -> Result<u64, Error> {
        let key = Self::key(principal, date);
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().incr(&key, 1);
        if let Some(seconds) = self.retention_seconds {
            pipe.expire(&key, seconds).ignore();
        }
        match timeout(self.timeout, pipe.query_async::<(u64,)>(&mut conn)).await {
            Ok(Ok((count,))) => {
                debug!(key, count, "Incremented usage counter");
                Ok(count)
            }
            Ok(Err(e)) => Err(self.unavailable(
                &key,
                format!("INCR failed: {}", DisplayOrDebugGateway::new(e)),
            )),
            Err(_) => Err(self.unavailable(
                &key,
                format!("INCR timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Seconds for `EXPIRE`, rounded up to a whole second
fn retention_seconds(retention: Option<Duration>) -> Option<i64> {
    retention.map(|retention| {
        let mut seconds = retention.as_secs();
        if retention.subsec_nanos() > 0 {
            seconds += 1;
        }
        i64::try_from(seconds.max(1)).unwrap_or(i64::MAX)
    })
}
