#![cfg(feature = "e2e_tests")]
//! Runs against the Redis server at `CHATGATE_REDIS_URL`.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use uuid::Uuid;

use chatgate_internal::config::REDIS_URL_ENV;
use chatgate_internal::usage_limit::{Principal, RedisUsageStore, UsageStore};

const TIMEOUT: Duration = Duration::from_secs(1);

fn redis_url() -> String {
    std::env::var(REDIS_URL_ENV)
        .unwrap_or_else(|_| panic!("`{REDIS_URL_ENV}` must be set for e2e tests"))
}

/// A principal no earlier run has touched
fn fresh_principal() -> Principal {
    Principal::User(format!("e2e-{}", Uuid::now_v7()))
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

async fn key_ttl(key: &str) -> i64 {
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    redis::cmd("TTL").arg(key).query_async(&mut conn).await.unwrap()
}

#[tokio::test]
async fn test_missing_key_counts_zero() {
    let store = RedisUsageStore::new(&redis_url(), TIMEOUT, None).await.unwrap();
    let count = store
        .get_count(&fresh_principal(), date("2025-01-01"))
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_first_increment_creates_counter() {
    let store = RedisUsageStore::new(&redis_url(), TIMEOUT, None).await.unwrap();
    let principal = fresh_principal();
    let day = date("2025-01-01");

    assert_eq!(store.increment(&principal, day).await.unwrap(), 1);
    assert_eq!(store.get_count(&principal, day).await.unwrap(), 1);
    assert_eq!(store.increment(&principal, day).await.unwrap(), 2);
    // Other days are separate counters
    assert_eq!(
        store.get_count(&principal, date("2025-01-02")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_counters_are_kept_without_retention() {
    let store = RedisUsageStore::new(&redis_url(), TIMEOUT, None).await.unwrap();
    let principal = fresh_principal();
    let day = date("2020-01-01");

    store.increment(&principal, day).await.unwrap();
    // -1: the key exists and has no expiry
    assert_eq!(key_ttl(&RedisUsageStore::key(&principal, day)).await, -1);
}

#[tokio::test]
async fn test_retention_sets_expiry() {
    let retention = Duration::from_secs(24 * 60 * 60);
    let store = RedisUsageStore::new(&redis_url(), TIMEOUT, Some(retention))
        .await
        .unwrap();
    let principal = fresh_principal();
    let day = date("2025-01-01");

    store.increment(&principal, day).await.unwrap();
    let ttl = key_ttl(&RedisUsageStore::key(&principal, day)).await;
    assert!(ttl > 0 && ttl <= 24 * 60 * 60, "unexpected TTL {ttl}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_not_lost() {
    let store = Arc::new(
        RedisUsageStore::new(&redis_url(), TIMEOUT, None)
            .await
            .unwrap(),
    );
    let principal = fresh_principal();
    let day = date("2025-01-01");

    let handles: Vec<_> = (0..200)
        .map(|_| {
            let store = store.clone();
            let principal = principal.clone();
            tokio::spawn(async move { store.increment(&principal, day).await })
        })
        .collect();
    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }

    assert_eq!(store.get_count(&principal, day).await.unwrap(), 200);
}
