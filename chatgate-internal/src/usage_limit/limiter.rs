use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use crate::error::Error;
use crate::session::UserType;
use crate::usage_limit::{
    EntitlementsConfig, MessageLimit, Principal, UsageDecision, UsageSnapshot, UsageStore,
};

/// Metrics for usage limiter
#[derive(Debug, Default)]
pub struct UsageLimiterMetrics {
    pub admitted: AtomicU64,
    pub denied: AtomicU64,
    pub store_errors: AtomicU64,
}

impl UsageLimiterMetrics {
    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// The current UTC calendar day, which keys every usage record
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Daily message quota over a `UsageStore` and the tier entitlement table
pub struct UsageQuotaCounter {
    store: Arc<dyn UsageStore>,
    entitlements: EntitlementsConfig,
    metrics: UsageLimiterMetrics,
}

impl UsageQuotaCounter {
    pub fn new(store: Arc<dyn UsageStore>, entitlements: EntitlementsConfig) -> Self {
        Self {
            store,
            entitlements,
            metrics: UsageLimiterMetrics::default(),
        }
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn metrics(&self) -> &UsageLimiterMetrics {
        &self.metrics
    }

    pub fn resolve_limit(&self, user_type: UserType) -> MessageLimit {
        self.entitlements.get(user_type).max_messages_per_day
    }

    pub async fn get_usage_count(
        &self,
        principal: &Principal,
        date: NaiveDate,
    ) -> Result<u64, Error> {
        self.store.get_count(principal, date).await.inspect_err(|_| {
            self.metrics.record_store_error();
        })
    }

    /// Decide whether `principal` may send one more message on `date`.
    /// Does not record anything; call `increment` once the message went through.
    pub async fn check_and_admit(
        &self,
        principal: &Principal,
        user_type: UserType,
        date: NaiveDate,
    ) -> Result<UsageDecision, Error> {
        let limit = self.resolve_limit(user_type);
        if limit.is_unlimited() {
            self.metrics.record_admitted();
            return Ok(UsageDecision {
                admitted: true,
                remaining: None,
                limit,
            });
        }

        let count = self.get_usage_count(principal, date).await?;
        let admitted = limit.admits(count);
        if admitted {
            self.metrics.record_admitted();
            debug!(%principal, count, %limit, "Message quota check passed");
        } else {
            self.metrics.record_denied();
            warn!(%principal, count, %limit, "Message quota exceeded");
        }

        Ok(UsageDecision {
            admitted,
            remaining: limit.remaining(count),
            limit,
        })
    }

    pub async fn increment(&self, principal: &Principal, date: NaiveDate) -> Result<u64, Error> {
        let count = self
            .store
            .increment(principal, date)
            .await
            .inspect_err(|_| self.metrics.record_store_error())?;
        debug!(%principal, count, "Recorded message");
        Ok(count)
    }

    pub async fn status(
        &self,
        principal: &Principal,
        user_type: UserType,
        date: NaiveDate,
    ) -> Result<UsageSnapshot, Error> {
        let count = self.get_usage_count(principal, date).await?;
        Ok(UsageSnapshot::new(count, self.resolve_limit(user_type)))
    }

    /// Like `status`, but a store failure yields the guest limit with nothing remaining
    pub async fn status_or_fallback(
        &self,
        principal: &Principal,
        user_type: UserType,
        date: NaiveDate,
    ) -> UsageSnapshot {
        match self.status(principal, user_type, date).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(%principal, error = %e, "Serving fallback usage snapshot");
                self.fallback_snapshot()
            }
        }
    }

    pub fn fallback_snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            tokens_used: 0,
            messages_limit: self.resolve_limit(UserType::Guest).as_wire(),
            remaining: 0,
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDetails;
    use crate::usage_limit::InMemoryUsageStore;
    use async_trait::async_trait;
    use tracing_test::traced_test;

    struct FailingStore;

    #[async_trait]
    impl UsageStore for FailingStore {
        async fn get_count(&self, _: &Principal, _: NaiveDate) -> Result<u64, Error> {
            Err(Error::new(ErrorDetails::UsageStoreUnavailable {
                backend: "failing".to_string(),
                message: "connection refused".to_string(),
            }))
        }

        async fn increment(&self, _: &Principal, _: NaiveDate) -> Result<u64, Error> {
            Err(Error::new(ErrorDetails::UsageStoreUnavailable {
                backend: "failing".to_string(),
                message: "connection refused".to_string(),
            }))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn counter() -> UsageQuotaCounter {
        UsageQuotaCounter::new(
            Arc::new(InMemoryUsageStore::new()),
            EntitlementsConfig::default(),
        )
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    async fn send(counter: &UsageQuotaCounter, principal: &Principal, day: NaiveDate, n: u64) {
        for _ in 0..n {
            counter.increment(principal, day).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_denied_at_limit() {
        let counter = counter();
        let principal = Principal::User("u-1".to_string());
        let day = date("2025-01-01");
        send(&counter, &principal, day, 20).await;

        let decision = counter
            .check_and_admit(&principal, UserType::Guest, day)
            .await
            .unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.remaining, Some(0));
        assert_eq!(decision.limit, MessageLimit::Limited(20));
    }

    #[tokio::test]
    async fn test_last_message_admitted_then_denied() {
        let counter = counter();
        let principal = Principal::User("u-1".to_string());
        let day = date("2025-01-01");
        send(&counter, &principal, day, 19).await;

        let decision = counter
            .check_and_admit(&principal, UserType::Guest, day)
            .await
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, Some(1));

        counter.increment(&principal, day).await.unwrap();
        let decision = counter
            .check_and_admit(&principal, UserType::Guest, day)
            .await
            .unwrap();
        assert!(!decision.admitted);
        assert_eq!(counter.metrics().denied.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_admin_is_unlimited() {
        let counter = counter();
        let principal = Principal::User("admin".to_string());
        let day = date("2025-01-01");
        send(&counter, &principal, day, 10_000).await;

        let decision = counter
            .check_and_admit(&principal, UserType::Admin, day)
            .await
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, None);

        let snapshot = counter
            .status(&principal, UserType::Admin, day)
            .await
            .unwrap();
        assert_eq!(snapshot.tokens_used, 10_000);
        assert_eq!(snapshot.messages_limit, -1);
        assert_eq!(snapshot.remaining, -1);
    }

    #[tokio::test]
    async fn test_guest_ip_new_day_starts_from_zero() {
        let counter = counter();
        let principal = Principal::Ip("1.2.3.4".parse().unwrap());
        let day_one = date("2025-01-01");
        let day_two = date("2025-01-02");

        for _ in 0..20 {
            let decision = counter
                .check_and_admit(&principal, UserType::Guest, day_one)
                .await
                .unwrap();
            assert!(decision.admitted);
            counter.increment(&principal, day_one).await.unwrap();
        }
        let decision = counter
            .check_and_admit(&principal, UserType::Guest, day_one)
            .await
            .unwrap();
        assert!(!decision.admitted);

        assert_eq!(counter.get_usage_count(&principal, day_two).await.unwrap(), 0);
        let decision = counter
            .check_and_admit(&principal, UserType::Guest, day_two)
            .await
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, Some(20));
    }

    #[tokio::test]
    async fn test_tier_limits_come_from_entitlements() {
        let mut entitlements = EntitlementsConfig::default();
        entitlements.regular.max_messages_per_day = MessageLimit::Limited(2);
        let counter = UsageQuotaCounter::new(Arc::new(InMemoryUsageStore::new()), entitlements);

        assert_eq!(
            counter.resolve_limit(UserType::Regular),
            MessageLimit::Limited(2)
        );
        assert_eq!(
            counter.resolve_limit(UserType::Pro),
            MessageLimit::Limited(500)
        );
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let counter = counter();
        let principal = Principal::User("u-1".to_string());
        let day = date("2025-01-01");
        send(&counter, &principal, day, 3).await;

        let snapshot = counter
            .status(&principal, UserType::Pro, day)
            .await
            .unwrap();
        assert_eq!(snapshot, UsageSnapshot::new(3, MessageLimit::Limited(500)));
        assert!(!snapshot.degraded);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_failure_falls_back_to_guest() {
        let counter = UsageQuotaCounter::new(Arc::new(FailingStore), EntitlementsConfig::default());
        let principal = Principal::User("u-1".to_string());
        let day = date("2025-01-01");

        let err = counter
            .check_and_admit(&principal, UserType::Pro, day)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let snapshot = counter
            .status_or_fallback(&principal, UserType::Pro, day)
            .await;
        assert_eq!(snapshot.messages_limit, 20);
        assert_eq!(snapshot.remaining, 0);
        assert!(snapshot.degraded);
        assert_eq!(counter.metrics().store_errors.load(Ordering::Relaxed), 2);
        assert!(logs_contain("Serving fallback usage snapshot"));
    }
}
