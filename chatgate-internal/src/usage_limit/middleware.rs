use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use tracing::{debug, warn};

use crate::cache::EphemeralCache;
use crate::error::Error;
use crate::session::RequestIdentity;
use crate::usage_limit::limiter::today;
use crate::usage_limit::{cache_snapshot, UsageDecision, UsageQuotaCounter, UsageSnapshot};

/// Quota gate for chat-sending routes.
///
/// Rejects with 429 once the daily allowance is used up. Otherwise the decision is
/// stored as a request extension, the inner handler runs, and one message is recorded
/// only if it returned a success status, refreshing the cached usage snapshot.
/// Storage failures fail closed.
pub async fn usage_limit_middleware(
    State((counter, cache)): State<(Arc<UsageQuotaCounter>, Arc<EphemeralCache>)>,
    mut request: Request,
    next: Next,
) -> Result<Response, UsageLimitError> {
    let identity = request
        .extensions()
        .get::<RequestIdentity>()
        .cloned()
        .unwrap_or_default();
    let principal = identity.principal()?;
    let user_type = identity.user_type();
    let date = today();

    let decision = counter
        .check_and_admit(&principal, user_type, date)
        .await?;
    if !decision.admitted {
        warn!(%principal, %user_type, "Rejecting message: daily quota used up");
        return Err(UsageLimitError::QuotaExceeded(decision));
    }

    let limit = decision.limit;
    request.extensions_mut().insert(decision);
    let response = next.run(request).await;
    if !response.status().is_success() {
        debug!(
            %principal,
            status = %response.status(),
            "Handler did not succeed; message not counted"
        );
        return Ok(response);
    }

    let count = counter.increment(&principal, date).await?;
    cache_snapshot(&cache, &principal, date, UsageSnapshot::new(count, limit));
    Ok(response)
}

#[derive(Debug)]
pub enum UsageLimitError {
    QuotaExceeded(UsageDecision),
    Internal(Error),
}

impl From<Error> for UsageLimitError {
    fn from(error: Error) -> Self {
        UsageLimitError::Internal(error)
    }
}

impl IntoResponse for UsageLimitError {
    fn into_response(self) -> Response {
        match self {
            UsageLimitError::QuotaExceeded(decision) => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "error": {
                        "message": format!(
                            "Daily message limit of {} reached",
                            decision.limit
                        ),
                        "type": "usage_limit_error",
                        "code": "message_quota_exceeded"
                    },
                    "remaining": 0,
                    "messagesLimit": decision.limit.as_wire(),
                })),
            )
                .into_response(),
            UsageLimitError::Internal(error) => error.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::usage_limit::{EntitlementsConfig, InMemoryUsageStore, MessageLimit, Principal};
    use axum::body::Body;
    use axum::routing::post;
    use axum::Router;
    use std::net::IpAddr;
    use tower::ServiceExt;

    fn app(counter: Arc<UsageQuotaCounter>, ip: IpAddr) -> Router {
        app_with_cache(
            counter,
            Arc::new(EphemeralCache::new(&CacheConfig::default())),
            ip,
        )
    }

    fn app_with_cache(
        counter: Arc<UsageQuotaCounter>,
        cache: Arc<EphemeralCache>,
        ip: IpAddr,
    ) -> Router {
        Router::new()
            .route("/ok", post(|| async { StatusCode::OK }))
            .route("/fail", post(|| async { StatusCode::BAD_GATEWAY }))
            .layer(axum::middleware::from_fn_with_state(
                (counter, cache),
                usage_limit_middleware,
            ))
            .layer(axum::middleware::from_fn(
                move |mut request: Request, next: Next| async move {
                    request.extensions_mut().insert(RequestIdentity {
                        session: None,
                        client_ip: Some(ip),
                    });
                    next.run(request).await
                },
            ))
    }

    fn post_to(path: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_only_successful_messages_are_counted() {
        let counter = Arc::new(UsageQuotaCounter::new(
            Arc::new(InMemoryUsageStore::new()),
            EntitlementsConfig::default(),
        ));
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let app = app(counter.clone(), ip);

        let response = app.clone().oneshot(post_to("/fail")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let response = app.oneshot(post_to("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let count = counter
            .get_usage_count(&Principal::Ip(ip), today())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_admit_refreshes_cached_snapshot() {
        let counter = Arc::new(UsageQuotaCounter::new(
            Arc::new(InMemoryUsageStore::new()),
            EntitlementsConfig::default(),
        ));
        let cache = Arc::new(EphemeralCache::new(&CacheConfig::default()));
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let principal = Principal::Ip(ip);
        let date = today();
        cache
            .set_as(
                principal.snapshot_cache_key(date),
                &UsageSnapshot::new(0, MessageLimit::Limited(20)),
                None,
            )
            .unwrap();

        app_with_cache(counter, cache.clone(), ip)
            .oneshot(post_to("/ok"))
            .await
            .unwrap();

        let cached = cache
            .get_as::<UsageSnapshot>(principal.snapshot_cache_key(date))
            .unwrap();
        assert_eq!(cached.tokens_used, 1);
        assert_eq!(cached.remaining, 19);
    }

    #[tokio::test]
    async fn test_quota_exhausted_blocks_handler() {
        let mut entitlements = EntitlementsConfig::default();
        entitlements.guest.max_messages_per_day = MessageLimit::Limited(1);
        let counter = Arc::new(UsageQuotaCounter::new(
            Arc::new(InMemoryUsageStore::new()),
            entitlements,
        ));
        let app = app(counter, "1.2.3.4".parse().unwrap());

        let response = app.clone().oneshot(post_to("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(post_to("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_quota_exceeded_response() {
        let response = UsageLimitError::QuotaExceeded(UsageDecision {
            admitted: false,
            remaining: Some(0),
            limit: MessageLimit::Limited(20),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_unidentifiable_response() {
        let error = RequestIdentity::default().principal().unwrap_err();
        let response = UsageLimitError::from(error).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
