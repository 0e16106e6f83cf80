use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use crate::cache::EphemeralCache;
use crate::config::{Config, REDIS_URL_ENV};
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::rate_limit::{rate_limit_middleware, EdgeRateLimiter};
use crate::session::{attach_session, SessionResolver, StaticTokenResolver};
use crate::usage_limit::{
    usage_limit_middleware, InMemoryUsageStore, RedisUsageStore, UsageQuotaCounter, UsageStore,
    UsageStoreKind,
};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub cache: Arc<EphemeralCache>,
    pub usage_counter: Arc<UsageQuotaCounter>,
    pub rate_limiter: Option<Arc<EdgeRateLimiter>>,
    pub session_resolver: Arc<dyn SessionResolver>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let redis_url = std::env::var(REDIS_URL_ENV).ok();
        Self::new_with_redis_url(config, redis_url).await
    }

    pub async fn new_with_redis_url(
        config: Arc<Config>,
        redis_url: Option<String>,
    ) -> Result<Self, Error> {
        let store = setup_usage_store(&config, redis_url.as_deref()).await?;
        let usage_counter = Arc::new(UsageQuotaCounter::new(
            store,
            config.entitlements.clone(),
        ));
        let rate_limiter = setup_rate_limiter(&config).await;
        let cache = Arc::new(EphemeralCache::new(&config.cache));
        let session_resolver: Arc<dyn SessionResolver> =
            Arc::new(StaticTokenResolver::new(&config.sessions));

        Ok(Self {
            config,
            cache,
            usage_counter,
            rate_limiter,
            session_resolver,
        })
    }
}

pub async fn setup_usage_store(
    config: &Config,
    redis_url: Option<&str>,
) -> Result<Arc<dyn UsageStore>, Error> {
    match config.usage.store {
        UsageStoreKind::Memory => {
            tracing::info!("Using in-memory usage store; counts are lost on restart");
            Ok(Arc::new(InMemoryUsageStore::new()))
        }
        UsageStoreKind::Redis => {
            let Some(redis_url) = redis_url else {
                return Err(Error::new(ErrorDetails::AppState {
                    message: format!("`usage.store = \"redis\"` requires `{REDIS_URL_ENV}` to be set"),
                }));
            };
            let store = RedisUsageStore::new(
                redis_url,
                config.usage.redis_timeout(),
                config.usage.redis_retention(),
            )
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::AppState {
                    message: format!("Failed to set up Redis usage store: {e}"),
                })
            })?;
            Ok(Arc::new(store))
        }
    }
}

/// Build the edge rate limiter and start its sweep task, or `None` if disabled
pub async fn setup_rate_limiter(config: &Config) -> Option<Arc<EdgeRateLimiter>> {
    if !config.rate_limit.enabled {
        tracing::info!("Rate limiting is disabled");
        return None;
    }
    let limiter = Arc::new(EdgeRateLimiter::new(&config.rate_limit));
    limiter.start_background_sweep().await;
    tracing::info!(
        algorithm = ?config.rate_limit.algorithm,
        requests_per_window = config.rate_limit.requests_per_window,
        window_ms = config.rate_limit.window_ms,
        "Rate limiting enabled"
    );
    Some(limiter)
}

/// Assemble every route and middleware. Requests pass the rate limiter first,
/// then session resolution, then (for chat sends) the quota gate.
pub fn build_router(app_state: AppStateData) -> Router {
    let ip_source = app_state.config.gateway.client_ip_source();
    let chat_routes = Router::new()
        .route("/chat/admit", post(endpoints::chat::admit_handler))
        .layer(axum::middleware::from_fn_with_state(
            (app_state.usage_counter.clone(), app_state.cache.clone()),
            usage_limit_middleware,
        ));

    let mut router = Router::new()
        .route(
            "/usage",
            get(endpoints::usage::usage_handler).post(endpoints::usage::update_usage_handler),
        )
        .merge(chat_routes)
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .fallback(endpoints::fallback::handle_404)
        .layer(axum::middleware::from_fn_with_state(
            (app_state.session_resolver.clone(), ip_source),
            attach_session,
        ));

    if let Some(limiter) = app_state.rate_limiter.clone() {
        router = router.layer(axum::middleware::from_fn_with_state(
            (limiter, ip_source),
            rate_limit_middleware,
        ));
    }

    // Failed requests are logged at DEBUG, since errors already log themselves on construction
    router
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state)
}
