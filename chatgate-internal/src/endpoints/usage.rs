use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::response::Json;
use serde::Deserialize;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};
use crate::session::{RequestIdentity, UserType};
use crate::usage_limit::limiter::today;
use crate::usage_limit::{cache_snapshot, Principal, UsageSnapshot};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageUpdateParams {
    #[serde(default)]
    pub increment: bool,
}

/// `GET /usage`: today's count, limit and remaining messages for the caller
pub async fn usage_handler(
    State(app_state): AppState,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Json<UsageSnapshot>, Error> {
    let principal = identity.principal()?;
    let snapshot = cached_snapshot(&app_state, &principal, identity.user_type()).await;
    Ok(Json(snapshot))
}

/// `POST /usage`: with `{"increment": true}`, records one message before reporting
pub async fn update_usage_handler(
    State(app_state): AppState,
    Extension(identity): Extension<RequestIdentity>,
    body: Bytes,
) -> Result<Json<UsageSnapshot>, Error> {
    let params: UsageUpdateParams = if body.iter().all(u8::is_ascii_whitespace) {
        UsageUpdateParams::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!("Invalid usage request body: {e}"),
            })
        })?
    };

    let principal = identity.principal()?;
    let user_type = identity.user_type();
    if !params.increment {
        let snapshot = cached_snapshot(&app_state, &principal, user_type).await;
        return Ok(Json(snapshot));
    }

    let counter = &app_state.usage_counter;
    let date = today();
    let snapshot = match counter.increment(&principal, date).await {
        Ok(count) => UsageSnapshot::new(count, counter.resolve_limit(user_type)),
        Err(_) => counter.fallback_snapshot(),
    };
    Ok(Json(cache_snapshot(
        &app_state.cache,
        &principal,
        date,
        snapshot,
    )))
}

async fn cached_snapshot(
    app_state: &AppStateData,
    principal: &Principal,
    user_type: UserType,
) -> UsageSnapshot {
    let date = today();
    if let Some(snapshot) = app_state
        .cache
        .get_as::<UsageSnapshot>(principal.snapshot_cache_key(date))
    {
        return snapshot;
    }
    let snapshot = app_state
        .usage_counter
        .status_or_fallback(principal, user_type, date)
        .await;
    cache_snapshot(&app_state.cache, principal, date, snapshot)
}
