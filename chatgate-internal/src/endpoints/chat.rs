use axum::extract::Extension;
use axum::response::Json;
use serde::Serialize;

use crate::usage_limit::entitlements::UNLIMITED;
use crate::usage_limit::UsageDecision;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitResponse {
    pub admitted: bool,
    /// Messages left once this one is counted; `-1` when unlimited
    pub remaining: i64,
    pub messages_limit: i64,
}

impl From<UsageDecision> for AdmitResponse {
    fn from(decision: UsageDecision) -> Self {
        let remaining = match decision.remaining {
            Some(remaining) => i64::try_from(remaining.saturating_sub(1)).unwrap_or(i64::MAX),
            None => UNLIMITED,
        };
        Self {
            admitted: decision.admitted,
            remaining,
            messages_limit: decision.limit.as_wire(),
        }
    }
}

/// `POST /chat/admit`: runs behind `usage_limit_middleware`, which has already
/// admitted the message and records it once this handler succeeds.
pub async fn admit_handler(Extension(decision): Extension<UsageDecision>) -> Json<AdmitResponse> {
    Json(AdmitResponse::from(decision))
}
