use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use tracing::debug;

use crate::rate_limit::{EdgeRateLimiter, RateLimitDecision, RateLimitHeaders};
use crate::session::{request_client_ip, ClientIpSource};

/// Paths that are never rate limited
const EXEMPT_PATHS: &[&str] = &["/health"];

/// Per-IP rate limiting middleware for Axum
pub async fn rate_limit_middleware(
    State((limiter, ip_source)): State<(Arc<EdgeRateLimiter>, ClientIpSource)>,
    request: Request,
    next: Next,
) -> Result<Response, RateLimitError> {
    if EXEMPT_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let Some(ip) = request_client_ip(&request, ip_source) else {
        debug!("No client IP for request; skipping rate limit");
        return Ok(next.run(request).await);
    };

    match limiter.check(ip) {
        RateLimitDecision::Allow(headers) => {
            let mut response = next.run(request).await;
            response.headers_mut().extend(headers.to_header_map());
            Ok(response)
        }
        RateLimitDecision::Deny(headers) => Err(RateLimitError::Exceeded(headers)),
    }
}

/// Rate limiting specific errors
#[derive(Debug)]
pub enum RateLimitError {
    Exceeded(RateLimitHeaders),
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        match self {
            RateLimitError::Exceeded(headers) => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({
                        "error": {
                            "message": "Rate limit exceeded",
                            "type": "rate_limit_error",
                            "code": "rate_limit_exceeded"
                        }
                    })),
                )
                    .into_response();

                response.headers_mut().extend(headers.to_header_map());
                response
            }
        }
    }
}
