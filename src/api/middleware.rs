//! Request middleware: rate limiting and connection throttling
//!
//! The limiter stamps `X-RateLimit-Limit/Remaining/Reset` on every response,
//! allowed or denied. Denials carry the standardized JSON bodies with
//! `retry_after` seconds.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::limits::{RateCategory, RateDecision, BYPASS_HEADER};

use super::ApiError;

/// Per-IP sliding-window request limiter.
pub async fn rate_limit(
    State(ctx): State<Arc<CoreContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    // server-internal traffic skips the limiter
    if request.headers().contains_key(BYPASS_HEADER) {
        return next.run(request).await;
    }

    let category = RateCategory::for_path(request.uri().path());
    let decision = ctx.limiter.check(addr.ip(), category).await;

    if !decision.allowed {
        // name the budget that actually tripped
        let (category_name, limit) = if decision.global_exceeded {
            ("global".to_string(), ctx.config.rate_limits.global)
        } else {
            (decision.category.as_str().to_string(), decision.limit)
        };
        let mut response = ApiError(CoreError::RateLimited {
            category: category_name,
            limit,
            retry_after: decision.reset_secs,
        })
        .into_response();
        apply_headers(&mut response, &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, &decision);
    response
}

/// Concurrent-connection cap; the guard spans the whole request.
pub async fn connection_throttle(
    State(ctx): State<Arc<CoreContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let guard = match ctx.throttle.acquire(addr.ip()) {
        Ok(guard) => guard,
        Err(err) => return ApiError(err).into_response(),
    };

    let response = next.run(request).await;
    drop(guard);
    response
}

fn apply_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_secs.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::WINDOW_SECS;

    #[test]
    fn headers_reflect_the_decision() {
        let decision = RateDecision {
            allowed: true,
            category: RateCategory::Normal,
            limit: 60,
            remaining: 42,
            reset_secs: WINDOW_SECS / 2,
            global_exceeded: false,
        };
        let mut response = axum::http::Response::new(axum::body::Body::empty());
        apply_headers(&mut response, &decision);

        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-limit"], "60");
        assert_eq!(headers["x-ratelimit-remaining"], "42");
        assert_eq!(headers["x-ratelimit-reset"], "30");
    }
}
