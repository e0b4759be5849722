//! Request timing for the negotiation and snapshot endpoints.
//!
//! Sits outside every other layer so body rejections and unmatched routes
//! are recorded too.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::observability::record_http_request;

/// Requests slower than this are logged.
const SLOW_REQUEST: Duration = Duration::from_secs(1);

pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_owned(), |m| m.as_str().to_owned());

    let response = next.run(request).await;
    let elapsed = started.elapsed();
    let status = response.status().as_u16();

    if elapsed > SLOW_REQUEST {
        warn!(
            target: "room.http",
            method = %method,
            route = %route,
            status,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Slow request"
        );
    }
    record_http_request(method.as_str(), &route, status, elapsed);
    response
}
