//! Request logging

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::proxy::is_pod_request;

/// Logs every request once it completes. Server errors log at warn.
pub async fn logging(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let proxied = is_pod_request(uri.path());

    let response = next.run(request).await;

    let status = response.status();
    let latency_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
    if status.is_server_error() {
        tracing::warn!(%method, %uri, %status, proxied, latency_us, "request failed");
    } else {
        tracing::info!(%method, %uri, %status, proxied, latency_us, "request complete");
    }

    response
}
