//! HTTP middleware pipeline
//!
//! Outermost first: request logging with generated request IDs, panic
//! recovery, per-client rate limiting, and method validation. Helpers for
//! client key resolution and truthy query parsing live here as well.

use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use rand::RngCore;
use tracing::{error, info, warn};

use crate::error::panic_message;
use crate::server::AppState;

/// Response header carrying the request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Length of a generated request ID in bytes.
const REQUEST_ID_LEN: usize = 16;

/// Request identifier stored in request extensions by the logging layer.
#[derive(Debug, Clone)]
pub(crate) struct RequestId(pub String);

/// Generate a request ID: 16 random bytes hex-encoded, falling back to the
/// current nanosecond timestamp in hex if the OS RNG fails.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; REQUEST_ID_LEN];

    match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => bytes.iter().map(|byte| format!("{byte:02x}")).collect(),
        Err(err) => {
            warn!(error = %err, "failed to generate request id");
            format!("{:x}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default())
        }
    }
}

/// Parse a truthy query value: true, t, yes, y, on, enabled, 1.
pub fn parse_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "t" | "yes" | "y" | "on" | "enabled" | "1"
    )
}

/// Resolve the client key: the first `X-Forwarded-For` element, then
/// `X-Real-IP`, then the connection's remote address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

/// Log request start and completion, and stamp every response with an
/// `X-Request-ID` header. The completion level follows the final status:
/// INFO below 400, WARN from 400, ERROR from 500.
pub async fn logging(mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = generate_request_id();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let remote_addr = client_key(request.headers(), peer_addr(&request));
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    info!(
        id = %request_id,
        method = %method,
        path = %path,
        remote_addr = %remote_addr,
        user_agent = %user_agent,
        "request started"
    );
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let status = response.status();
    let bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or_default();
    let duration = start.elapsed();

    if status.as_u16() >= 500 {
        error!(
            id = %request_id,
            method = %method,
            path = %path,
            remote_addr = %remote_addr,
            status = status.as_u16(),
            bytes,
            duration = ?duration,
            query = %query,
            "request completed with server error"
        );
    } else if status.as_u16() >= 400 {
        warn!(
            id = %request_id,
            method = %method,
            path = %path,
            remote_addr = %remote_addr,
            status = status.as_u16(),
            bytes,
            duration = ?duration,
            query = %query,
            "request completed with client error"
        );
    } else {
        info!(
            id = %request_id,
            method = %method,
            path = %path,
            remote_addr = %remote_addr,
            status = status.as_u16(),
            bytes,
            duration = ?duration,
            query = %query,
            "request completed"
        );
    }

    response
}

/// Catch panics from inner handlers, log them with the request ID and a
/// backtrace, and answer 500.
pub async fn recover_panics(request: Request, next: Next) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            error!(
                id = %request_id,
                error = %panic_message(payload.as_ref()),
                stack = %Backtrace::force_capture(),
                "panic recovered"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

/// Reject rate-limited clients with 429. A missing limiter passes everything.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(limiter) = state.limiter.as_ref() else {
        return next.run(request).await;
    };

    let key = client_key(request.headers(), peer_addr(&request));
    if !limiter.allow(&key) {
        warn!(remote_addr = %key, "rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    next.run(request).await
}

/// Only GET is served.
pub async fn require_get(request: Request, next: Next) -> Response {
    if request.method() != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_id_hex() {
        let id = generate_request_id();
        assert_eq!(id.len(), REQUEST_ID_LEN * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_request_ids_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }

    #[test]
    fn test_parse_truthy() {
        for value in ["true", "t", "yes", "y", "on", "enabled", "1", " TRUE ", "Yes"] {
            assert!(parse_truthy(value), "{value:?} should be truthy");
        }

        for value in ["false", "0", "no", "off", "", "2", "enable"] {
            assert!(!parse_truthy(value), "{value:?} should not be truthy");
        }
    }

    #[test]
    fn test_client_key_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 192.168.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("172.16.0.1"));

        assert_eq!(client_key(&headers, None), "10.0.0.1");
    }

    #[test]
    fn test_client_key_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("172.16.0.1"));

        assert_eq!(client_key(&headers, None), "172.16.0.1");
    }

    #[test]
    fn test_client_key_peer_fallback() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.5:12345".parse().unwrap();

        assert_eq!(client_key(&headers, Some(peer)), "192.168.1.5");
        assert_eq!(client_key(&headers, None), "");
    }
}
