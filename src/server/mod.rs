//! HTTP front end and process lifecycle
//!
//! Builds the axum router around the crawler engine and runs it with
//! graceful shutdown: the server drains first, then the crawler schedulers,
//! then the rate limiter cleanup task.

pub mod middleware;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::middleware as axum_middleware;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};

use crate::config::{trim_endpoint_char, Config};
use crate::crawler::Crawler;
use crate::limiter::IpRateLimiter;
use crate::server::middleware::parse_truthy;

/// Health check paths, matched after trimming trailing slashes.
const HEALTH_PATHS: [&str; 3] = ["/ok", "/health", "/ping"];

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Crawler engine serving group artifacts.
    pub crawler: Arc<Crawler>,

    /// Trimmed endpoint path to group name.
    pub endpoints: Arc<HashMap<String, String>>,

    /// Rate limiter; `None` when disabled.
    pub limiter: Option<Arc<IpRateLimiter>>,

    /// Version string reported by health endpoints.
    pub version: Arc<str>,
}

/// Build the router with the full middleware pipeline, outermost first:
/// logging, panic recovery, rate limiting, method validation, timeout.
pub fn build_router(state: AppState, timeout: Duration) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(state.clone())
        .layer(
            ServiceBuilder::new()
                .layer(axum_middleware::from_fn(middleware::logging))
                .layer(axum_middleware::from_fn(middleware::recover_panics))
                .layer(axum_middleware::from_fn_with_state(
                    state,
                    middleware::rate_limit,
                ))
                .layer(axum_middleware::from_fn(middleware::require_get))
                .layer(TimeoutLayer::new(timeout)),
        )
}

/// Serve health checks and group artifacts.
///
/// The trimmed request path is matched against the configured endpoints;
/// `force` triggers a synchronous refresh and `decode` base64-decodes an
/// encoded group's artifact.
async fn dispatch(
    State(state): State<AppState>,
    uri: Uri,
    query: Option<Query<HashMap<String, String>>>,
) -> Response {
    let path = uri.path();

    if HEALTH_PATHS.contains(&path.trim_end_matches('/')) {
        let body = format!("OK {}", state.version);
        return ([(header::CONTENT_TYPE, "text/plain")], body).into_response();
    }

    let endpoint = path.trim_matches(trim_endpoint_char);
    let Some(group_name) = state.endpoints.get(endpoint) else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    let params = query.map(|Query(params)| params).unwrap_or_default();
    let force = params.get("force").is_some_and(|value| parse_truthy(value));
    let decode = params.get("decode").is_some_and(|value| parse_truthy(value));

    match state.crawler.get(group_name, force, decode).await {
        Ok(artifact) => {
            ([(header::CONTENT_TYPE, "text/plain")], artifact).into_response()
        }
        Err(err) => {
            error!(group = %group_name, error = %err, "group request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

/// Start everything and block until shutdown completes.
///
/// Startup order: rate limiter and its cleanup task, crawler schedulers,
/// HTTP server. Shutdown, on any configured signal or a fatal server error:
/// drain the server, stop the crawler, stop the limiter cleanup.
pub async fn run(config: Config, version_info: &str) -> Result<()> {
    let limiter = config
        .limiter
        .is_enabled()
        .then(|| Arc::new(IpRateLimiter::new(&config.limiter)));
    let limiter_cancel = CancellationToken::new();
    let cleanup = limiter.as_ref().map(|limiter| {
        Arc::clone(limiter).spawn_cleanup(
            config.limiter.cleanup_period,
            config.limiter.idle_threshold,
            limiter_cancel.clone(),
        )
    });

    info!(groups = config.groups.len(), "starting crawler");
    let endpoints = Arc::new(config.endpoints());
    let crawler = Arc::new(Crawler::new(
        config.groups.clone(),
        &config.user_agent,
        config.retries,
        config.max_concurrent,
    )?);
    crawler.run();

    let state = AppState {
        crawler: Arc::clone(&crawler),
        endpoints,
        limiter,
        version: Arc::from(version_info),
    };
    let router = build_router(state, config.timeout);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "starting server");

    let serve_result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    info!("shutting down crawler");
    crawler.shutdown().await;

    limiter_cancel.cancel();
    if let Some(handle) = cleanup {
        if let Err(err) = handle.await {
            error!(error = %err, "limiter cleanup join error");
        }
    }

    serve_result.context("HTTP server error")?;
    info!("server stopped");
    Ok(())
}

/// Resolves when an interrupt, terminate, or quit signal arrives.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install interrupt handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let quit = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install quit handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
        _ = quit => {}
    }

    info!("shutdown signal received");
}
