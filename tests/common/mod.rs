//! Common test utilities
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use smerge::config::{Config, Group, LimiterConfig, Subscription};
use smerge::crawler::Crawler;
use smerge::limiter::IpRateLimiter;
use smerge::server::{build_router, AppState};

/// Create a remote subscription with defaults suitable for tests.
pub fn subscription(name: &str, url: &str) -> Subscription {
    Subscription {
        name: name.to_string(),
        path: url.to_string(),
        encoded: false,
        timeout: Duration::from_secs(2),
        has_prefixes: Vec::new(),
        local: false,
    }
}

/// Create a group with a one-minute refresh period.
pub fn group(name: &str, endpoint: &str, subscriptions: Vec<Subscription>) -> Group {
    Group {
        name: name.to_string(),
        endpoint: endpoint.to_string(),
        encoded: false,
        period: Duration::from_secs(60),
        subscriptions,
    }
}

/// Create a full configuration around the given groups. The rate limiter
/// is disabled unless a test overrides it.
pub fn config(groups: Vec<Group>) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 1,
        user_agent: "smerge-test/0.1".to_string(),
        timeout: Duration::from_secs(5),
        retries: 3,
        max_concurrent: 8,
        allow_local_root: String::new(),
        debug: false,
        limiter: LimiterConfig::default(),
        groups,
    }
}

/// A running smerge instance bound to an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub crawler: Arc<Crawler>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Start the crawler and the HTTP server for the given configuration.
    pub async fn start(config: Config) -> Self {
        let limiter = config
            .limiter
            .is_enabled()
            .then(|| Arc::new(IpRateLimiter::new(&config.limiter)));
        let endpoints = Arc::new(config.endpoints());
        let crawler = Arc::new(
            Crawler::new(
                config.groups.clone(),
                &config.user_agent,
                config.retries,
                config.max_concurrent,
            )
            .expect("crawler should build"),
        );
        crawler.run();

        let state = AppState {
            crawler: Arc::clone(&crawler),
            endpoints,
            limiter,
            version: Arc::from("test"),
        };
        let router = build_router(state, config.timeout);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral port should bind");
        let addr = listener.local_addr().expect("listener has an address");

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("server should run");
        });

        Self {
            addr,
            crawler,
            handle,
        }
    }

    /// Absolute URL for a path on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop the server and the crawler.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
        self.crawler.shutdown().await;
    }
}
