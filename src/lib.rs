//! smerge - subscription merge service
//!
//! Periodically fetches a set of remote or local text feeds
//! ("subscriptions"), merges and normalizes their contents per logical
//! "group", and serves each group's merged artifact under a dedicated HTTP
//! endpoint. Feeds and groups may be base64-encoded independently.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - JSON configuration loading and validation
//! - [`crawler`] - refresh engine: schedulers, fetch workers, retry transport
//! - [`limiter`] - per-client-IP token bucket rate limiter
//! - [`server`] - axum HTTP front end and process lifecycle
//! - [`error`] - error types shared across modules
//!
//! # Example
//!
//! ```no_run
//! use smerge::config::Config;
//! use smerge::server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.json")?;
//!     server::run(config, "smerge v0.1.0").await
//! }
//! ```

pub mod config;
pub mod crawler;
pub mod error;
pub mod limiter;
pub mod server;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, Group, LimiterConfig, Subscription};
    pub use crate::crawler::Crawler;
    pub use crate::error::{ClientError, FetchError, GroupError};
    pub use crate::limiter::IpRateLimiter;
    pub use crate::server::AppState;
}
