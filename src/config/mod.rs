//! Configuration management for the smerge service
//!
//! This module handles loading and validating the JSON configuration file
//! that describes the HTTP listener, the rate limiter, and the subscription
//! groups the crawler refreshes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Minimal refresh period for a group of subscriptions.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Minimal timeout for a single subscription fetch.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Serde helper for human-readable duration strings like "100ms" or "1m30s".
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Parse a duration string: a sequence of decimal numbers, each with a
    /// unit suffix ("ns", "us", "ms", "s", "m", "h"), e.g. "1.5s" or "2h45m".
    pub fn parse_duration(input: &str) -> Result<Duration, String> {
        let value = input.trim();
        if value.is_empty() {
            return Err("empty duration".to_string());
        }
        if value == "0" {
            return Ok(Duration::ZERO);
        }

        let mut total = 0f64;
        let mut rest = value;

        while !rest.is_empty() {
            let digits = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .unwrap_or(rest.len());
            if digits == 0 || digits == rest.len() {
                return Err(format!("invalid duration {value:?}"));
            }

            let number: f64 = rest[..digits]
                .parse()
                .map_err(|_| format!("invalid number in duration {value:?}"))?;
            rest = &rest[digits..];

            let unit_len = rest
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(rest.len());
            let seconds = match &rest[..unit_len] {
                "ns" => 1e-9,
                "us" | "\u{00b5}s" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                unit => return Err(format!("unknown unit {unit:?} in duration {value:?}")),
            };

            total += number * seconds;
            rest = &rest[unit_len..];
        }

        if !total.is_finite() || total < 0.0 {
            return Err(format!("invalid duration {value:?}"));
        }

        Ok(Duration::from_secs_f64(total))
    }

    /// Format a duration in the same notation `parse_duration` accepts.
    pub fn format_duration(value: Duration) -> String {
        if value.is_zero() {
            return "0s".to_string();
        }

        if value < Duration::from_secs(1) {
            let micros = value.subsec_micros();
            if micros % 1000 == 0 {
                return format!("{}ms", value.subsec_millis());
            }
            return format!("{micros}us");
        }

        let total_secs = value.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let secs = total_secs % 60;
        let millis = value.subsec_millis();

        let mut out = String::new();
        if hours > 0 {
            out.push_str(&format!("{hours}h"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}m"));
        }
        if millis > 0 {
            out.push_str(&format!("{secs}.{millis:03}s"));
        } else if secs > 0 || out.is_empty() {
            out.push_str(&format!("{secs}s"));
        }

        out
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        parse_duration(&value).map_err(serde::de::Error::custom)
    }

}

/// A single subscription: a remote URL or a local file whose content
/// contributes tokens to its group's artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription name, unique within its group.
    pub name: String,

    /// Absolute URL, or an absolute local file path when `local` is set.
    #[serde(rename = "url")]
    pub path: String,

    /// The payload is base64 of the real content.
    #[serde(default)]
    pub encoded: bool,

    /// Fetch deadline for this subscription.
    #[serde(with = "duration_str")]
    pub timeout: Duration,

    /// Keep only tokens starting with one of these prefixes; empty passes all.
    #[serde(default)]
    pub has_prefixes: Vec<String>,

    /// The path is a local file instead of a URL.
    #[serde(default)]
    pub local: bool,
}

impl Subscription {
    /// Retain tokens that start with at least one configured prefix.
    /// An empty prefix set passes everything through unchanged.
    pub fn filter(&self, tokens: Vec<String>) -> Vec<String> {
        if tokens.is_empty() || self.has_prefixes.is_empty() {
            return tokens;
        }

        tokens
            .into_iter()
            .filter(|token| {
                self.has_prefixes
                    .iter()
                    .any(|prefix| token.starts_with(prefix.as_str()))
            })
            .collect()
    }

    fn validate(&self, allow_local_root: &str) -> Result<()> {
        ensure!(!self.name.is_empty(), "subscription name is empty");
        ensure!(
            !self.path.is_empty(),
            "subscription {:?} path is empty",
            self.name
        );
        ensure!(
            self.timeout >= MIN_TIMEOUT,
            "subscription {:?} timeout is too short, should be at least {:?}",
            self.name,
            MIN_TIMEOUT
        );

        if self.local {
            ensure!(
                !allow_local_root.is_empty(),
                "allow_local_root is empty for local subscription {:?}",
                self.name
            );

            let path = Path::new(&self.path);
            ensure!(
                path.is_absolute(),
                "local subscription {:?} path is not absolute",
                self.name
            );
            ensure!(
                path.starts_with(allow_local_root),
                "local subscription {:?} path is outside of {allow_local_root:?}",
                self.name
            );

            let metadata = std::fs::metadata(path).with_context(|| {
                format!("failed to stat local subscription {:?} path", self.name)
            })?;
            ensure!(
                metadata.is_file(),
                "local subscription {:?} path is not a regular file",
                self.name
            );
        } else {
            reqwest::Url::parse(&self.path)
                .with_context(|| format!("subscription {:?} URL is invalid", self.name))?;
        }

        Ok(())
    }
}

/// A named collection of subscriptions sharing a refresh period and an
/// output endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Group name, unique across the process.
    pub name: String,

    /// Public HTTP route serving the merged artifact.
    pub endpoint: String,

    /// Re-encode the merged artifact as base64 before storing it.
    #[serde(default)]
    pub encoded: bool,

    /// Refresh cadence.
    #[serde(with = "duration_str")]
    pub period: Duration,

    /// Ordered subscription list; may be empty (the artifact is then empty).
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl Group {
    /// The maximum fetch timeout across all subscriptions in the group.
    pub fn max_subscription_timeout(&self) -> Duration {
        self.subscriptions
            .iter()
            .map(|sub| sub.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn validate(&self, allow_local_root: &str) -> Result<()> {
        ensure!(!self.name.is_empty(), "group name is empty");
        ensure!(
            !self.endpoint.trim_matches(trim_endpoint_char).is_empty(),
            "group {:?} endpoint is empty",
            self.name
        );
        ensure!(
            self.period >= MIN_PERIOD,
            "group {:?} period is too short, should be at least {:?}",
            self.name,
            MIN_PERIOD
        );

        let mut names = HashSet::with_capacity(self.subscriptions.len());
        for sub in &self.subscriptions {
            sub.validate(allow_local_root)
                .with_context(|| format!("group {:?}", self.name))?;
            ensure!(
                names.insert(sub.name.as_str()),
                "subscription {:?} is duplicated in group {:?}",
                sub.name,
                self.name
            );
        }

        Ok(())
    }
}

/// Per-client-IP rate limiter settings.
///
/// The limiter is disabled when both `rate` and `burst` are zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens added per `interval`.
    #[serde(default)]
    pub rate: f64,

    /// Bucket capacity.
    #[serde(default)]
    pub burst: f64,

    /// Refill unit.
    #[serde(default = "default_interval", with = "duration_str")]
    pub interval: Duration,

    /// How often idle buckets are evicted.
    #[serde(default = "default_cleanup_period", with = "duration_str")]
    pub cleanup_period: Duration,

    /// A bucket idle at least this long is evicted.
    #[serde(default = "default_idle_threshold", with = "duration_str")]
    pub idle_threshold: Duration,

    /// Keys that bypass the limiter entirely.
    #[serde(default)]
    pub excluded: HashSet<String>,
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_cleanup_period() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_threshold() -> Duration {
    Duration::from_secs(180)
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: 0.0,
            burst: 0.0,
            interval: default_interval(),
            cleanup_period: default_cleanup_period(),
            idle_threshold: default_idle_threshold(),
            excluded: HashSet::new(),
        }
    }
}

impl LimiterConfig {
    /// The limiter is active unless both rate and burst are zero.
    pub fn is_enabled(&self) -> bool {
        self.rate > 0.0 || self.burst > 0.0
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.rate.is_finite() && self.rate >= 0.0,
            "limiter rate must be a non-negative number"
        );
        ensure!(
            self.burst.is_finite() && self.burst >= 0.0,
            "limiter burst must be a non-negative number"
        );

        if self.is_enabled() {
            ensure!(!self.interval.is_zero(), "limiter interval is empty");
            ensure!(
                !self.cleanup_period.is_zero(),
                "limiter cleanup_period is empty"
            );
            ensure!(
                !self.idle_threshold.is_zero(),
                "limiter idle_threshold is empty"
            );
        }

        Ok(())
    }
}

/// Main configuration structure, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen host.
    pub host: String,

    /// Listen port.
    pub port: u16,

    /// User-Agent header sent to subscription upstreams.
    pub user_agent: String,

    /// HTTP server request timeout.
    #[serde(with = "duration_str")]
    pub timeout: Duration,

    /// Maximum attempts per upstream request.
    pub retries: u32,

    /// Process-wide bound on concurrent subscription fetches.
    pub max_concurrent: usize,

    /// Path prefix local subscriptions must live under; may be empty when
    /// no subscription is local.
    #[serde(default)]
    pub allow_local_root: String,

    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Rate limiter settings.
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Subscription groups.
    pub groups: Vec<Group>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.host.is_empty(), "host is empty");
        ensure!(self.port != 0, "port is empty");
        ensure!(!self.user_agent.is_empty(), "user agent is empty");
        ensure!(!self.timeout.is_zero(), "timeout is empty");
        ensure!(self.retries >= 1, "retries must be at least 1");
        ensure!(self.max_concurrent >= 1, "max_concurrent must be at least 1");
        ensure!(!self.groups.is_empty(), "no groups defined");

        self.limiter.validate()?;

        let mut names = HashSet::with_capacity(self.groups.len());
        let mut endpoints = HashSet::with_capacity(self.groups.len());

        for group in &self.groups {
            group.validate(&self.allow_local_root)?;
            ensure!(
                names.insert(group.name.as_str()),
                "group name {:?} is duplicated",
                group.name
            );
            ensure!(
                endpoints.insert(group.endpoint.trim_matches(trim_endpoint_char)),
                "group endpoint {:?} is duplicated",
                group.endpoint
            );
        }

        Ok(())
    }

    /// The service's net address, "host:port".
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A map of trimmed endpoint paths to group names.
    pub fn endpoints(&self) -> HashMap<String, String> {
        self.groups
            .iter()
            .map(|group| {
                (
                    group.endpoint.trim_matches(trim_endpoint_char).to_string(),
                    group.name.clone(),
                )
            })
            .collect()
    }
}

/// Characters stripped from both ends of endpoints and request paths.
pub(crate) fn trim_endpoint_char(c: char) -> bool {
    c == '/' || c == ' '
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(name: &str) -> Subscription {
        Subscription {
            name: name.to_string(),
            path: format!("https://example.com/{name}"),
            encoded: false,
            timeout: Duration::from_secs(1),
            has_prefixes: Vec::new(),
            local: false,
        }
    }

    fn group(name: &str, endpoint: &str) -> Group {
        Group {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            encoded: false,
            period: Duration::from_secs(60),
            subscriptions: vec![subscription("sub1")],
        }
    }

    fn config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            user_agent: "smerge/0.1".to_string(),
            timeout: Duration::from_secs(10),
            retries: 3,
            max_concurrent: 8,
            allow_local_root: String::new(),
            debug: false,
            limiter: LimiterConfig::default(),
            groups: vec![group("g1", "/g1")],
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_required_fields() {
        let mut cfg = config();
        cfg.host = String::new();
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.retries = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.max_concurrent = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.groups.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_group_name() {
        let mut cfg = config();
        cfg.groups.push(group("g1", "/other"));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicated"));
    }

    #[test]
    fn test_duplicate_endpoint_after_trim() {
        let mut cfg = config();
        cfg.groups.push(group("g2", "g1/"));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicated"));
    }

    #[test]
    fn test_short_period() {
        let mut cfg = config();
        cfg.groups[0].period = Duration::from_millis(500);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_short_subscription_timeout() {
        let mut cfg = config();
        cfg.groups[0].subscriptions[0].timeout = Duration::from_millis(5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_subscription_name() {
        let mut cfg = config();
        cfg.groups[0].subscriptions.push(subscription("sub1"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_subscriptions_allowed() {
        let mut cfg = config();
        cfg.groups[0].subscriptions.clear();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_local_subscription_requires_root() {
        let mut cfg = config();
        cfg.groups[0].subscriptions[0].local = true;
        cfg.groups[0].subscriptions[0].path = "/tmp/feed.txt".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_local_subscription_validated() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("feed.txt");
        std::fs::write(&file, "token").unwrap();

        let mut cfg = config();
        cfg.allow_local_root = dir.path().to_string_lossy().to_string();
        cfg.groups[0].subscriptions[0].local = true;
        cfg.groups[0].subscriptions[0].path = file.to_string_lossy().to_string();
        assert!(cfg.validate().is_ok());

        // outside the allowed root
        cfg.groups[0].subscriptions[0].path = "/etc/hostname".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_invalid_url() {
        let mut cfg = config();
        cfg.groups[0].subscriptions[0].path = "not a url".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_endpoints_trimmed() {
        let mut cfg = config();
        cfg.groups[0].endpoint = "/proxy/all/ ".to_string();
        let endpoints = cfg.endpoints();
        assert_eq!(endpoints.get("proxy/all").map(String::as_str), Some("g1"));
    }

    #[test]
    fn test_filter_prefixes() {
        let mut sub = subscription("sub1");
        sub.has_prefixes = vec!["ss://".to_string()];

        let tokens = vec![
            "ss://x".to_string(),
            "vmess://y".to_string(),
            "ss://z".to_string(),
        ];
        assert_eq!(sub.filter(tokens), vec!["ss://x", "ss://z"]);
    }

    #[test]
    fn test_filter_empty_prefixes_passes_through() {
        let sub = subscription("sub1");
        let tokens = vec!["a".to_string(), "b".to_string()];
        assert_eq!(sub.filter(tokens.clone()), tokens);
    }

    #[test]
    fn test_filter_no_match() {
        let mut sub = subscription("sub1");
        sub.has_prefixes = vec!["x://".to_string()];
        assert!(sub.filter(vec!["a".to_string(), "b".to_string()]).is_empty());
    }

    #[test]
    fn test_limiter_disabled_by_default() {
        assert!(!LimiterConfig::default().is_enabled());
    }

    #[test]
    fn test_limiter_enabled() {
        let limiter = LimiterConfig {
            rate: 1.0,
            burst: 5.0,
            ..LimiterConfig::default()
        };
        assert!(limiter.is_enabled());
        assert!(limiter.validate().is_ok());
    }

    #[test]
    fn test_parse_full_document() {
        let raw = r#"{
            "host": "0.0.0.0",
            "port": 43210,
            "user_agent": "smerge/0.1",
            "timeout": "30s",
            "retries": 2,
            "max_concurrent": 16,
            "limiter": {
                "rate": 5,
                "burst": 10,
                "interval": "1s",
                "cleanup_period": "1m",
                "idle_threshold": "3m",
                "excluded": ["127.0.0.1"]
            },
            "groups": [
                {
                    "name": "g1",
                    "endpoint": "/g1",
                    "encoded": true,
                    "period": "12h",
                    "subscriptions": [
                        {
                            "name": "first",
                            "url": "https://example.com/feed",
                            "encoded": true,
                            "timeout": "2s",
                            "has_prefixes": ["ss://"]
                        }
                    ]
                }
            ]
        }"#;

        let config: Config = serde_json::from_str(raw).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.groups[0].period, Duration::from_secs(12 * 3600));
        assert!(config.groups[0].encoded);
        assert!(config.limiter.is_enabled());
        assert!(config.limiter.excluded.contains("127.0.0.1"));
        assert_eq!(
            config.groups[0].max_subscription_timeout(),
            Duration::from_secs(2)
        );
    }
}
