//! Single-subscription fetch worker
//!
//! Fetches one subscription over HTTP or from a local file, optionally
//! decodes the base64 payload, tokenizes it on Unicode whitespace, and
//! applies the subscription's prefix filter. The whole fetch runs under the
//! subscription's own deadline composed with the engine cancellation token.

use std::io;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::{header::USER_AGENT, Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Subscription;
use crate::crawler::client::RetryClient;
use crate::error::{ClientError, FetchError};

/// Lower bound on the connect timeout derived from subscription timeouts.
const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Fetches subscription payloads and turns them into token lists.
pub struct SubscriptionFetcher {
    client: RetryClient,
    user_agent: String,
}

impl SubscriptionFetcher {
    /// Create a fetcher whose HTTP client is tuned from the maximum
    /// subscription timeout: the connect timeout is half of it (at least
    /// 500 ms) and the overall request timeout is twice it.
    pub fn new(
        user_agent: &str,
        max_attempts: u32,
        max_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let handshake_timeout = (max_timeout / 2).max(MIN_HANDSHAKE_TIMEOUT);
        debug!(timeout = ?max_timeout, handshake = ?handshake_timeout, "fetcher timeouts");

        let mut builder = Client::builder()
            .connect_timeout(handshake_timeout)
            .gzip(true);
        if !max_timeout.is_zero() {
            builder = builder.timeout(max_timeout * 2);
        }
        let client = builder.build()?;

        Ok(Self {
            client: RetryClient::new(client, max_attempts),
            user_agent: user_agent.to_string(),
        })
    }

    /// Fetch one subscription and return its filtered token list.
    ///
    /// The subscription timeout and the engine cancellation token both
    /// abort the fetch with `FetchError::Cancelled`.
    pub async fn fetch(
        &self,
        group: &str,
        sub: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, FetchError> {
        debug!(
            group,
            subscription = %sub.name,
            local = sub.local,
            encoded = sub.encoded,
            path = %sub.path,
            "fetching subscription"
        );
        let start = std::time::Instant::now();

        let work = async {
            let body = if sub.local {
                self.fetch_local(sub).await?
            } else {
                self.fetch_url(sub, cancel).await?
            };

            let bytes = body.len();
            let tokens = extract_tokens(&body, sub.encoded)?;
            let size = tokens.len();
            let filtered = sub.filter(tokens);

            info!(
                group,
                subscription = %sub.name,
                size,
                filtered = filtered.len(),
                prefixes = sub.has_prefixes.len(),
                bytes,
                duration = ?start.elapsed(),
                "subscription fetched"
            );
            Ok(filtered)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(sub.timeout, work) => {
                result.unwrap_or(Err(FetchError::Cancelled))
            }
        }
    }

    /// GET the subscription URL through the retry transport. Any status
    /// other than 200 is terminal for this refresh.
    async fn fetch_url(
        &self,
        sub: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<Bytes, FetchError> {
        let request = self
            .client
            .inner()
            .get(&sub.path)
            .header(USER_AGENT, self.user_agent.as_str())
            .build()?;

        let response = self.client.execute(request, cancel).await.map_err(|err| {
            match err {
                ClientError::Cancelled => FetchError::Cancelled,
                other => FetchError::Retry(other),
            }
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        Ok(response.bytes().await?)
    }

    /// Read the subscription from a local file. The path was validated at
    /// configuration load; the regular-file check is repeated here in case
    /// the file changed since.
    async fn fetch_local(&self, sub: &Subscription) -> Result<Bytes, FetchError> {
        let metadata = tokio::fs::metadata(&sub.path).await?;
        if !metadata.is_file() {
            return Err(FetchError::File(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is not a regular file", sub.path),
            )));
        }

        let data = tokio::fs::read(&sub.path).await?;
        Ok(Bytes::from(data))
    }
}

/// Split a payload into whitespace-separated tokens, decoding base64 first
/// when the subscription is encoded. The decoder tolerates line-wrapped
/// base64 by stripping ASCII whitespace before decoding.
fn extract_tokens(body: &[u8], encoded: bool) -> Result<Vec<String>, FetchError> {
    let decoded;
    let raw: &[u8] = if encoded {
        let compact: Vec<u8> = body
            .iter()
            .copied()
            .filter(|byte| !byte.is_ascii_whitespace())
            .collect();
        decoded = STANDARD.decode(compact)?;
        &decoded
    } else {
        body
    };

    let text = String::from_utf8_lossy(raw);
    Ok(text.split_whitespace().map(str::to_owned).collect())
}
