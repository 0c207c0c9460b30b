//! Retrying HTTP transport
//!
//! Wraps a `reqwest::Client` with a bounded attempt loop, exponential
//! backoff, and a status classifier deciding which responses are worth
//! another attempt. Every wait point also listens to the request's
//! cancellation token so a shutdown short-circuits the loop.

use std::time::Duration;

use reqwest::{Client, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Backoff schedule: the first attempt starts immediately, later attempts
/// wait 20, 40, 80, 160... milliseconds.
pub fn calc_delay(attempt: u32) -> Duration {
    const OFFSET_MS: u64 = 20;

    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    Duration::from_millis(OFFSET_MS.saturating_mul(factor))
}

/// Default classifier: retry on server errors only, 4xx is terminal.
pub fn retry_server_error(response: &Response) -> bool {
    response.status().as_u16() >= 500
}

/// HTTP client with bounded retries.
pub struct RetryClient {
    client: Client,
    max_attempts: u32,
    backoff: fn(u32) -> Duration,
    classify: fn(&Response) -> bool,
}

impl RetryClient {
    /// Create a retrying client with the default backoff and classifier.
    pub fn new(client: Client, max_attempts: u32) -> Self {
        Self {
            client,
            max_attempts,
            backoff: calc_delay,
            classify: retry_server_error,
        }
    }

    /// Override the backoff schedule.
    pub fn with_backoff(mut self, backoff: fn(u32) -> Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the retry classifier.
    pub fn with_classifier(mut self, classify: fn(&Response) -> bool) -> Self {
        self.classify = classify;
        self
    }

    /// The underlying client, for building requests.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Execute the request, retrying transport failures and retryable
    /// statuses until a response is accepted or attempts are exhausted.
    ///
    /// The request itself is never sent: each attempt sends a fresh clone,
    /// so `max_attempts = 0` returns `MaxRetriesReached` without touching
    /// the network. Cancellation observed at any wait point fails the call
    /// with `ClientError::Cancelled`.
    pub async fn execute(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, ClientError> {
        let mut last: Option<ClientError> = None;

        for attempt in 0..self.max_attempts {
            let delay = (self.backoff)(attempt);
            if delay.is_zero() {
                if cancel.is_cancelled() {
                    return Err(ClientError::Cancelled);
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!(attempt, delay = ?delay, "request attempt");

            let attempt_request = request.try_clone().ok_or(ClientError::NotCloneable)?;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                result = self.client.execute(attempt_request) => result,
            };

            match result {
                Ok(response) => {
                    if (self.classify)(&response) {
                        let status = response.status().as_u16();
                        warn!(attempt, status, "retryable response");
                        last = Some(ClientError::RetryableStatus(status));
                        drop(response);
                        continue;
                    }
                    return Ok(response);
                }
                Err(source) => {
                    warn!(attempt, error = %source, "request attempt failed");
                    last = Some(ClientError::RequestFailure { attempt, source });
                }
            }
        }

        Err(ClientError::MaxRetriesReached {
            last: last.map(Box::new),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http;

    fn test_request() -> Request {
        Client::new()
            .get("http://127.0.0.1:1/unreachable")
            .build()
            .unwrap()
    }

    #[test]
    fn test_calc_delay() {
        assert_eq!(calc_delay(0), Duration::ZERO);
        assert_eq!(calc_delay(1), Duration::from_millis(20));
        assert_eq!(calc_delay(2), Duration::from_millis(40));
        assert_eq!(calc_delay(3), Duration::from_millis(80));
        assert_eq!(calc_delay(4), Duration::from_millis(160));
    }

    #[test]
    fn test_retry_server_error() {
        let ok: Response = http::Response::builder()
            .status(200)
            .body("")
            .unwrap()
            .into();
        assert!(!retry_server_error(&ok));

        let not_found: Response = http::Response::builder()
            .status(404)
            .body("")
            .unwrap()
            .into();
        assert!(!retry_server_error(&not_found));

        let server_error: Response = http::Response::builder()
            .status(500)
            .body("")
            .unwrap()
            .into();
        assert!(retry_server_error(&server_error));

        let bad_gateway: Response = http::Response::builder()
            .status(502)
            .body("")
            .unwrap()
            .into();
        assert!(retry_server_error(&bad_gateway));
    }

    #[tokio::test]
    async fn test_zero_attempts() {
        let client = RetryClient::new(Client::new(), 0);
        let result = client.execute(test_request(), &CancellationToken::new()).await;

        match result {
            Err(ClientError::MaxRetriesReached { last: None }) => {}
            other => panic!("expected MaxRetriesReached without cause, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let client = RetryClient::new(Client::new(), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client.execute(test_request(), &cancel).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_transport_failures_exhaust_attempts() {
        let client = RetryClient::new(Client::new(), 2).with_backoff(|_| Duration::ZERO);
        let result = client.execute(test_request(), &CancellationToken::new()).await;

        match result {
            Err(ClientError::MaxRetriesReached { last: Some(last) }) => {
                assert!(matches!(
                    *last,
                    ClientError::RequestFailure { attempt: 1, .. }
                ));
            }
            other => panic!("expected MaxRetriesReached with cause, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let client = RetryClient::new(Client::new(), 5).with_backoff(|attempt| {
            if attempt == 0 {
                Duration::ZERO
            } else {
                Duration::from_secs(60)
            }
        });
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });

        // the first attempt fails on the unreachable address, then the loop
        // sits in the 60s backoff until cancellation fires
        let started = std::time::Instant::now();
        let result = client.execute(test_request(), &cancel).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
