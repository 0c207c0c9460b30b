//! Error types for the smerge service
//!
//! This module defines the error enums surfaced at the boundaries of the
//! crawler engine: the retrying HTTP transport, the per-subscription fetch
//! worker, and the group result cache.

use std::any::Any;
use std::io;

use thiserror::Error;

/// Errors produced by the retrying HTTP transport.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The request's cancellation signal fired during a wait or an attempt.
    #[error("request cancelled")]
    Cancelled,

    /// A single transport attempt failed (transient, retried).
    #[error("attempt {attempt} failed: {source}")]
    RequestFailure {
        attempt: u32,
        #[source]
        source: reqwest::Error,
    },

    /// A response was classified as retryable by its status code.
    #[error("retryable status code: {0}")]
    RetryableStatus(u16),

    /// All attempts were exhausted, carrying the last cause if any.
    #[error("max retries reached")]
    MaxRetriesReached {
        #[source]
        last: Option<Box<ClientError>>,
    },

    /// The request could not be cloned for a retry attempt.
    #[error("request is not cloneable")]
    NotCloneable,
}

/// Errors that can occur while fetching a single subscription.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The engine cancellation signal or the subscription deadline fired.
    #[error("fetch cancelled")]
    Cancelled,

    /// Request construction or body read failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The retry transport gave up.
    #[error("transport error: {0}")]
    Retry(ClientError),

    /// A non-200 response, terminal for the subscription.
    #[error("response status error: {0}")]
    Status(u16),

    /// Local file open or read failed.
    #[error("file error: {0}")]
    File(#[from] io::Error),

    /// The subscription payload is not valid base64.
    #[error("base64 decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The fetch task panicked, carrying the recovered payload.
    #[error("fetch panic: {0}")]
    Panic(String),
}

/// Errors returned by the group result cache.
#[derive(Error, Debug)]
pub enum GroupError {
    /// No group with this name, or no artifact has ever been produced.
    #[error("group not found: {0:?}")]
    NotFound(String),

    /// The stored artifact could not be base64-decoded.
    #[error("group decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Render a panic payload as a readable message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
