//! Transport abstraction used by the request pipeline.
//!
//! The pipeline never opens sockets itself; every outbound call goes through a
//! [`ResourceTransport`] so sessions can be driven by reqwest in production and
//! by scripted stubs in tests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderMap;
use http::Method;
use thiserror::Error;
use url::Url;

/// Contract for the HTTP collaborator.
///
/// Implementations should keep cookies between calls so that server-side
/// sessions established during a challenge survive the replay.
#[async_trait]
pub trait ResourceTransport: Send + Sync {
    async fn transmit(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError>;
}

/// Minimal response representation returned by the transport abstraction.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    TimedOut,
    /// No connection to the server could be established.
    #[error("could not connect to the server")]
    Unreachable,
}

impl TransportError {
    /// True when the server could not be reached at all, so later requests
    /// would fail the same way. Errors tied to one response do not count.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::Unreachable)
    }
}
