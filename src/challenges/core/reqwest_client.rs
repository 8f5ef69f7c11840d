//! Reqwest-based implementation of the `ResourceTransport` trait.
//!
//! Thin adapter around `reqwest::Client` that converts between the shared HTTP
//! representations used by the pipeline and the concrete transport.

use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method};
use reqwest::Client;
use url::Url;

use super::{RawResponse, ResourceTransport, TransportError};

/// Reqwest-backed transport with a cookie store, so session cookies set during
/// a challenge dialogue are sent with the replayed requests.
pub struct ReqwestResourceTransport {
    client: Client,
}

impl ReqwestResourceTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|err| TransportError::Transport(err.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client. It should keep a cookie store;
    /// otherwise server sessions will not carry over to replays.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceTransport for ReqwestResourceTransport {
    async fn transmit(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let mut builder = self
            .client
            .request(method.clone(), url.as_str())
            .headers(headers.clone())
            .timeout(timeout);

        if let Some(data) = body {
            builder = builder.body(data.to_vec());
        }

        let response = builder.send().await.map_err(map_error)?;
        to_raw_response(response).await
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::TimedOut
    } else if err.is_connect() {
        TransportError::Unreachable
    } else {
        TransportError::Transport(err.to_string())
    }
}

async fn to_raw_response(response: reqwest::Response) -> Result<RawResponse, TransportError> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let url = response.url().clone();
    let body = response.bytes().await.map_err(map_error)?;

    Ok(RawResponse {
        status,
        headers,
        body,
        url,
    })
}
