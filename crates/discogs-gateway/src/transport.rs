// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::trace;

use crate::error::TransportError;
use crate::models::{OutboundRequest, RawResponse};

/// The network seam. Implementations deliver a request and report what came back,
/// without interpreting the status code and without retrying.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    async fn send(&self, request: OutboundRequest) -> Result<RawResponse, TransportError>;
}

/// [`HttpTransport`] over a shared `reqwest::Client`.
///
/// Dropping an in-flight `send` future aborts the request and returns its
/// connection to reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        // Fall back to reqwest's stock client if the tuned one cannot be built.
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<RawResponse, TransportError> {
        trace!(target: "discogs", method = %request.method, url = %request.url, "sending request");

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
