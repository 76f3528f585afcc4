// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::classify::classify;
use crate::error::{GatewayError, Result};
use crate::models::{ClientIdentity, OutboundRequest, RawResponse};
use crate::rate_limiter::{AdmissionControl, Permit};
use crate::shaper::RequestShaper;
use crate::transport::HttpTransport;

/// Admission, shaping, delivery and classification for one request at a time.
///
/// A pipeline is shared by all callers; the limiter inside it is the only point
/// where they wait on each other.
#[derive(Clone)]
pub struct Pipeline {
    limiter: Arc<dyn AdmissionControl>,
    shaper: RequestShaper,
    transport: Arc<dyn HttpTransport>,
}

impl Pipeline {
    pub fn new(
        limiter: Arc<dyn AdmissionControl>,
        shaper: RequestShaper,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            limiter,
            shaper,
            transport,
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit> {
        self.limiter.acquire(cancel).await
    }

    pub fn shape(&self, request: &mut OutboundRequest, identity: &ClientIdentity) -> Result<()> {
        self.shaper.shape(request, identity)
    }

    /// Deliver a shaped request. Cancellation drops the in-flight transport future.
    pub async fn send(
        &self,
        request: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(target: "discogs", "request cancelled in flight");
                Err(GatewayError::Cancelled)
            }
            sent = self.transport.send(request) => sent.map_err(GatewayError::from),
        }
    }

    pub fn classify(&self, response: RawResponse) -> Result<RawResponse> {
        classify(response)
    }

    /// Run a request through the whole pipeline. Nothing is retried.
    ///
    /// Shaping happens before admission so a request that can never be sent
    /// does not spend a permit.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn execute(
        &self,
        mut request: OutboundRequest,
        identity: &ClientIdentity,
        cancel: &CancellationToken,
    ) -> Result<RawResponse> {
        self.shape(&mut request, identity)?;
        let _permit = self.acquire(cancel).await?;
        let response = self.send(request, cancel).await?;
        self.classify(response)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("shaper", &self.shaper)
            .finish_non_exhaustive()
    }
}
