// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::classify::check_asset_host;
use crate::error::{GatewayError, Result};
use crate::models::{ClientIdentity, OutboundRequest, RawResponse, ResourceKind, TextFormat};
use crate::pipeline::Pipeline;
use crate::rate_limiter::{AdmissionControl, FixedWindowLimiter, PermitBudget, UnlimitedAdmission};
use crate::shaper::RequestShaper;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Discogs catalog client. Every call goes through one shared, rate-limited pipeline.
///
/// Cloning is cheap; clones share the limiter, the transport and the identity.
#[derive(Debug, Clone)]
pub struct DiscogsClient {
    pipeline: Pipeline,
    identity: Arc<RwLock<Arc<ClientIdentity>>>,
}

impl DiscogsClient {
    /// Create a client with the Discogs defaults and no API token.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> DiscogsClientBuilder {
        DiscogsClientBuilder::default()
    }

    /// The configuration snapshot the next request will use.
    pub fn identity(&self) -> Arc<ClientIdentity> {
        let guard = self
            .identity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    /// Replace the configuration for subsequent requests. Requests already running keep their snapshot.
    pub fn set_identity(&self, identity: ClientIdentity) {
        debug!(target: "discogs", ?identity, "client identity replaced");
        let mut guard = self
            .identity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(identity);
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Fetch an artist document by Discogs id.
    ///
    /// # Example
    /// ```no_run
    /// # use discogs_gateway::DiscogsClient;
    /// # use tokio_util::sync::CancellationToken;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = DiscogsClient::builder().token("my-token").build()?;
    /// let artist = client.artist("45", &CancellationToken::new()).await?;
    /// println!("{}", artist["name"]);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn artist(&self, id: &str, cancel: &CancellationToken) -> Result<Value> {
        self.resource(ResourceKind::Artist, id, cancel).await
    }

    /// Fetch a release document by Discogs id.
    pub async fn release(&self, id: &str, cancel: &CancellationToken) -> Result<Value> {
        self.resource(ResourceKind::Release, id, cancel).await
    }

    /// Fetch a master release document by Discogs id.
    pub async fn master(&self, id: &str, cancel: &CancellationToken) -> Result<Value> {
        self.resource(ResourceKind::Master, id, cancel).await
    }

    #[instrument(skip(self, cancel))]
    pub async fn resource(
        &self,
        kind: ResourceKind,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let identity = self.identity();
        let url = resource_url(&identity.api_base, kind, id)?;
        let response = self
            .pipeline
            .execute(OutboundRequest::get(url), &identity, cancel)
            .await?;
        response.json()
    }

    /// Query `database/search`. `kind` narrows results to `artist`, `release`, `master` or `label`.
    ///
    /// # Example
    /// ```no_run
    /// # use discogs_gateway::DiscogsClient;
    /// # use tokio_util::sync::CancellationToken;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = DiscogsClient::builder().token("my-token").build()?;
    /// let hits = client.search("Nirvana", Some("artist"), &CancellationToken::new()).await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self, cancel))]
    pub async fn search(
        &self,
        query: &str,
        kind: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let identity = self.identity();
        let mut url = identity
            .api_base
            .join("database/search")
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            if let Some(kind) = kind.filter(|kind| !kind.trim().is_empty()) {
                pairs.append_pair("type", kind.trim());
            }
        }

        let response = self
            .pipeline
            .execute(OutboundRequest::get(url), &identity, cancel)
            .await?;
        response.json()
    }

    /// Download image bytes. Only URLs on the configured image host are fetched.
    #[instrument(skip(self, cancel))]
    pub async fn image(&self, url: &str, cancel: &CancellationToken) -> Result<Bytes> {
        let identity = self.identity();
        let url = Url::parse(url)
            .map_err(|e| GatewayError::Validation(format!("invalid image url {:?}: {}", url, e)))?;
        check_asset_host(&url, &identity.image_base)?;

        let response = self
            .pipeline
            .execute(OutboundRequest::get(url), &identity, cancel)
            .await?;
        Ok(response.into_body())
    }

    /// Send an arbitrary request through the pipeline with the current identity.
    pub async fn execute(
        &self,
        request: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse> {
        let identity = self.identity();
        self.pipeline.execute(request, &identity, cancel).await
    }
}

fn resource_url(api_base: &Url, kind: ResourceKind, id: &str) -> Result<Url> {
    let id = id.trim();
    if id.is_empty() {
        return Err(GatewayError::Validation(format!(
            "empty {} id",
            kind.api_segment()
        )));
    }

    let mut url = api_base.clone();
    url.path_segments_mut()
        .map_err(|_| GatewayError::Validation(format!("{} cannot be a base url", api_base)))?
        .pop_if_empty()
        .push(kind.api_segment())
        .push(id);
    Ok(url)
}

/// Builder for configuring a [`DiscogsClient`].
pub struct DiscogsClientBuilder {
    identity: ClientIdentity,
    budget: PermitBudget,
    limiter: Option<Arc<dyn AdmissionControl>>,
    transport: Option<Arc<dyn HttpTransport>>,
    timeout: Duration,
    product: Option<(String, String)>,
}

impl Default for DiscogsClientBuilder {
    fn default() -> Self {
        Self {
            identity: ClientIdentity::default(),
            budget: PermitBudget::discogs_default(),
            limiter: None,
            transport: None,
            timeout: Duration::from_secs(30),
            product: None,
        }
    }
}

impl DiscogsClientBuilder {
    pub fn identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Set a custom API base URL (useful for testing with mock servers).
    pub fn api_base(mut self, url: &str) -> Result<Self> {
        self.identity = ClientIdentity::new(
            url,
            self.identity.image_base.as_str(),
            self.identity.auth_token.clone(),
            self.identity.text_format,
        )?;
        Ok(self)
    }

    /// Set a custom image host base URL.
    pub fn image_base(mut self, url: &str) -> Result<Self> {
        self.identity = ClientIdentity::new(
            self.identity.api_base.as_str(),
            url,
            self.identity.auth_token.clone(),
            self.identity.text_format,
        )?;
        Ok(self)
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.identity = self.identity.with_token(token);
        self
    }

    pub fn text_format(mut self, format: TextFormat) -> Self {
        self.identity = self.identity.with_text_format(format);
        self
    }

    /// Budget for the built-in fixed-window limiter.
    pub fn budget(mut self, budget: PermitBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Use a caller-provided limiter, e.g. one shared with other clients.
    pub fn limiter(mut self, limiter: Arc<dyn AdmissionControl>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Skip local throttling entirely.
    pub fn unlimited(self) -> Self {
        self.limiter(Arc::new(UnlimitedAdmission::new()))
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Request timeout for the default reqwest transport.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Product name and version sent as the `User-Agent`.
    pub fn product(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.product = Some((name.into(), version.into()));
        self
    }

    pub fn build(self) -> Result<DiscogsClient> {
        let shaper = match &self.product {
            Some((name, version)) => RequestShaper::with_product(name, version)?,
            None => RequestShaper::new(),
        };
        let limiter: Arc<dyn AdmissionControl> = match self.limiter {
            Some(limiter) => limiter,
            None => Arc::new(FixedWindowLimiter::new(self.budget)),
        };
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.timeout)?),
        };

        debug!(
            target: "discogs",
            api_base = %self.identity.api_base,
            image_base = %self.identity.image_base,
            "initialized Discogs client"
        );

        Ok(DiscogsClient {
            pipeline: Pipeline::new(limiter, shaper, transport),
            identity: Arc::new(RwLock::new(Arc::new(self.identity))),
        })
    }
}
