// SPDX-License-Identifier: GPL-3.0-or-later

use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};

use crate::error::{GatewayError, Result};
use crate::models::{ClientIdentity, OutboundRequest};

pub const DEFAULT_PRODUCT: &str = concat!("discogs-gateway/", env!("CARGO_PKG_VERSION"));

/// Attaches the headers Discogs requires: content negotiation, credentials and product identity.
///
/// Shaping only touches headers, and re-shaping replaces rather than appends.
#[derive(Debug, Clone)]
pub struct RequestShaper {
    user_agent: HeaderValue,
}

impl RequestShaper {
    pub fn new() -> Self {
        Self {
            user_agent: HeaderValue::from_static(DEFAULT_PRODUCT),
        }
    }

    /// Use a different `<name>/<version>` product token for the calling application.
    pub fn with_product(name: &str, version: &str) -> Result<Self> {
        let user_agent = HeaderValue::from_str(&format!("{}/{}", name.trim(), version.trim()))
            .map_err(|_| GatewayError::Validation(format!("invalid product name {:?}", name)))?;
        Ok(Self { user_agent })
    }

    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }

    pub fn shape(&self, request: &mut OutboundRequest, identity: &ClientIdentity) -> Result<()> {
        // Discogs uses its own scheme rather than Bearer: "Discogs token=<value>".
        let mut authorization =
            HeaderValue::from_str(&format!("Discogs token={}", identity.auth_token)).map_err(
                |_| {
                    GatewayError::Validation(
                        "API token contains characters not allowed in a header".into(),
                    )
                },
            )?;
        authorization.set_sensitive(true);

        let headers = &mut request.headers;
        // `insert` drops every existing value, including transport defaults like `*/*`.
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(identity.text_format.media_type()),
        );
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(USER_AGENT, self.user_agent.clone());
        Ok(())
    }
}

impl Default for RequestShaper {
    fn default() -> Self {
        Self::new()
    }
}
