// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GatewayError, Result};

pub const DISCOGS_API_BASE: &str = "https://api.discogs.com/";
pub const DISCOGS_IMAGE_BASE: &str = "https://i.discogs.com/";
const DISCOGS_WEB_BASE: &str = "https://www.discogs.com";

const PLAINTEXT_MEDIA_TYPE: &str = "application/vnd.discogs.v2.plaintext+json";
const HTML_MEDIA_TYPE: &str = "application/vnd.discogs.v2.html+json";

/// Representation Discogs should use for free-text fields such as profiles and notes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum TextFormat {
    Plain,
    #[default]
    Markup,
}

impl TextFormat {
    /// Maps a configuration value onto a format. Anything unrecognized is markup.
    pub fn from_config_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "plain" | "plaintext" | "text" => TextFormat::Plain,
            _ => TextFormat::Markup,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TextFormat::Plain => "plaintext",
            TextFormat::Markup => "html",
        }
    }

    /// Media type sent in the `Accept` header.
    pub fn media_type(self) -> &'static str {
        match self {
            TextFormat::Plain => PLAINTEXT_MEDIA_TYPE,
            TextFormat::Markup => HTML_MEDIA_TYPE,
        }
    }
}

impl From<String> for TextFormat {
    fn from(value: String) -> Self {
        TextFormat::from_config_value(&value)
    }
}

impl From<TextFormat> for &'static str {
    fn from(format: TextFormat) -> Self {
        format.as_str()
    }
}

/// Snapshot of the settings that shape every request.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub api_base: Url,
    pub image_base: Url,
    pub auth_token: String,
    pub text_format: TextFormat,
}

impl ClientIdentity {
    pub fn new(
        api_base: &str,
        image_base: &str,
        auth_token: impl Into<String>,
        text_format: TextFormat,
    ) -> Result<Self> {
        Ok(Self {
            api_base: parse_base(api_base)?,
            image_base: parse_base(image_base)?,
            auth_token: auth_token.into(),
            text_format,
        })
    }

    pub fn with_token(mut self, auth_token: impl Into<String>) -> Self {
        self.auth_token = auth_token.into();
        self
    }

    pub fn with_text_format(mut self, text_format: TextFormat) -> Self {
        self.text_format = text_format;
        self
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            api_base: Url::parse(DISCOGS_API_BASE).expect("static API base url"),
            image_base: Url::parse(DISCOGS_IMAGE_BASE).expect("static image base url"),
            auth_token: String::new(),
            text_format: TextFormat::default(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("api_base", &self.api_base.as_str())
            .field("image_base", &self.image_base.as_str())
            .field(
                "auth_token",
                &if self.auth_token.is_empty() { "<empty>" } else { "<redacted>" },
            )
            .field("text_format", &self.text_format)
            .finish()
    }
}

/// Parses a base URL, forcing a trailing slash so relative joins keep the full path.
fn parse_base(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    let url = Url::parse(&with_slash)
        .map_err(|e| GatewayError::Validation(format!("invalid base url {:?}: {}", raw, e)))?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(GatewayError::Validation(format!(
            "base url {:?} has no host",
            raw
        )));
    }
    Ok(url)
}

/// A request on its way out: built by the caller, decorated by the shaper, consumed by the transport.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }
}

/// Undecoded response as delivered by the transport.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Remote quota headers, if the host sent any.
    pub fn quota(&self) -> QuotaTelemetry {
        QuotaTelemetry::from_headers(&self.headers)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// Rate limit counters reported by the API host. The image host never sends them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaTelemetry {
    pub limit: Option<u32>,
    pub used: Option<u32>,
    pub remaining: Option<u32>,
}

impl QuotaTelemetry {
    const LIMIT: [&'static str; 2] = ["x-discogs-ratelimit", "x-ratelimit"];
    const USED: [&'static str; 2] = ["x-discogs-ratelimit-used", "x-ratelimit-used"];
    const REMAINING: [&'static str; 2] = ["x-discogs-ratelimit-remaining", "x-ratelimit-remaining"];

    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: first_number(headers, &Self::LIMIT),
            used: first_number(headers, &Self::USED),
            remaining: first_number(headers, &Self::REMAINING),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.used.is_none() && self.remaining.is_none()
    }
}

impl fmt::Display for QuotaTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show(value: Option<u32>) -> String {
            value.map_or_else(|| "-".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "limit={}, used={}, remaining={}",
            show(self.limit),
            show(self.used),
            show(self.remaining)
        )
    }
}

fn first_number(headers: &HeaderMap, names: &[&str]) -> Option<u32> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    })
}

/// Catalog entity kinds addressable by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Artist,
    Release,
    Master,
}

impl ResourceKind {
    /// Collection segment under the API base, e.g. `artists`.
    pub fn api_segment(self) -> &'static str {
        match self {
            ResourceKind::Artist => "artists",
            ResourceKind::Release => "releases",
            ResourceKind::Master => "masters",
        }
    }

    /// Public web page for an entity of this kind.
    pub fn web_url(self, id: &str) -> String {
        let segment = match self {
            ResourceKind::Artist => "artist",
            ResourceKind::Release => "release",
            ResourceKind::Master => "master",
        };
        format!("{}/{}/{}", DISCOGS_WEB_BASE, segment, id.trim())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "artist" | "artists" => Ok(ResourceKind::Artist),
            "release" | "releases" => Ok(ResourceKind::Release),
            "master" | "masters" => Ok(ResourceKind::Master),
            other => Err(GatewayError::Validation(format!(
                "unknown resource kind {:?}",
                other
            ))),
        }
    }
}
