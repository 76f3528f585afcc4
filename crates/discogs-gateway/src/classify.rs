// SPDX-License-Identifier: GPL-3.0-or-later

//! Turns raw responses into pipeline outcomes.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::error::{GatewayError, Result};
use crate::models::RawResponse;

/// Classify a response: 2xx succeeds, 429 is throttling, anything else is a transport fault.
pub fn classify(response: RawResponse) -> Result<RawResponse> {
    let status = response.status;
    let quota = response.quota();
    debug!(target: "discogs", %status, "response status");

    if status.is_success() {
        if !quota.is_empty() {
            debug!(target: "discogs", %quota, "remote rate limit");
        }
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after(&response);
        // Only the API host reports quota headers; the image host does not.
        warn!(
            target: "discogs",
            limit = ?quota.limit,
            used = ?quota.used,
            remaining = ?quota.remaining,
            ?retry_after,
            "rate limited by Discogs"
        );
        return Err(GatewayError::Throttled { retry_after, quota });
    }

    Err(GatewayError::unexpected_status(status))
}

/// `Retry-After` in its delta-seconds form. HTTP-date values are ignored.
fn retry_after(response: &RawResponse) -> Option<Duration> {
    response
        .headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Reject asset URLs that do not point at the configured image host.
pub fn check_asset_host(asset: &Url, image_base: &Url) -> Result<()> {
    let same_host = match (asset.host_str(), image_base.host_str()) {
        (Some(asset_host), Some(base_host)) => asset_host.eq_ignore_ascii_case(base_host),
        _ => false,
    };
    if same_host && asset.port_or_known_default() == image_base.port_or_known_default() {
        return Ok(());
    }
    Err(GatewayError::Validation(format!(
        "host of {} does not match {}",
        asset, image_base
    )))
}
