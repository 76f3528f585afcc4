// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscogsConfig {
    pub api_server: String,
    pub image_server: String,
    pub api_token: String,
    /// `html`/`markup` or `plaintext`/`plain`; anything else means markup.
    pub text_format: String,
    pub timeout_secs: u64,
}

impl Default for DiscogsConfig {
    fn default() -> Self {
        Self {
            api_server: "https://api.discogs.com/".to_string(),
            image_server: "https://i.discogs.com/".to_string(),
            api_token: String::new(),
            text_format: "html".to_string(),
            timeout_secs: 30,
        }
    }
}

impl DiscogsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub permits_per_window: u32,
    pub max_queue_depth: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // Discogs allows 60 authenticated requests per minute; spend them at one per second.
        Self {
            enabled: true,
            window_ms: 1000,
            permits_per_window: 1,
            max_queue_depth: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub discogs: DiscogsConfig,
    pub rate_limit: RateLimitConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("discogs.api_server", &self.discogs.api_server),
            ("discogs.image_server", &self.discogs.image_server),
        ] {
            let url = Url::parse(value).with_context(|| format!("{name} is not a valid URL"))?;
            if url.host_str().is_none() {
                bail!("{name} must include a host");
            }
        }
        if self.discogs.timeout_secs == 0 {
            bail!("discogs.timeout_secs must be greater than zero");
        }
        if self.rate_limit.enabled {
            if self.rate_limit.permits_per_window == 0 {
                bail!("rate_limit.permits_per_window must be at least 1");
            }
            if self.rate_limit.window_ms == 0 {
                bail!("rate_limit.window_ms must be greater than zero");
            }
        }
        Ok(())
    }
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: DISCOGS_GATEWAY_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let config: AppConfig = figment(config_path).extract()?;
    config.validate()?;
    info!(target: "config", "configuration loaded");
    Ok(config)
}

fn figment(config_path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment.merge(Env::prefixed("DISCOGS_GATEWAY_").split("__"))
}
