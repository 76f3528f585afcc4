// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use discogs_config::{load as load_config, AppConfig};
use discogs_gateway::{ClientIdentity, DiscogsClient, PermitBudget, ResourceKind, TextFormat};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

type LogFilter = reload::Handle<EnvFilter, Registry>;

#[derive(Debug, Parser)]
#[command(name = "discogs-cli", version, about = "Query the Discogs catalog through a rate-limited gateway")]
struct Cli {
    /// TOML configuration file; environment variables prefixed DISCOGS_GATEWAY_ override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch an artist by id
    Artist { id: String },
    /// Fetch a release by id
    Release { id: String },
    /// Fetch a master release by id
    Master { id: String },
    /// Search the catalog
    Search {
        query: String,
        /// artist, release, master or label
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Download an image from the configured image host
    Image {
        url: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the public web page of an entity without contacting the API
    Url { kind: String, id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let rust_log = std::env::var("RUST_LOG").ok();
    let log_filter = init_tracing(rust_log.as_deref());

    let config = load_config(cli.config.as_deref())?;
    apply_log_level(&log_filter, rust_log.as_deref(), &config.telemetry.log_level)?;
    info!(target: "cli", api_server = %config.discogs.api_server, "configuration loaded");

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    run(cli.command, &config, &cancel).await
}

async fn run(command: Command, config: &AppConfig, cancel: &CancellationToken) -> Result<()> {
    if let Command::Url { kind, id } = &command {
        let kind: ResourceKind = kind.parse()?;
        println!("{}", kind.web_url(id));
        return Ok(());
    }

    let client = build_client(config)?;
    let document = match command {
        Command::Artist { id } => client.artist(&id, cancel).await?,
        Command::Release { id } => client.release(&id, cancel).await?,
        Command::Master { id } => client.master(&id, cancel).await?,
        Command::Search { query, kind } => client.search(&query, kind.as_deref(), cancel).await?,
        Command::Image { url, output } => {
            let bytes = client.image(&url, cancel).await?;
            tokio::fs::write(&output, &bytes).await?;
            info!(target: "cli", path = %output.display(), size = bytes.len(), "image saved");
            return Ok(());
        }
        Command::Url { .. } => return Ok(()),
    };

    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

fn build_client(config: &AppConfig) -> Result<DiscogsClient> {
    let identity = ClientIdentity::new(
        &config.discogs.api_server,
        &config.discogs.image_server,
        config.discogs.api_token.clone(),
        TextFormat::from_config_value(&config.discogs.text_format),
    )?;

    let builder = DiscogsClient::builder()
        .identity(identity)
        .timeout(config.discogs.timeout())
        .product("discogs-cli", env!("CARGO_PKG_VERSION"));

    let builder = if config.rate_limit.enabled {
        builder.budget(PermitBudget::new(
            config.rate_limit.window(),
            config.rate_limit.permits_per_window,
            config.rate_limit.max_queue_depth,
        )?)
    } else {
        builder.unlimited()
    };

    Ok(builder.build()?)
}

/// Installs the subscriber before configuration is read, so config loading is logged too.
fn init_tracing(rust_log: Option<&str>) -> LogFilter {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr);
    let (env_filter, handle) = reload::Layer::new(startup_filter(rust_log));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    handle
}

fn startup_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Switch to the configured log level unless RUST_LOG already chose one.
fn apply_log_level(filter: &LogFilter, rust_log: Option<&str>, level: &str) -> Result<()> {
    if rust_log.is_some() {
        return Ok(());
    }
    filter.reload(EnvFilter::new(level))?;
    Ok(())
}

/// Cancel outstanding requests on Ctrl-C / SIGTERM.
async fn cancel_on_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut interrupt, mut terminate) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
                _ => return,
            };
        tokio::select! {
            _ = interrupt.recv() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
    }

    info!(target: "cli", "shutdown signal received, cancelling requests");
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_with_type() {
        let cli = Cli::try_parse_from(["discogs-cli", "search", "Nevermind", "--type", "master"])
            .unwrap();
        match cli.command {
            Command::Search { query, kind } => {
                assert_eq!(query, "Nevermind");
                assert_eq!(kind.as_deref(), Some("master"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["discogs-cli", "artist", "45", "--config", "gw.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("gw.toml")));
        assert!(matches!(cli.command, Command::Artist { ref id } if id == "45"));
    }

    #[test]
    fn test_image_requires_output() {
        assert!(Cli::try_parse_from(["discogs-cli", "image", "https://i.discogs.com/x.jpg"]).is_err());
    }

    #[test]
    fn test_build_client_from_defaults() {
        let client = build_client(&AppConfig::default()).unwrap();
        let identity = client.identity();
        assert_eq!(identity.api_base.as_str(), "https://api.discogs.com/");
        assert_eq!(identity.text_format, TextFormat::Markup);
    }

    #[test]
    fn test_build_client_maps_text_format_and_disabled_limiter() {
        let mut config = AppConfig::default();
        config.discogs.text_format = "PlainText".to_string();
        config.rate_limit.enabled = false;
        config.rate_limit.permits_per_window = 0;

        let client = build_client(&config).unwrap();
        assert_eq!(client.identity().text_format, TextFormat::Plain);
    }

    #[test]
    fn test_build_client_rejects_zero_window() {
        let mut config = AppConfig::default();
        config.rate_limit.window_ms = 0;
        assert!(build_client(&config).is_err());
    }

    #[test]
    fn test_configured_log_level_replaces_startup_filter() {
        let (_layer, filter) = reload::Layer::<_, Registry>::new(startup_filter(None));
        apply_log_level(&filter, None, "discogs=debug").unwrap();

        let current = filter.with_current(|f| f.to_string()).unwrap();
        assert!(current.contains("discogs=debug"), "filter is {current}");
    }

    #[test]
    fn test_rust_log_wins_over_configured_level() {
        let (_layer, filter) =
            reload::Layer::<_, Registry>::new(startup_filter(Some("discogs=trace")));
        apply_log_level(&filter, Some("discogs=trace"), "warn").unwrap();

        let current = filter.with_current(|f| f.to_string()).unwrap();
        assert!(current.contains("discogs=trace"), "filter is {current}");
    }

    #[tokio::test]
    async fn test_url_command_needs_no_network() {
        let mut config = AppConfig::default();
        config.discogs.api_server = "http://127.0.0.1:1/".to_string();
        let command = Command::Url {
            kind: "artist".to_string(),
            id: "45".to_string(),
        };
        assert!(run(command, &config, &CancellationToken::new()).await.is_ok());
    }
}
