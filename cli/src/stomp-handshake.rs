//! # stomp-handshake
//!
//! Performs the handshake of a configured STOMP channel and prints the
//! credential it yields along with the STOMP URL a session would open.
//! Useful for checking channel files and broker reachability before wiring
//! a channel into an application.
//!
//! Settings are layered: built-in defaults, then the JSON file given with
//! `--config`, then the flags below.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use lib_stomp::configs::{ChannelConfig, StompConfig, StompConfigOverlay};
use lib_stomp::core::{CredentialFetcher, HttpPoster, StompChannel};
use lib_stomp::loggers::{setup_logging, LogOptions};
use lib_stomp::ApiClient;

/// Command-line arguments for stomp-handshake.
#[derive(Parser, Debug)]
#[command(
    name = "stomp-handshake",
    version,
    author = "ckir",
    about = "Fetches a STOMP handshake credential for a channel.",
    long_about = None
)]
pub struct Cli {
    /// Channel description (JSON).
    #[arg(long, env = "STOMP_CHANNEL")]
    pub channel: PathBuf,

    /// Connection manager settings (JSON). Missing fields keep their defaults.
    #[arg(long, env = "STOMP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write logs to this directory as well as stdout.
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// error, warn, info, debug or trace.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Retries after a network failure.
    #[arg(long)]
    pub max_retry: Option<u32>,

    /// Request timeout in seconds.
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Fetch this many times, one second apart, to observe credential reuse.
    #[arg(long, default_value_t = 1)]
    pub repeat: u32,
}

fn load_config(cli: &Cli) -> Result<StompConfig> {
    let base = match &cli.config {
        Some(path) => StompConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StompConfig::default(),
    };
    let config = base.merge(StompConfigOverlay {
        max_retry: cli.max_retry,
        request_timeout_secs: cli.request_timeout,
        ..Default::default()
    });
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    setup_logging(&LogOptions {
        level: cli.log_level.clone(),
        log_dir: cli.log_dir.clone(),
        app_name: "stomp-handshake".to_string(),
        message_trace: false,
    })?;

    let config = load_config(&cli)?;
    let channel = Arc::new(
        ChannelConfig::from_json_file(&cli.channel)
            .with_context(|| format!("loading channel {}", cli.channel.display()))?,
    );
    let http: Arc<dyn HttpPoster> = Arc::new(ApiClient::from_config(&config)?);
    let fetcher = Arc::new(CredentialFetcher::new(Arc::clone(&channel), http, &config));

    log::info!("Handshake with {} as {}", channel.handshake_url(), channel.user_token());

    for round in 1..=cli.repeat.max(1) {
        if round > 1 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let credential = match fetcher.fetch().await {
            Ok(credential) => credential,
            Err(e) => {
                log::error!("Handshake failed: {}", e);
                std::process::exit(1);
            }
        };

        println!("handshake id : {}", credential.handshake_id);
        println!("valid for    : {}s", credential.remaining().as_secs());
        match channel.stomp_url(&credential) {
            Some(url) => println!("stomp url    : {}", url),
            None => log::warn!("Channel produced no STOMP URL for this credential"),
        }
    }

    Ok(())
}
