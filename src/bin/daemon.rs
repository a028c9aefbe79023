//! Picsync daemon for background synchronization.
//!
//! This daemon keeps the local cache and action queue in step with the
//! search backend:
//! - Heartbeats the backend to track connectivity
//! - Replays queued actions on every reconnection
//! - Refreshes cached library directories after each replay
//!
//! The daemon shares the cache database with the `picsync` CLI.
//!
//! ## Usage
//!
//! ```bash
//! picsync-daemon              # Run in foreground
//! picsync-daemon --once       # Sync once and exit
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use picsync::config::Config;
use picsync::logging;
use picsync::remote::HttpRemote;
use picsync::PhotoClient;

/// Daemon configuration
#[derive(Default)]
struct DaemonConfig {
    /// Sync once and exit
    once: bool,
    /// Config path override
    config_path: Option<PathBuf>,
    /// Log directory override
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let daemon_config = parse_args();

    let log_target = logging::init(daemon_config.log_dir.clone(), true)
        .context("Failed to initialize logging")?;

    info!(?log_target, "Picsync daemon starting...");

    let config = load_config(&daemon_config)?;
    info!("Config loaded, backend at {}", config.remote.endpoint);

    let remote = Arc::new(HttpRemote::new(&config.remote, config.queue.request_timeout()));
    let client = PhotoClient::build(config, remote)
        .await
        .context("Failed to open local cache")?;
    if !client.store().is_supported() {
        warn!("Cache database unavailable, running memory-only");
    }

    if daemon_config.once {
        info!("Running in single-shot mode");
        match client.force_sync().await {
            Ok(report) => info!(
                replayed = report.drain.succeeded,
                failed = report.drain.failed.len(),
                updated = report.refresh.updated,
                "Sync complete"
            ),
            Err(e) => error!("Sync failed: {}", e),
        }
    } else {
        run_daemon(&client).await?;
    }

    info!("Picsync daemon stopped");
    Ok(())
}

async fn run_daemon(client: &PhotoClient) -> Result<()> {
    let online = client.init().await;
    info!("Running in daemon mode, backend {}", if online { "online" } else { "offline" });

    let mut status = client.subscribe_status();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!("Sync status: {}", current);
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
        }
    }

    client.dispose();
    Ok(())
}

fn parse_args() -> DaemonConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DaemonConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                config.once = true;
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--log-dir" => {
                if i + 1 < args.len() {
                    config.log_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("picsync-daemon {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_help() {
    println!(
        r#"picsync-daemon - Background sync for the photo search client

USAGE:
    picsync-daemon [OPTIONS]

OPTIONS:
    --once, -1          Sync once and exit
    --config, -c PATH   Path to config file
    --log-dir PATH      Log directory when journald is unavailable
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PICSYNC_CONFIG      Path to config file (overrides default location)
    PICSYNC_LOG         Log level (trace, debug, info, warn, error)

The daemon replays actions queued while the backend was unreachable and
refreshes the cached library directories listed under [remote] in the
config file.
"#
    );
}

fn load_config(daemon_config: &DaemonConfig) -> Result<Config> {
    match daemon_config.config_path {
        Some(ref path) => Config::load_from(path),
        None => Config::load(),
    }
}
