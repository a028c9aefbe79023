use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use picsync::config::Config;
use picsync::logging::{self, LogTarget};
use picsync::remote::HttpRemote;
use picsync::search::SearchOptions;
use picsync::{PhotoClient, SearchSource};

enum Command {
    Status,
    Queue,
    Sync,
    Search(String),
    Similar(String),
    ClearQueue,
    RetryFailed,
}

struct Args {
    config_path: Option<PathBuf>,
    dir: Option<String>,
    limit: Option<usize>,
    command: Command,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut dir = None;
    let mut limit = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("picsync {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--dir" | "-d" => {
                if i + 1 < args.len() {
                    dir = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --dir requires a directory argument");
                    std::process::exit(1);
                }
            }
            "--limit" | "-n" => match args.get(i + 1).and_then(|n| n.parse().ok()) {
                Some(n) => {
                    limit = Some(n);
                    i += 1;
                }
                None => {
                    eprintln!("Error: --limit requires a number");
                    std::process::exit(1);
                }
            },
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }

    let command = match positional.first().map(String::as_str) {
        None | Some("status") => Command::Status,
        Some("queue") => Command::Queue,
        Some("sync") => Command::Sync,
        Some("search") if positional.len() > 1 => Command::Search(positional[1..].join(" ")),
        Some("similar") if positional.len() == 2 => Command::Similar(positional[1].clone()),
        Some("clear-queue") => Command::ClearQueue,
        Some("retry-failed") => Command::RetryFailed,
        Some(other) => {
            eprintln!("Unknown or incomplete command: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    Args {
        config_path,
        dir,
        limit,
        command,
    }
}

fn print_help() {
    println!(
        r#"picsync - offline-first sync for the photo search backend

USAGE:
    picsync [OPTIONS] [COMMAND]

COMMANDS:
    status              Show connectivity, cache and queue status (default)
    queue               List queued actions
    sync                Replay queued actions and refresh the cache now
    search TEXT...      Search, falling back to the local cache when offline
    similar ID          Cached photos most similar to ID
    clear-queue         Drop every queued action
    retry-failed        Requeue actions that failed permanently

OPTIONS:
    --config, -c PATH   Path to config file
    --dir, -d DIR       Library directory to search (default: first in config)
    --limit, -n N       Maximum number of search results
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PICSYNC_CONFIG      Path to config file (overrides default location)
    PICSYNC_LOG         Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/picsync/config.toml
Logs are written to the picsync directory under $XDG_DATA_HOME.

See also: picsync-daemon --help"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    // Log to file so command output stays clean
    let log_target = logging::init(None, false).ok();

    let config = match args.config_path {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let remote = Arc::new(HttpRemote::new(&config.remote, config.queue.request_timeout()));
    let dir = args
        .dir
        .clone()
        .or_else(|| config.remote.library_dirs.first().cloned())
        .unwrap_or_default();
    let client = PhotoClient::build(config, remote)
        .await
        .context("Failed to open local cache")?;
    let online = client.monitor().force_check().await;

    let options = SearchOptions {
        limit: args.limit,
        ..Default::default()
    };

    match args.command {
        Command::Status => {
            let stats = client.store().stats();
            println!("Backend:  {}", if online { "online" } else { "offline" });
            println!(
                "Cache:    {} photos, {} / {} bytes ({})",
                stats.entries,
                stats.bytes,
                stats.limits.max_bytes,
                if stats.durable { "durable" } else { "memory only" }
            );
            println!(
                "Queue:    {} pending, {} failed",
                client.queue().pending_count(),
                client.queue().failed_count()
            );
            if let Some(LogTarget::File(dir)) = &log_target {
                println!("Logs:     {}", dir.display());
            }
        }
        Command::Queue => {
            let actions = client.queue().get_queue();
            if actions.is_empty() {
                println!("Queue is empty");
            }
            for action in actions {
                println!(
                    "{}  {:<9} {:<9} attempts={} {}{}",
                    action.id,
                    action.action_type().as_str(),
                    action.status.as_str(),
                    action.attempts,
                    action.created_at.format("%Y-%m-%d %H:%M:%S"),
                    action
                        .last_error
                        .as_deref()
                        .map(|e| format!("  error: {}", e))
                        .unwrap_or_default()
                );
            }
        }
        Command::Sync => {
            let report = client.force_sync().await?;
            println!(
                "Replayed {} action(s), {} coalesced, {} failed; \
                 {} cache entries updated, {} removed",
                report.drain.succeeded,
                report.drain.coalesced,
                report.drain.failed.len(),
                report.refresh.updated,
                report.refresh.removed
            );
            for (id, err) in &report.drain.failed {
                println!("  failed {}: {}", id, err);
            }
        }
        Command::Search(text) => {
            let results = client.search(&dir, &text, &options).await?;
            if results.source == SearchSource::Local {
                println!("(offline: approximate results from the local cache)");
            }
            for hit in results.hits {
                println!("{:>6.3}  {}", hit.score, hit.path);
            }
        }
        Command::Similar(id) => {
            if client.store().get_embedding(&id).await?.is_none() {
                bail!("No cached embedding for {}", id);
            }
            for hit in client.find_similar(&id, &options).await? {
                println!("{:>6.3}  {}", hit.score, hit.path);
            }
        }
        Command::ClearQueue => {
            let count = client.queue().get_queue().len();
            client.queue().clear_queue().await?;
            println!("Removed {} queued action(s)", count);
        }
        Command::RetryFailed => {
            let count = client.queue().retry_failed().await?;
            println!("Requeued {} failed action(s)", count);
        }
    }

    Ok(())
}
