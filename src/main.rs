//! hostcache - command line front end for the shared hostname cache
//!
//! `hostcache serve` creates the segment and owns it until interrupted,
//! sweeping expired entries in the background. Every other subcommand
//! attaches to a running segment as a non-owner.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hostname_cache::{spawn_sweep_task, Config, HostnameCache};

#[derive(Debug, Parser)]
#[command(name = "hostcache", version, about = "Shared-memory hostname cache")]
struct Cli {
    /// Shared memory segment name (overrides HOSTCACHE_SEGMENT_NAME)
    #[arg(long, global = true)]
    segment: Option<String>,

    /// Segment size in bytes when serving (overrides HOSTCACHE_SEGMENT_SIZE)
    #[arg(long, global = true)]
    size: Option<usize>,

    /// Sweep interval in seconds when serving (overrides HOSTCACHE_SWEEP_INTERVAL)
    #[arg(long, global = true)]
    sweep_interval: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the cache and own it until SIGINT or SIGTERM
    Serve,
    #[command(flatten)]
    Client(ClientCommand),
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    /// Store an alias for a hostname
    Insert {
        key: String,
        alias: String,
        /// Time to live in seconds (default: HOSTCACHE_DEFAULT_TTL)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Print the alias for a hostname; exits with status 1 on a miss
    Lookup { key: String },
    /// Remove a hostname
    Erase { key: String },
    /// Remove expired entries and print how many were removed
    Sweep,
    /// Remove all entries
    Clear,
    /// Print cache statistics as JSON
    Status,
}

fn main() -> ExitCode {
    // Initialize tracing subscriber with env filter
    // Defaults to "info" level, can be overridden with RUST_LOG env var.
    // Logs go to stderr so stdout carries only command output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostname_cache=info,hostcache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(segment) = cli.segment {
        config.segment_name = segment;
    }
    if let Some(size) = cli.size {
        config.segment_size = size;
    }
    if let Some(interval) = cli.sweep_interval {
        config.sweep_interval = interval;
    }

    let result = match cli.command {
        Command::Serve => tokio::runtime::Runtime::new()
            .context("failed to start runtime")
            .and_then(|runtime| runtime.block_on(serve(config)))
            .map(|()| ExitCode::SUCCESS),
        Command::Client(command) => run_client(&config, command),
    };

    result.unwrap_or_else(|err| {
        eprintln!("hostcache: {err:#}");
        ExitCode::FAILURE
    })
}

/// Owns the cache until a shutdown signal arrives.
///
/// # Startup Sequence
/// 1. Create the segment, map and lock as owner
/// 2. Start background expiration sweep task
/// 3. Wait for SIGINT/SIGTERM
/// 4. Stop the sweep task and tear the shared objects down
async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Starting hostname cache");
    info!(
        "Configuration loaded: segment={}, size={}, sweep_interval={}s, lock_timeout={:?}",
        config.segment_name, config.segment_size, config.sweep_interval, config.lock_timeout
    );

    let cache = Arc::new(
        HostnameCache::from_config(&config)
            .with_context(|| format!("failed to create {}", config.segment_name))?,
    );
    info!("Hostname cache ready");

    let sweep_handle = spawn_sweep_task(cache.clone(), config.sweep_interval);
    info!("Background sweep task started");

    shutdown_signal().await;

    sweep_handle.abort();
    _ = sweep_handle.await;

    match Arc::try_unwrap(cache) {
        Ok(mut cache) => cache.deinit(),
        // A sweep still running on the blocking pool holds the last
        // reference; teardown happens when it drops.
        Err(_) => warn!("Sweep still in flight, deferring teardown"),
    }

    info!("Hostname cache shutdown complete");
    Ok(())
}

fn run_client(config: &Config, command: ClientCommand) -> anyhow::Result<ExitCode> {
    let cache = HostnameCache::attach(&config.segment_name, config.lock_timeout)
        .with_context(|| format!("failed to attach to {}", config.segment_name))?;

    match command {
        ClientCommand::Insert { key, alias, ttl } => {
            let ttl = Duration::from_secs(ttl.unwrap_or(config.default_ttl));
            let inserted = cache.insert_or_assign(&key, &alias, ttl)?;
            println!("{}", if inserted { "inserted" } else { "updated" });
        }
        ClientCommand::Lookup { key } => match cache.lookup(&key)? {
            Some(alias) => println!("{alias}"),
            None => {
                eprintln!("{key}: not found");
                return Ok(ExitCode::FAILURE);
            }
        },
        ClientCommand::Erase { key } => {
            let removed = cache.erase(&key)?;
            println!("{}", if removed { "erased" } else { "absent" });
        }
        ClientCommand::Sweep => println!("{}", cache.erase_expired_entries()?),
        ClientCommand::Clear => {
            cache.clear()?;
            println!("cleared");
        }
        ClientCommand::Status => {
            println!("{}", serde_json::to_string_pretty(&cache.stats()?)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(%err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(%err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
