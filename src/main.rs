//! tiercache command-line tool
//!
//! Inspect and maintain a cache directory, or keep a cache open and expose
//! its statistics over HTTP.
//!
//! ```text
//! tiercache --cache-dir ./cache put conversation:42 '{"title":"hello"}'
//! tiercache --cache-dir ./cache get conversation:42
//! tiercache --cache-dir ./cache serve --addr 0.0.0.0:9464
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::exporter::{self, CacheExporter};
use tiercache::{parse_duration, CacheConfig, CacheManager, Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - two-tier cache maintenance tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache directory (overrides the config file)
    #[arg(long, env = "TIERCACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a cached value as JSON
    Get { key: String },

    /// Store a JSON value
    Put {
        key: String,
        /// Value as JSON
        #[arg(value_parser = parse_json)]
        value: Value,
        /// Time-to-live, e.g. "12h" (default from configuration)
        #[arg(long, value_parser = parse_ttl)]
        ttl: Option<Duration>,
    },

    /// Remove a key from every tier
    Remove { key: String },

    /// Delete every cached entry
    Clear,

    /// Delete expired and unreadable disk entries now
    Cleanup,

    /// Print cache statistics as JSON
    Stats,

    /// Keep the cache open and serve /metrics and /healthz
    Serve {
        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9464")]
        addr: String,
    },
}

fn parse_json(raw: &str) -> std::result::Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {}", e))
}

fn parse_ttl(raw: &str) -> std::result::Result<Duration, String> {
    parse_duration(raw).map_err(|e| e.to_string())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }

    let manager = CacheManager::open(config).await?;
    let outcome = run(&manager, args.command).await;
    manager.shutdown().await;
    outcome
}

async fn run(manager: &CacheManager, command: Command) -> Result<ExitCode> {
    match command {
        Command::Get { key } => match manager.get::<Value>(&key).await {
            Some(value) => {
                println!("{}", to_json(&value)?);
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("miss: {}", key);
                Ok(ExitCode::FAILURE)
            }
        },
        Command::Put { key, value, ttl } => {
            match ttl {
                Some(ttl) => manager.put_with_ttl(&key, value, ttl).await?,
                None => manager.put(&key, value).await?,
            }
            info!(key = %key, "Stored");
            Ok(ExitCode::SUCCESS)
        }
        Command::Remove { key } => {
            if manager.remove(&key).await {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("not cached: {}", key);
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Clear => {
            manager.clear_all().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Cleanup => {
            let removed = manager.cleanup().await;
            println!("removed {} entries", removed);
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats => {
            println!("{}", to_json(&manager.get_stats().await)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { addr } => {
            serve(manager, &addr).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| Error::Codec(e.to_string()))
}

async fn serve(manager: &CacheManager, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server on {}: {}", addr, e)))?;
    let exporter = Arc::new(CacheExporter::new()?);
    let shutdown = CancellationToken::new();

    let server = tokio::spawn(exporter::serve(
        listener,
        manager.clone(),
        exporter,
        shutdown.clone(),
    ));

    info!("Cache open at {}", manager.config().cache_dir.display());
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");

    shutdown.cancel();
    server.await?
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

    // Logs go to stderr; stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
