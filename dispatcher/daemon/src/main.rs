//! Dispatcher Daemon - Line-Oriented Model Router
//!
//! Loads configuration, starts one router over the file store and drives it
//! from newline-delimited JSON commands on stdin. Replies and completion
//! events go to stdout; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Dry run with the echo executor
//! dispatcher-daemon --store ./backends.toml
//!
//! # Real backends through Ollama, one lane per backend
//! dispatcher-daemon --executor ollama --lanes per-backend --timeout-ms 60000
//!
//! # Verbose logging
//! RUST_LOG=debug dispatcher-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: stop reading commands, drain the queue and exit
//! - `SIGHUP`: reload the backend store

mod protocol;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use dispatcher_core::{
    load_config_from_path, ConfigOverrides, ConfigStore, CostTierMode, EchoExecutor, Executor,
    FileConfigStore, LaneMode, OllamaExecutor, Router, RouterSettings,
};

/// Dispatcher Daemon - policy-driven model request router
#[derive(Parser, Debug)]
#[command(name = "dispatcher-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "DISPATCHER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend store path
    #[arg(short = 's', long, value_name = "FILE")]
    store: Option<PathBuf>,

    /// Lane mode (single, per-backend)
    #[arg(long, value_name = "MODE")]
    lanes: Option<LaneMode>,

    /// Execution timeout in milliseconds (0 disables)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Cost tier mode (advisory, strict)
    #[arg(long, value_name = "MODE")]
    cost_tier_mode: Option<CostTierMode>,

    /// How requests are executed
    #[arg(long, value_enum, default_value_t = ExecutorKind::Echo)]
    executor: ExecutorKind,

    /// Endpoint for backends that do not declare one (ollama executor)
    #[arg(long, value_name = "URL")]
    ollama_endpoint: Option<String>,

    /// Artificial latency added by the echo executor
    #[arg(long, value_name = "MS", default_value_t = 0)]
    simulated_latency_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "DISPATCHER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ExecutorKind {
    /// Echo payloads back without calling a model
    Echo,
    /// Call Ollama's generate API
    Ollama,
}

/// Initialize logging on stderr; stdout carries the protocol
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "dispatcher_daemon={level},dispatcher_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn build_executor(args: &Args) -> Result<Arc<dyn Executor>> {
    match args.executor {
        ExecutorKind::Echo => Ok(Arc::new(
            EchoExecutor::new().with_latency(Duration::from_millis(args.simulated_latency_ms)),
        )),
        ExecutorKind::Ollama => {
            let mut executor = OllamaExecutor::new().context("Failed to build HTTP client")?;
            if let Some(endpoint) = &args.ollama_endpoint {
                executor = executor.with_fallback_endpoint(endpoint.clone());
            }
            Ok(Arc::new(executor))
        }
    }
}

fn overrides(args: &Args) -> ConfigOverrides {
    let mut overrides = ConfigOverrides::new();
    if let Some(path) = &args.store {
        overrides = overrides.with_store_path(path.clone());
    }
    if let Some(mode) = args.lanes {
        overrides = overrides.with_lane_mode(mode);
    }
    if let Some(ms) = args.timeout_ms {
        overrides = overrides.with_execution_timeout_ms(ms);
    }
    if let Some(mode) = args.cost_tier_mode {
        overrides = overrides.with_cost_tier_mode(mode);
    }
    overrides
}

/// Reload the store whenever SIGHUP arrives
#[cfg(unix)]
fn spawn_reload_on_hangup(router: Arc<Router>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(sighup) => sighup,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };

        while sighup.recv().await.is_some() {
            info!("Received SIGHUP, reloading backend store");
            if let Err(e) = router.reload() {
                error!(error = %e, "Reload failed, keeping current configuration");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_router: Arc<Router>) {}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Dispatcher daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config_from_path(args.config.clone()).context("Failed to load config")?;
    overrides(&args)
        .apply(&mut config)
        .context("Invalid command-line overrides")?;

    info!(
        source = %config.source(),
        store = ?config.store_path,
        lane_mode = %config.lane_mode,
        "Configuration loaded"
    );

    let store = Arc::new(FileConfigStore::new(config.store_path.clone())) as Arc<dyn ConfigStore>;
    let executor = build_executor(&args)?;
    let router = Arc::new(Router::start(RouterSettings::from(&config), store, executor));

    spawn_reload_on_hangup(Arc::clone(&router));

    // Single writer keeps stdout lines whole
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = lines_rx.recv().await {
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!(error = %e, "Failed to write to stdout");
                break;
            }
            if let Err(e) = stdout.flush().await {
                error!(error = %e, "Failed to flush stdout");
                break;
            }
        }
    });

    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = commands.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = protocol::handle_line(&router, &line, &lines_tx);
                    protocol::emit(&lines_tx, &response);
                }
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read command");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("Received interrupt, initiating shutdown");
                break;
            }
        }
    }

    router.shutdown().await;
    drop(lines_tx);
    if let Err(e) = writer.await {
        warn!(error = %e, "Output writer ended abnormally");
    }

    info!("Dispatcher daemon stopped cleanly");
    Ok(())
}
