use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use rate::{LimitsConfig, Limiter, Registry};

/// Drive and inspect in-process rate limiters.
#[derive(Parser, Debug)]
#[command(name = "rate", version)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hammer a limiter from worker threads and report what got through
    Demo(DemoArgs),
    /// Load and validate a limits file
    CheckConfig {
        /// Path to the YAML limits file
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Algorithm name: counter, leaky-bucket or token-bucket
    #[arg(long, default_value = "token-bucket")]
    algorithm: String,

    /// Permits per period
    #[arg(long, default_value_t = 100)]
    capacity: u64,

    /// Period, e.g. 1s or 250ms
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    period: Duration,

    /// Requests issued by each worker
    #[arg(long, default_value_t = 120)]
    requests: u64,

    /// Number of worker threads
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Wait for permits instead of counting refusals
    #[arg(long)]
    blocking: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Demo(args) => run_demo(args).await,
        Command::CheckConfig { path } => check_config(&path),
    }
}

async fn run_demo(args: DemoArgs) -> anyhow::Result<()> {
    let registry = Registry::new();
    let limiter = registry
        .try_create(&args.algorithm, args.capacity, args.period)
        .with_context(|| format!("cannot build limiter {:?}", args.algorithm))?;

    info!(
        algorithm = %args.algorithm,
        capacity = limiter.capacity(),
        period = ?args.period,
        workers = args.workers,
        blocking = args.blocking,
        "Starting demo"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let admitted = Arc::new(AtomicU64::new(0));
    let denied = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let workers: Vec<_> = (0..args.workers)
        .map(|worker| {
            let limiter = limiter.clone();
            let stop = stop.clone();
            let admitted = admitted.clone();
            let denied = denied.clone();
            let (requests, blocking) = (args.requests, args.blocking);

            tokio::task::spawn_blocking(move || {
                for request in 0..requests {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if blocking {
                        limiter.take_blocked(1);
                        admitted.fetch_add(1, Ordering::Relaxed);
                    } else if limiter.take(1) {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    } else {
                        denied.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            worker = worker,
                            request = request,
                            available = limiter.available(),
                            "Take refused"
                        );
                    }
                }
            })
        })
        .collect();

    let finished = async {
        for worker in workers {
            worker.await?;
        }
        Ok::<_, tokio::task::JoinError>(())
    };

    tokio::select! {
        result = finished => result.map_err(|e| anyhow!("worker failed: {}", e))?,
        _ = shutdown_signal() => {
            stop.store(true, Ordering::Relaxed);
        }
    }

    info!(
        admitted = admitted.load(Ordering::Relaxed),
        denied = denied.load(Ordering::Relaxed),
        available = limiter.available(),
        elapsed = ?started.elapsed(),
        "Demo finished"
    );

    limiter.close();
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping workers");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping workers");
        }
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = LimitsConfig::from_file(path)?;
    let registry = Registry::new();
    config.validate(&registry)?;

    for limiter in &config.rate_limits {
        info!(
            name = %limiter.name,
            algorithm = %limiter.algorithm,
            max_requests = limiter.max_requests,
            interval = ?limiter.interval,
            header = %limiter.header_key_name,
            enabled = limiter.enabled,
            idle_timeout = ?limiter.idle_timeout,
            max_keys = limiter.max_keys,
            "Limiter configuration OK"
        );
    }

    info!(count = config.rate_limits.len(), path = %path.display(), "Configuration valid");
    Ok(())
}
