use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use restrictor::config::RestrictorConfig;
use restrictor::ratelimit::{RateLimitCoordinator, RuleSet};
use restrictor::store::build_store;

/// Drive a configured rate limit rule and report its decisions.
#[derive(Debug, Parser)]
#[command(name = "restrictor", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule to exercise
    #[arg(short, long, default_value = "default")]
    rule: String,

    /// Caller key to decide for
    #[arg(short, long, default_value = "demo")]
    key: String,

    /// Number of decisions to request
    #[arg(short = 'n', long, default_value_t = 10)]
    requests: u64,

    /// Pause between requests in milliseconds
    #[arg(short, long, default_value_t = 100)]
    interval_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default)]
struct Summary {
    allowed: u64,
    limited: u64,
    errors: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Restrictor");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => RestrictorConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RestrictorConfig::default(),
    };
    info!(backend = ?config.store.backend, rules = config.rules.len(), "Configuration loaded");

    let store = build_store(&config.store).await?;
    let rules = RuleSet::build(&config.rules, store)?;
    let coordinator = rules
        .get(&args.rule)
        .with_context(|| format!("unknown rule '{}', known rules: {:?}", args.rule, rules.names()))?;
    info!(
        rule = %args.rule,
        limit = coordinator.limit(),
        window_secs = coordinator.window_secs(),
        bucket_span = coordinator.bucket_span(),
        "Rule selected"
    );

    let mut summary = Summary::default();
    tokio::select! {
        _ = run(&coordinator, &args, &mut summary) => {}
        _ = shutdown_signal() => {}
    }

    info!(
        allowed = summary.allowed,
        limited = summary.limited,
        errors = summary.errors,
        "Restrictor stopped"
    );
    println!(
        "allowed={} limited={} errors={}",
        summary.allowed, summary.limited, summary.errors
    );
    Ok(())
}

async fn run(coordinator: &RateLimitCoordinator, args: &Args, summary: &mut Summary) {
    let interval = Duration::from_millis(args.interval_ms);

    for request in 1..=args.requests {
        match coordinator.check(&args.key).await {
            Ok(decision) if decision.is_allowed() => {
                summary.allowed += 1;
                info!(request = request, count = decision.count, "Allowed");
            }
            Ok(decision) => {
                summary.limited += 1;
                info!(request = request, count = decision.count, "Limited");
            }
            Err(e) => {
                summary.errors += 1;
                if e.decision().reached {
                    summary.limited += 1;
                } else {
                    summary.allowed += 1;
                }
                warn!(request = request, error = %e, "Decision failed");
            }
        }

        if request < args.requests {
            tokio::time::sleep(interval).await;
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
