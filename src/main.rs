//! Sweep Push Client
//!
//! Connects to the sweep service's push channel for one wallet and logs
//! every event it delivers:
//! - transaction status and price ticks
//! - subscription triggers
//! - consolidation progress for the requested ids

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

use sweep_push::config::AppConfig;
use sweep_push::network::{ConnectionManager, Event, EventKind};
use sweep_push::telemetry::{init_logging, init_metrics};
use sweep_push::utils::helpers::short_wallet;
use sweep_push::utils::types::{ConsolidationProgress, PriceTick, TransactionStatus};

/// Sweep push channel client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Wallet to subscribe as (overrides config)
    #[arg(short, long)]
    wallet: Option<String>,

    /// Sweep id to follow; repeatable
    #[arg(long = "sweep")]
    sweeps: Vec<String>,

    /// Consolidation id to follow; repeatable
    #[arg(long = "consolidation")]
    consolidations: Vec<String>,

    /// Override push endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    // Apply CLI overrides
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }
    if let Some(endpoint) = args.endpoint {
        config.push = config.push.with_endpoint(endpoint);
        config.validate()?;
    }
    config.sweeps.extend(args.sweeps);
    config.consolidations.extend(args.consolidations);

    // Initialize logging
    let _log_guard = init_logging(&config.telemetry)?;
    info!("Starting sweep push client v{}", env!("CARGO_PKG_VERSION"));

    if config.telemetry.enable_metrics {
        init_metrics(config.telemetry.metrics_port)?;
    }

    let Some(wallet) = args.wallet.or_else(|| config.wallet.clone()) else {
        anyhow::bail!("No wallet given; pass --wallet or set `wallet` in the config file");
    };

    let manager = ConnectionManager::with_websocket(&config.push)?;

    let progress = manager.on(EventKind::ConsolidationUpdate, |event| {
        if let Some(msg) = event.push_message() {
            let update: ConsolidationProgress = msg.decode()?;
            info!(
                "Consolidation {} {} ({:.0}%, {}/{} chains)",
                update.consolidation_id,
                update.status,
                update.progress_percent,
                update.completed_chains,
                update.total_chains
            );
        }
        Ok(())
    });

    let printer = manager.event_bus().spawn_handler("cli", |event| async move {
        match event {
            Event::Connected => info!("Push channel connected"),
            Event::Error { message } => warn!("Push channel error: {}", message),
            Event::StateChanged { from, to } => info!("State {} -> {}", from, to),
            Event::TransactionUpdate(msg) => {
                let tx: TransactionStatus = msg.decode()?;
                info!("Transaction {} on {}: {}", tx.hash, tx.chain, tx.status);
            }
            Event::PriceUpdate(msg) => {
                let tick: PriceTick = msg.decode()?;
                info!("{} ${:.4}", tick.token, tick.price_usd);
            }
            Event::SubscriptionTrigger(msg) => info!("subscription_trigger {}", msg.data),
            Event::ConsolidationUpdate(_) => {}
        }
        Ok::<_, anyhow::Error>(())
    });

    for sweep in &config.sweeps {
        manager.subscribe_sweep(sweep.clone());
    }
    for consolidation in &config.consolidations {
        manager.subscribe_consolidation(consolidation.clone());
    }
    info!("Connecting as {}", short_wallet(&wallet));
    manager.connect(wallet);

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, disconnecting...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    progress.dispose();
    manager.shutdown();
    drop(manager);
    match printer.await {
        Ok(handled) => info!("Event printer handled {} events", handled),
        Err(e) => warn!("Event printer ended abnormally: {}", e),
    }

    info!("Sweep push client stopped");
    Ok(())
}
