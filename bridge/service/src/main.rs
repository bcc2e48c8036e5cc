// Copyright (c) 2024 The Botho Foundation

//! Lock Relay
//!
//! Watches a bridge contract for `TokensLocked` events and forwards each one
//! to the relaying service.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lock_relay_core::{
    Checkpoint, CommandQueue, ListenerConfig, OperatorCommand, TokensLockedDecoder, TxHash,
};
use lock_relay_service::{
    load_or_init_checkpoint, watch_interrupts, CycleOutcome, EthereumChainReader,
    HttpRelayNotifier, ScanEngine, Shutdown,
};

#[derive(Parser)]
#[command(name = "lock-relay")]
#[command(about = "Relays TokensLocked bridge events to the relaying service")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "lock-relay.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the listener
    Run {
        /// Rescan from this block (overrides saved progress)
        #[arg(long)]
        from_block: Option<u64>,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Show checkpoint status
    Status,

    /// List pending dispatches
    Pending,

    /// Make a pending or parked dispatch due immediately
    Requeue {
        /// Source transaction hash
        tx: String,
    },

    /// Drop a pending dispatch without relaying it
    Purge {
        /// Source transaction hash
        tx: String,
    },

    /// Validate configuration
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            if matches!(cli.command, Commands::ValidateConfig) {
                eprintln!("Configuration validation failed: {:#}", e);
                std::process::exit(1);
            }
            return Err(e);
        }
    };

    match cli.command {
        Commands::Run { from_block, once } => run_listener(&config, from_block, once).await,
        Commands::Status => show_status(&config),
        Commands::Pending => show_pending(&config),
        Commands::Requeue { tx } => requeue(&config, &tx),
        Commands::Purge { tx } => purge(&config, &tx),
        Commands::ValidateConfig => validate_config(&config),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}

fn load_config(path: &Path) -> Result<ListenerConfig> {
    let mut config = ListenerConfig::load(path)?;
    config.apply_env()?;
    Ok(config)
}

async fn run_listener(config: &ListenerConfig, from_block: Option<u64>, once: bool) -> Result<()> {
    let settings = config.scan_settings()?;

    info!("Lock relay starting...");
    info!("  Source RPC: {}", config.source.rpc_url);
    info!("  Contract: {}", settings.contract);
    info!("  Relayer: {}", config.relayer.endpoint);
    info!("  Confirmations: {}", settings.confirmation_depth);
    info!("  State file: {}", config.listener.state_file.display());

    if settings.event_topic != TokensLockedDecoder::signature_topic() {
        warn!(
            "Configured event topic {} is not TokensLocked ({}); logs may fail to decode",
            settings.event_topic,
            TokensLockedDecoder::signature_topic()
        );
    }

    let chain = EthereumChainReader::connect(&config.source.rpc_url, config.rpc_timeout())
        .await
        .context("failed to connect to source chain")?;
    let relay = HttpRelayNotifier::new(config.relayer_endpoint()?, config.relayer_timeout())?;

    let state_file = config.listener.state_file.clone();
    let mut checkpoint = load_or_init_checkpoint(&chain, &settings, &state_file).await?;

    if let Some(block) = from_block {
        checkpoint
            .rewind_to(block.saturating_sub(1))
            .context("refusing --from-block")?;
    }

    info!(
        "Resuming after block {} ({} relayed, {} pending)",
        checkpoint.last_scanned_block(),
        checkpoint.processed_count(),
        checkpoint.pending_count()
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut shutdown = Shutdown::new(shutdown_rx);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, signal_tx).await {
            warn!("Second interrupt, exiting without a final flush");
            std::process::exit(130);
        }
    });

    let mut engine = ScanEngine::new(
        chain,
        TokensLockedDecoder,
        relay,
        settings,
        checkpoint,
        state_file,
    );

    if once {
        match engine.run_cycle(&mut shutdown).await? {
            CycleOutcome::Idle { head, .. } => {
                info!("No new confirmed blocks (head {})", head);
            }
            CycleOutcome::Scanned { range, report, .. } => {
                info!(
                    "Scanned blocks {}: {} relayed, {} pending retries recovered",
                    range, report.relayed, report.recovered
                );
            }
            CycleOutcome::Interrupted { .. } => info!("Cycle interrupted"),
        }
        info!("Single cycle complete, exiting");
    } else {
        engine.run_forever(&mut shutdown).await?;
    }

    drop(shutdown_tx);
    Ok(())
}

fn load_checkpoint(config: &ListenerConfig) -> Result<Option<Checkpoint>> {
    Ok(Checkpoint::load(&config.listener.state_file)?)
}

fn parse_tx(tx: &str) -> Result<TxHash> {
    tx.trim()
        .parse::<TxHash>()
        .with_context(|| format!("invalid transaction hash {:?}", tx))
}

fn show_status(config: &ListenerConfig) -> Result<()> {
    match load_checkpoint(config)? {
        Some(checkpoint) => {
            println!("{}", checkpoint.summary());
            let queued = CommandQueue::for_state_file(&config.listener.state_file).read()?;
            if !queued.commands.is_empty() {
                println!("  Queued operator commands: {}", queued.commands.len());
            }
        }
        None => println!(
            "No checkpoint at {}. The listener has not run yet.",
            config.listener.state_file.display()
        ),
    }
    Ok(())
}

fn show_pending(config: &ListenerConfig) -> Result<()> {
    let Some(checkpoint) = load_checkpoint(config)? else {
        println!("No checkpoint at {}.", config.listener.state_file.display());
        return Ok(());
    };

    if checkpoint.pending_count() == 0 {
        println!("No pending dispatches.");
        return Ok(());
    }

    for pending in checkpoint.pending() {
        let state = if pending.parked { "parked" } else { "waiting" };
        println!(
            "{} block={} attempts={} {} next={} error={}",
            pending.event.transaction_hash,
            pending.event.block_height,
            pending.attempts,
            state,
            pending.next_attempt_at.format("%Y-%m-%d %H:%M:%S UTC"),
            pending.last_error
        );
    }
    Ok(())
}

fn requeue(config: &ListenerConfig, tx: &str) -> Result<()> {
    let tx = parse_tx(tx)?;
    queue_command(config, OperatorCommand::Requeue { tx })?;
    println!("Queued requeue of {}. The listener retries it on its next cycle.", tx);
    Ok(())
}

fn purge(config: &ListenerConfig, tx: &str) -> Result<()> {
    let tx = parse_tx(tx)?;
    queue_command(config, OperatorCommand::Purge { tx })?;
    println!("Queued purge of {}. The listener drops it on its next cycle.", tx);
    Ok(())
}

/// Hand a command to the listener, which owns the checkpoint. It is applied
/// on the next cycle, or on the next `run` if no listener is running.
fn queue_command(config: &ListenerConfig, command: OperatorCommand) -> Result<()> {
    let state_file = &config.listener.state_file;
    let Some(checkpoint) = load_checkpoint(config)? else {
        bail!("no checkpoint at {}", state_file.display());
    };
    if !checkpoint.is_pending(command.tx()) {
        bail!("transaction {} is not pending", command.tx());
    }

    let path = CommandQueue::for_state_file(state_file).submit(&command)?;
    info!("Wrote {} to {}", command, path.display());
    Ok(())
}

fn validate_config(config: &ListenerConfig) -> Result<()> {
    let settings = config.scan_settings()?;

    println!("Configuration is valid.");
    println!("  RPC endpoint: {}", config.source.rpc_url);
    println!("  Contract: {}", settings.contract);
    println!("  Event topic: {}", settings.event_topic);
    println!("  Relayer: {}", config.relayer.endpoint);
    println!("  Confirmations: {}", settings.confirmation_depth);
    println!("  Max block range: {}", settings.max_block_range);
    println!("  Poll interval: {:?}", settings.poll_interval);
    match settings.start_block {
        Some(start) => println!("  Start block: {}", start),
        None => println!("  Start block: chain head"),
    }
    if settings.event_topic != TokensLockedDecoder::signature_topic() {
        println!(
            "  Warning: event topic is not TokensLocked ({})",
            TokensLockedDecoder::signature_topic()
        );
    }
    Ok(())
}
