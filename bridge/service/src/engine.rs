// Copyright (c) 2024 The Botho Foundation

//! Scan engine - drives the poll loop and owns the checkpoint.
//!
//! One cycle:
//!
//! 1. Apply queued operator commands (requeue, purge).
//! 2. Retry pending dispatches that are due.
//! 3. Ask the chain for its head and compute the next confirmed range.
//! 4. Fetch the range's logs, then decode, deduplicate and relay each one.
//! 5. Advance `last_scanned_block` to the end of the range.
//! 6. Flush the checkpoint, then drop the applied command files.
//!
//! A chain failure aborts the cycle without advancing, so the whole range
//! is fetched again next time. Decode and relay failures never block
//! advancement: decode failures are dropped, relay failures become pending
//! dispatches retried with backoff.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use lock_relay_core::{
    BlockHeight, BlockRange, Checkpoint, CheckpointError, CommandQueue, EventDecoder,
    QueuedCommands, RawLogRecord, ScanSettings,
};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use crate::chain::ChainReader;
use crate::error::EngineError;
use crate::relay::RelayNotifier;

/// Shutdown signal type.
pub type ShutdownSignal = broadcast::Receiver<()>;

/// Cooperative shutdown flag fed by a broadcast channel. A closed channel
/// counts as a shutdown request.
pub struct Shutdown {
    rx: ShutdownSignal,
    triggered: bool,
}

impl Shutdown {
    pub fn new(rx: ShutdownSignal) -> Self {
        Self {
            rx,
            triggered: false,
        }
    }

    /// Non-blocking check.
    pub fn is_triggered(&mut self) -> bool {
        if !self.triggered {
            match self.rx.try_recv() {
                Ok(()) | Err(TryRecvError::Closed) | Err(TryRecvError::Lagged(_)) => {
                    self.triggered = true;
                }
                Err(TryRecvError::Empty) => {}
            }
        }
        self.triggered
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&mut self) {
        if !self.triggered {
            let _ = self.rx.recv().await;
            self.triggered = true;
        }
    }
}

/// Forward the first interrupt to `shutdown`.
///
/// Resolves `true` on a second interrupt, when the caller should exit
/// without waiting for the engine, and `false` if interrupts cannot be
/// observed.
pub async fn watch_interrupts<F, Fut>(mut interrupt: F, shutdown: broadcast::Sender<()>) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if let Err(e) = interrupt().await {
        warn!("Cannot listen for interrupts: {}", e);
        return false;
    }
    info!("Received shutdown signal, interrupt again to exit immediately");
    let _ = shutdown.send(());

    interrupt().await.is_ok()
}

/// Counters for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Logs returned for the scanned range
    pub logs: usize,
    /// Events relayed for the first time
    pub relayed: usize,
    /// Logs skipped because their transaction was already handled
    pub duplicates: usize,
    pub decode_failures: usize,
    /// New events whose relay call failed and are now pending
    pub relay_failures: usize,
    /// Pending dispatches attempted again
    pub retried: usize,
    /// Pending dispatches that succeeded this time
    pub recovered: usize,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No new block is final yet.
    Idle {
        head: BlockHeight,
        report: CycleReport,
    },
    /// `range` was fully attempted and the checkpoint advanced past it.
    /// `target` is the highest confirmed block at the time.
    Scanned {
        range: BlockRange,
        target: BlockHeight,
        report: CycleReport,
    },
    /// Shutdown was requested before the cycle finished; nothing advanced.
    Interrupted { report: CycleReport },
}

impl CycleOutcome {
    pub fn report(&self) -> &CycleReport {
        match self {
            CycleOutcome::Idle { report, .. }
            | CycleOutcome::Scanned { report, .. }
            | CycleOutcome::Interrupted { report } => report,
        }
    }

    /// More confirmed blocks remain after this cycle.
    pub fn is_behind(&self) -> bool {
        matches!(self, CycleOutcome::Scanned { range, target, .. } if range.to < *target)
    }
}

/// Result of handling one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Relayed,
    Duplicate,
    DecodeFailed,
    RelayFailed,
}

/// Produce the starting checkpoint: the persisted one if present, else one
/// derived from the configured start block or the current chain head.
pub async fn load_or_init_checkpoint<C: ChainReader>(
    chain: &C,
    settings: &ScanSettings,
    state_file: &Path,
) -> Result<Checkpoint, EngineError> {
    if let Some(checkpoint) = Checkpoint::load(state_file)? {
        return Ok(checkpoint);
    }

    let last_scanned = match settings.start_block {
        Some(start) => {
            info!("Starting scan from configured block {}", start);
            start.saturating_sub(1)
        }
        None => {
            let head = chain.current_height().await?;
            let first = head.saturating_sub(settings.confirmation_depth) + 1;
            info!(
                "Starting scan from block {} (head {}, {} confirmations)",
                first, head, settings.confirmation_depth
            );
            first - 1
        }
    };

    Ok(Checkpoint::new(last_scanned))
}

/// The main scan engine. Sole owner of the checkpoint.
pub struct ScanEngine<C, D, R> {
    chain: C,
    decoder: D,
    relay: R,
    settings: ScanSettings,
    checkpoint: Checkpoint,
    state_file: PathBuf,
    commands: CommandQueue,
}

impl<C, D, R> ScanEngine<C, D, R>
where
    C: ChainReader,
    D: EventDecoder,
    R: RelayNotifier,
{
    /// Create a new scan engine.
    pub fn new(
        chain: C,
        decoder: D,
        relay: R,
        settings: ScanSettings,
        checkpoint: Checkpoint,
        state_file: impl Into<PathBuf>,
    ) -> Self {
        let state_file = state_file.into();
        Self {
            chain,
            decoder,
            relay,
            settings,
            checkpoint,
            commands: CommandQueue::for_state_file(&state_file),
            state_file,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Persist the checkpoint.
    pub fn flush(&self) -> Result<(), CheckpointError> {
        self.checkpoint.save(&self.state_file)
    }

    /// Run until shutdown, then flush one last time.
    pub async fn run_forever(&mut self, shutdown: &mut Shutdown) -> Result<(), EngineError> {
        info!(
            "Starting scan engine for contract {} after block {}",
            self.settings.contract,
            self.checkpoint.last_scanned_block()
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            let pause = match self.run_cycle(shutdown).await {
                Ok(CycleOutcome::Scanned {
                    range,
                    target,
                    report,
                }) => {
                    info!(
                        "Scanned blocks {}: {} logs, {} relayed, {} duplicates, {} undecodable, {} pending",
                        range,
                        report.logs,
                        report.relayed,
                        report.duplicates,
                        report.decode_failures,
                        self.checkpoint.pending_count()
                    );
                    // Keep going without sleeping while catching up.
                    (range.to >= target).then_some(self.settings.poll_interval)
                }
                Ok(CycleOutcome::Idle { head, .. }) => {
                    info!(
                        "No new confirmed blocks (head {}, waiting for {} confirmations)",
                        head, self.settings.confirmation_depth
                    );
                    Some(self.settings.poll_interval)
                }
                Ok(CycleOutcome::Interrupted { .. }) => break,
                Err(EngineError::Chain(e)) if e.is_transient() => {
                    error!("Chain error, range will be retried next cycle: {}", e);
                    Some(self.settings.poll_interval)
                }
                Err(EngineError::Chain(e)) => {
                    error!(
                        "Node rejected the log query: {}. If it caps the block span per query, \
                         lower source.max_block_range (currently {})",
                        e, self.settings.max_block_range
                    );
                    Some(self.settings.poll_interval)
                }
                Err(EngineError::Checkpoint(e)) => {
                    error!("Failed to persist checkpoint: {}", e);
                    Some(self.settings.poll_interval)
                }
            };

            if let Some(pause) = pause {
                debug!("Sleeping for {:?} until next poll", pause);
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!("Shutdown requested, flushing checkpoint");
        self.flush()?;
        info!(
            "Scan engine stopped at block {}",
            self.checkpoint.last_scanned_block()
        );
        Ok(())
    }

    /// Run one cycle and flush the checkpoint, whatever the outcome.
    pub async fn run_cycle(&mut self, shutdown: &mut Shutdown) -> Result<CycleOutcome, EngineError> {
        let queued = self.apply_commands();
        let outcome = self.scan(shutdown).await;
        let flushed = self.flush();
        if flushed.is_ok() {
            self.commands.acknowledge(queued);
        }
        let outcome = outcome?;
        flushed?;
        Ok(outcome)
    }

    fn apply_commands(&mut self) -> QueuedCommands {
        match self.commands.apply_to(&mut self.checkpoint, Utc::now()) {
            Ok(queued) => queued,
            Err(e) => {
                warn!("Failed to read operator commands: {}", e);
                QueuedCommands::default()
            }
        }
    }

    async fn scan(&mut self, shutdown: &mut Shutdown) -> Result<CycleOutcome, EngineError> {
        let mut report = CycleReport::default();

        self.retry_pending(shutdown, &mut report).await;
        if shutdown.is_triggered() {
            return Ok(CycleOutcome::Interrupted { report });
        }

        let head = self.chain.current_height().await?;
        let last_scanned = self.checkpoint.last_scanned_block();
        let Some(range) = BlockRange::next_confirmed(
            last_scanned,
            head,
            self.settings.confirmation_depth,
            self.settings.max_block_range,
        ) else {
            return Ok(CycleOutcome::Idle { head, report });
        };
        let target = head - self.settings.confirmation_depth;

        debug!("Scanning blocks {} (head {}, target {})", range, head, target);

        let logs = self
            .chain
            .logs_in_range(range, self.settings.contract, self.settings.event_topic)
            .await?;
        report.logs = logs.len();

        for log in &logs {
            if shutdown.is_triggered() {
                info!(
                    "Shutdown during blocks {}, the range will be fetched again",
                    range
                );
                return Ok(CycleOutcome::Interrupted { report });
            }

            match self.dispatch_log(log).await {
                Dispatch::Relayed => report.relayed += 1,
                Dispatch::Duplicate => report.duplicates += 1,
                Dispatch::DecodeFailed => report.decode_failures += 1,
                Dispatch::RelayFailed => report.relay_failures += 1,
            }
        }

        self.checkpoint.advance_to(range.to);

        if let Some(retention) = self.settings.processed_retention {
            let pruned = self.checkpoint.prune_processed(retention);
            if pruned > 0 {
                debug!("Pruned {} processed transaction ids", pruned);
            }
        }

        Ok(CycleOutcome::Scanned {
            range,
            target,
            report,
        })
    }

    async fn dispatch_log(&mut self, log: &RawLogRecord) -> Dispatch {
        let tx = log.transaction_hash;
        if self.checkpoint.is_known(&tx) {
            debug!("Skipping already handled transaction {}", tx);
            return Dispatch::Duplicate;
        }

        let event = match self.decoder.decode(log) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Failed to decode log from tx {} at block {}: {}",
                    tx, log.block_height, e
                );
                return Dispatch::DecodeFailed;
            }
        };

        info!(
            "Relaying lock of {} from {} to chain {} (tx {})",
            event.amount, event.user, event.destination_chain_id, tx
        );

        match self.relay.submit(&event).await {
            Ok(()) => {
                self.checkpoint.mark_processed(tx, Some(event.block_height));
                info!("Relayed event from tx {}", tx);
                Dispatch::Relayed
            }
            Err(e) => {
                let pending = self.checkpoint.record_failure(
                    &event,
                    &e.to_string(),
                    &self.settings.retry,
                    Utc::now(),
                );
                warn!(
                    "Failed to relay tx {}: {}. Will retry at {}",
                    tx, e, pending.next_attempt_at
                );
                Dispatch::RelayFailed
            }
        }
    }

    async fn retry_pending(&mut self, shutdown: &mut Shutdown, report: &mut CycleReport) {
        let due = self.checkpoint.due_dispatches(Utc::now());
        if due.is_empty() {
            return;
        }

        info!("Retrying {} pending dispatch(es)", due.len());

        for event in due {
            if shutdown.is_triggered() {
                return;
            }
            report.retried += 1;

            let tx = event.transaction_hash;
            match self.relay.submit(&event).await {
                Ok(()) => {
                    self.checkpoint.mark_processed(tx, Some(event.block_height));
                    report.recovered += 1;
                    info!("Relayed pending event from tx {}", tx);
                }
                Err(e) => {
                    let pending = self.checkpoint.record_failure(
                        &event,
                        &e.to_string(),
                        &self.settings.retry,
                        Utc::now(),
                    );
                    if pending.parked {
                        error!(
                            "Giving up on tx {} after {} attempts: {}. Requeue or purge it manually",
                            tx, pending.attempts, e
                        );
                    } else {
                        warn!(
                            "Retry {} for tx {} failed: {}. Next attempt at {}",
                            pending.attempts, tx, e, pending.next_attempt_at
                        );
                    }
                }
            }
        }
    }
}
