//! Async run loop and the tasks around it.

use crate::scheduler::Scheduler;
use crate::{EmitterConfig, RunReport, SchedulerError, SchedulerStats};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use shardrun_core::{Ledger, SchedulerEvent};
use shardrun_migration::{FinalityDriver, HeaderRegistry, MigrationConfig, Migrations};
use shardrun_partitioning::Partitioning;
use shardrun_types::{BlockResult, Operation, PartitionId, SignedHeader, SignedTx};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Admission-controlled emitter over a sharded ledger.
///
/// Owns the placement model across runs; everything else (graph,
/// migrations, lanes) lives for one [`Emitter::run`].
pub struct Emitter {
    config: EmitterConfig,
    migration: MigrationConfig,
    ledger: Arc<dyn Ledger>,
    partitioning: Arc<Partitioning>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl Emitter {
    /// Create an emitter with the default migration settings.
    pub fn new(config: EmitterConfig, ledger: Arc<dyn Ledger>) -> Result<Self, SchedulerError> {
        config.validate()?;
        let partitioning =
            Partitioning::new(config.num_partitions)?.with_policy(config.policy);
        let stats = SchedulerStats::new(config.num_partitions);
        Ok(Self {
            config,
            migration: MigrationConfig::default(),
            ledger,
            partitioning: Arc::new(partitioning),
            stats: Arc::new(Mutex::new(stats)),
        })
    }

    /// Override the migration settings.
    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// The emitter configuration.
    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    /// Placement model, shared with the run loop.
    pub fn partitioning(&self) -> &Arc<Partitioning> {
        &self.partitioning
    }

    /// Snapshot of the counters. Safe to call while a run is in progress.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().clone()
    }

    /// Drive `operations` until the stream ends and everything drains, or
    /// until `stop` is cancelled and everything already admitted drains.
    pub async fn run<S>(
        &self,
        operations: S,
        stop: CancellationToken,
    ) -> Result<RunReport, SchedulerError>
    where
        S: Stream<Item = Operation> + Send + 'static,
    {
        let started = Instant::now();
        *self.stats.lock() = SchedulerStats::new(self.config.num_partitions);

        let tasks = CancellationToken::new();
        let _guard = tasks.clone().drop_guard();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let registry = Arc::new(HeaderRegistry::new(self.migration.header_cache));

        let mut submitters = Vec::new();
        for partition in PartitionId::all(self.config.num_partitions) {
            let blocks = self.ledger.block_results(partition).await?;
            let headers = self.ledger.signed_headers(partition).await?;
            tokio::spawn(listen_blocks(
                partition,
                blocks,
                events_tx.clone(),
                tasks.clone(),
            ));
            tokio::spawn(listen_headers(
                partition,
                headers,
                registry.clone(),
                tasks.clone(),
            ));

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(submit_loop(
                Submitter {
                    partition,
                    ledger: self.ledger.clone(),
                    events: events_tx.clone(),
                    retries: self.config.submit_retries.max(1),
                    backoff: self.config.submit_backoff,
                },
                rx,
                tasks.clone(),
            ));
            submitters.push(tx);
        }

        let (input_tx, input_rx) = mpsc::channel(self.config.input_buffer);
        tokio::spawn(forward(operations.boxed(), input_tx, tasks.clone()));

        let driver = FinalityDriver::new(
            self.ledger.clone(),
            registry,
            self.migration.clone(),
            events_tx,
            tasks.clone(),
        );
        let mut scheduler = Scheduler::new(
            self.config.clone(),
            self.ledger.clone(),
            self.partitioning.clone(),
            driver,
            Migrations::new(self.migration.max_move2_attempts),
            self.stats.clone(),
            submitters,
        )?
        .with_input(input_rx);

        info!(
            num_partitions = self.config.num_partitions,
            window = self.config.window,
            policy = %self.config.policy,
            "Emitter started"
        );

        let mut stopping = false;
        while !scheduler.is_finished() {
            tokio::select! {
                biased;

                _ = stop.cancelled(), if !stopping => {
                    info!("Stop requested");
                    stopping = true;
                    scheduler.close_input();
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(SchedulerError::Invariant("event channel closed".into()));
                    };
                    trace!(event = event.type_name(), "Handling event");
                    scheduler.handle(event)?;
                }

                operation = scheduler.next_input(), if scheduler.admission_open() => {
                    match operation {
                        Some(operation) => {
                            scheduler.ingest(operation)?;
                            scheduler.pump_all(false)?;
                        }
                        None => scheduler.close_input(),
                    }
                }
            }
        }

        let report = scheduler.finish(started.elapsed());
        info!(
            sent = report.stats.sent,
            executed = report.stats.total_executed(),
            moved = report.stats.moved,
            failed = report.stats.failed,
            abandoned = report.stats.abandoned,
            elapsed = ?report.elapsed,
            "Emitter finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("config", &self.config)
            .field("migration", &self.migration)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Background tasks
// ═══════════════════════════════════════════════════════════════════════════

async fn listen_blocks(
    partition: PartitionId,
    mut blocks: BoxStream<'static, BlockResult>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = blocks.next() => next,
        };
        match next {
            Some(result) => {
                if events.send(SchedulerEvent::BlockCommitted(result)).is_err() {
                    return;
                }
            }
            None => {
                warn!(partition = partition.0, "Block stream ended");
                let _ = events.send(SchedulerEvent::ListenerClosed { partition });
                return;
            }
        }
    }
}

async fn listen_headers(
    partition: PartitionId,
    mut headers: BoxStream<'static, SignedHeader>,
    registry: Arc<HeaderRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = headers.next() => next,
        };
        let Some(header) = next else {
            warn!(partition = partition.0, "Header stream ended");
            return;
        };
        let height = header.height;
        let woken = registry.fulfill(header);
        trace!(partition = partition.0, height = height.0, woken, "Signed header");
    }
}

struct Submitter {
    partition: PartitionId,
    ledger: Arc<dyn Ledger>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    retries: u32,
    backoff: Duration,
}

/// Broadcast one partition's transactions in signing order.
async fn submit_loop(
    submitter: Submitter,
    mut rx: mpsc::UnboundedReceiver<SignedTx>,
    shutdown: CancellationToken,
) {
    loop {
        let tx = tokio::select! {
            _ = shutdown.cancelled() => return,
            tx = rx.recv() => match tx {
                Some(tx) => tx,
                None => return,
            },
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match submitter.ledger.submit(tx.clone()).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < submitter.retries => {
                    let delay = submitter.backoff * attempt;
                    warn!(
                        partition = submitter.partition.0,
                        tx_hash = %tx.hash,
                        attempt,
                        error = %e,
                        ?delay,
                        "Broadcast failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        partition = submitter.partition.0,
                        tx_hash = %tx.hash,
                        attempt,
                        error = %e,
                        "Broadcast failed"
                    );
                    let _ = submitter.events.send(SchedulerEvent::SubmissionFailed {
                        partition: submitter.partition,
                        tx_hash: tx.hash,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }
    }
}

/// Move operations from the source stream into the bounded input channel.
async fn forward(
    mut operations: BoxStream<'static, Operation>,
    input: mpsc::Sender<Operation>,
    shutdown: CancellationToken,
) {
    let mut forwarded = 0u64;
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = operations.next() => next,
        };
        let Some(operation) = next else {
            debug!(forwarded, "Operation stream exhausted");
            return;
        };
        // The emitter drops its receiver once it stops taking input.
        if input.send(operation).await.is_err() {
            return;
        }
        forwarded += 1;
    }
}
