//! Synchronous scheduling core.
//!
//! Owns the dependency graph, the migration records and the per-partition
//! lanes. The async run loop feeds it one [`SchedulerEvent`] at a time; it
//! never awaits, and the only side effects are signing, pushing signed
//! transactions to the submitter channels and spawning finality drivers.

use crate::lane::{InFlight, Lane, Priority};
use crate::{AdmissionWindow, EmitterConfig, RunReport, SchedulerError, SchedulerStats};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use shardrun_core::{Ledger, SchedulerEvent};
use shardrun_dependencies::DependencyGraph;
use shardrun_migration::{FinalityDriver, MigrationError, Migrations, Move2Outcome, MoveToOutcome};
use shardrun_partitioning::Partitioning;
use shardrun_types::{
    BlockHeight, BlockResult, Method, ObjectKey, Operation, OperationId, PartitionId, Proof,
    SignedHeader, SignedTx, TxExecution, TxHash, TxRequest,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

/// An operation holding its keys while objects migrate to `destination`.
#[derive(Debug)]
struct Parked {
    operation: Operation,
    destination: PartitionId,
    waiting: HashSet<ObjectKey>,
    failed: bool,
}

pub(crate) struct Scheduler {
    config: EmitterConfig,
    ledger: Arc<dyn Ledger>,
    graph: DependencyGraph,
    partitioning: Arc<Partitioning>,
    migrations: Migrations,
    driver: FinalityDriver,
    lanes: Vec<Lane>,
    submitters: Vec<mpsc::UnboundedSender<SignedTx>>,
    input: Option<mpsc::Receiver<Operation>>,
    /// Logical key -> ledger key, for objects we created.
    resolution: HashMap<ObjectKey, ObjectKey>,
    parked: HashMap<OperationId, Parked>,
    parked_by_key: HashMap<ObjectKey, OperationId>,
    abandoned: HashSet<ObjectKey>,
    /// Operations heading all their keys, not yet routed.
    ready: VecDeque<(Operation, Priority)>,
    stats: Arc<Mutex<SchedulerStats>>,
    latency: Histogram<u64>,
}

impl Scheduler {
    pub fn new(
        config: EmitterConfig,
        ledger: Arc<dyn Ledger>,
        partitioning: Arc<Partitioning>,
        driver: FinalityDriver,
        migrations: Migrations,
        stats: Arc<Mutex<SchedulerStats>>,
        submitters: Vec<mpsc::UnboundedSender<SignedTx>>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        if submitters.len() as u64 != config.num_partitions {
            return Err(SchedulerError::Config(format!(
                "{} submitters for {} partitions",
                submitters.len(),
                config.num_partitions
            )));
        }
        let lanes = PartitionId::all(config.num_partitions)
            .map(|partition| {
                let window = AdmissionWindow::new(
                    config.window,
                    config.min_window,
                    config.max_window,
                    config.window_step,
                );
                Lane::new(partition, window)
            })
            .collect();
        let latency = Histogram::new(3)
            .map_err(|e| SchedulerError::Config(format!("latency histogram: {e}")))?;

        Ok(Self {
            config,
            ledger,
            graph: DependencyGraph::new(),
            partitioning,
            migrations,
            driver,
            lanes,
            submitters,
            input: None,
            resolution: HashMap::new(),
            parked: HashMap::new(),
            parked_by_key: HashMap::new(),
            abandoned: HashSet::new(),
            ready: VecDeque::new(),
            stats,
            latency,
        })
    }

    /// Attach the operation source.
    pub fn with_input(mut self, input: mpsc::Receiver<Operation>) -> Self {
        self.input = Some(input);
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event handling
    // ═══════════════════════════════════════════════════════════════════════

    pub fn handle(&mut self, event: SchedulerEvent) -> Result<(), SchedulerError> {
        match event {
            SchedulerEvent::BlockCommitted(result) => self.on_block(result)?,
            SchedulerEvent::ListenerClosed { partition } => self.on_listener_closed(partition)?,
            SchedulerEvent::FinalityPending {
                key,
                attempt,
                height,
            } => self.on_finality_pending(key, attempt, height)?,
            SchedulerEvent::Move2Ready {
                key,
                attempt,
                proof,
                header,
            } => self.on_move2_ready(key, attempt, proof, header)?,
            SchedulerEvent::MigrationAbandoned {
                key,
                attempt,
                reason,
            } => self.on_migration_abandoned(key, attempt, &reason)?,
            SchedulerEvent::SubmissionFailed {
                partition,
                tx_hash,
                reason,
            } => self.on_submission_failed(partition, tx_hash, &reason)?,
        }
        self.drain_ready()?;
        self.pump_all(false)
    }

    fn on_block(&mut self, result: BlockResult) -> Result<(), SchedulerError> {
        let partition = result.partition;
        let index = self.lane_index(partition)?;
        let outstanding_before = self.lanes[index].outstanding();

        let mut executed = 0;
        for execution in result.executions {
            let Some(sent) = self.lanes[index].complete(&execution.tx_hash) else {
                continue;
            };
            executed += 1;
            let micros = u64::try_from(sent.sent_at.elapsed().as_micros()).unwrap_or(u64::MAX);
            self.latency.saturating_record(micros);
            if let Some(count) = self.stats.lock().executed.get_mut(index) {
                *count += 1;
            }
            self.on_execution(partition, execution, sent.what)?;
        }

        self.drain_ready()?;
        self.lanes[index].window.observe(executed, outstanding_before);
        self.pump(index, true)?;

        let lane = &self.lanes[index];
        let (freed, migrated, fresh) = lane.depths();
        debug!(
            partition = partition.0,
            height = result.height.0,
            executed,
            window = lane.window.current(),
            outstanding = lane.outstanding(),
            freed,
            migrated,
            fresh,
            live = self.graph.live(),
            migrating = self.migrations.len(),
            "Block observed"
        );
        Ok(())
    }

    fn on_execution(
        &mut self,
        partition: PartitionId,
        execution: TxExecution,
        what: InFlight,
    ) -> Result<(), SchedulerError> {
        match what {
            InFlight::Operation(operation) => {
                if !execution.success {
                    self.execution_failed(partition, &execution, operation.method)?;
                    warn!(
                        id = %operation.id,
                        method = %operation.method,
                        partition = partition.0,
                        reason = execution.exception.as_deref().unwrap_or(""),
                        "Operation failed, releasing its objects"
                    );
                    if let Some(created) = operation.creates {
                        self.abandoned.insert(created);
                    }
                    return self.release(&operation.keys);
                }

                if let Some(logical) = operation.creates {
                    let ledger_key = self
                        .ledger
                        .resolve_new_object_id(&execution.events)
                        .ok_or_else(|| {
                            SchedulerError::Invariant(format!(
                                "{} by {} executed without reporting the created object",
                                operation.method, operation.id
                            ))
                        })?;
                    if ledger_key != logical {
                        self.resolution.insert(logical, ledger_key);
                    }
                    self.partitioning.move_object(logical, partition)?;
                    debug!(%logical, %ledger_key, partition = partition.0, "Object created");
                }
                self.release(&operation.keys)
            }

            InFlight::MoveTo(key) => {
                if !execution.success {
                    self.execution_failed(partition, &execution, Method::MoveTo)?;
                }
                match self.migrations.move_to_executed(key, execution.success)? {
                    MoveToOutcome::Confirmed { source, attempt } => {
                        debug!(%key, source = source.0, attempt, "Release confirmed");
                        self.driver.spawn(key, self.resolve(key), source, attempt);
                        Ok(())
                    }
                    MoveToOutcome::Abandoned { source } => {
                        error!(
                            %key,
                            source = source.0,
                            reason = execution.exception.as_deref().unwrap_or(""),
                            "Release failed, abandoning migration"
                        );
                        self.settle_migration(key, false)
                    }
                }
            }

            InFlight::Move2(key) => match self.migrations.move2_executed(key, execution.success)? {
                Move2Outcome::Committed {
                    source,
                    destination,
                } => {
                    let placed = self.partitioning.current_partition(&key);
                    if placed != Some(source) {
                        return Err(SchedulerError::Invariant(format!(
                            "accept of {key} from partition {} committed while placement says {placed:?}",
                            source.0
                        )));
                    }
                    self.partitioning.move_object(key, destination)?;
                    self.stats.lock().moved += 1;
                    debug!(%key, from = source.0, to = destination.0, "Object moved");
                    self.settle_migration(key, true)
                }
                Move2Outcome::Retry { source, attempt } => {
                    {
                        let mut stats = self.stats.lock();
                        stats.failed += 1;
                        stats.move2_retries += 1;
                    }
                    warn!(
                        %key,
                        attempt,
                        reason = execution.exception.as_deref().unwrap_or(""),
                        "Accept failed, refetching proof"
                    );
                    self.driver.spawn(key, self.resolve(key), source, attempt);
                    Ok(())
                }
                Move2Outcome::Abandoned { attempts } => {
                    self.stats.lock().failed += 1;
                    error!(%key, attempts, "Accept failed on every attempt, abandoning migration");
                    self.settle_migration(key, false)
                }
            },
        }
    }

    /// Count a ledger-reported failure, ending the run when failures are fatal.
    fn execution_failed(
        &mut self,
        partition: PartitionId,
        execution: &TxExecution,
        method: Method,
    ) -> Result<(), SchedulerError> {
        self.stats.lock().failed += 1;
        if self.config.fail_on_exception {
            return Err(SchedulerError::TransactionFailed {
                partition,
                tx_hash: execution.tx_hash,
                method,
                reason: execution.exception.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn on_listener_closed(&mut self, partition: PartitionId) -> Result<(), SchedulerError> {
        if self.is_finished() {
            return Ok(());
        }
        Err(SchedulerError::ListenerClosed { partition })
    }

    fn on_finality_pending(
        &mut self,
        key: ObjectKey,
        attempt: u32,
        height: BlockHeight,
    ) -> Result<(), SchedulerError> {
        match self.migrations.finality_pending(key, attempt, height) {
            Ok(_) => Ok(()),
            Err(MigrationError::Unknown { .. }) => {
                debug!(%key, attempt, "Finality report for settled migration");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_move2_ready(
        &mut self,
        key: ObjectKey,
        attempt: u32,
        proof: Proof,
        header: SignedHeader,
    ) -> Result<(), SchedulerError> {
        match self.migrations.move2_ready(key, attempt) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(MigrationError::Unknown { .. }) => {
                debug!(%key, attempt, "Accept ready for settled migration");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let (source, destination) = self
            .migrations
            .get(&key)
            .map(|record| (record.source, record.destination))
            .ok_or(MigrationError::Unknown { key })?;
        let request = TxRequest::Move2 {
            key: self.resolve(key),
            source,
            proof,
            header,
        };
        self.send(destination, &request, InFlight::Move2(key))
    }

    fn on_migration_abandoned(
        &mut self,
        key: ObjectKey,
        attempt: u32,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        match self.migrations.abandon(key, attempt) {
            Some(record) => {
                error!(
                    %key,
                    attempt,
                    source = record.source.0,
                    destination = record.destination.0,
                    reason,
                    "Migration abandoned"
                );
                self.settle_migration(key, false)
            }
            None => {
                debug!(%key, attempt, "Ignoring abandonment of stale attempt");
                Ok(())
            }
        }
    }

    fn on_submission_failed(
        &mut self,
        partition: PartitionId,
        tx_hash: TxHash,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        let index = self.lane_index(partition)?;
        let Some(sent) = self.lanes[index].complete(&tx_hash) else {
            debug!(%tx_hash, "Submission failure for transaction no longer outstanding");
            return Ok(());
        };
        self.stats.lock().failed += 1;

        match sent.what {
            InFlight::Operation(operation) => {
                error!(
                    id = %operation.id,
                    method = %operation.method,
                    partition = partition.0,
                    reason,
                    "Broadcast failed, abandoning objects"
                );
                self.abandoned.extend(operation.keys.iter().copied());
                self.release(&operation.keys)
            }
            InFlight::MoveTo(key) => {
                error!(%key, reason, "Release broadcast failed, abandoning migration");
                self.migrations.move_to_executed(key, false)?;
                self.settle_migration(key, false)
            }
            InFlight::Move2(key) => {
                error!(%key, reason, "Accept broadcast failed, abandoning migration");
                let attempt = self
                    .migrations
                    .get(&key)
                    .map(|record| record.attempt)
                    .ok_or(MigrationError::Unknown { key })?;
                self.migrations.abandon(key, attempt);
                self.settle_migration(key, false)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Admission and routing
    // ═══════════════════════════════════════════════════════════════════════

    /// Admit a fresh operation into the dependency graph.
    pub fn ingest(&mut self, operation: Operation) -> Result<(), SchedulerError> {
        if !self.graph.admit(operation.clone())? {
            self.ready.push_back((operation, Priority::Fresh));
        }
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Result<(), SchedulerError> {
        while let Some((operation, priority)) = self.ready.pop_front() {
            self.dispatch(operation, priority)?;
        }
        Ok(())
    }

    /// Route an operation that heads all of its keys.
    fn dispatch(&mut self, operation: Operation, priority: Priority) -> Result<(), SchedulerError> {
        if operation.keys.iter().any(|key| self.abandoned.contains(key)) {
            return self.drop_operation(operation);
        }

        let existing: Vec<ObjectKey> = operation.existing_keys().copied().collect();
        for key in &existing {
            if self.partitioning.current_partition(key).is_none() {
                self.partitioning.assign(*key)?;
            }
        }

        let partition = match existing.first() {
            None => match operation.creates {
                Some(created) => self.partitioning.home_partition(&created),
                None => {
                    return Err(SchedulerError::Invariant(format!(
                        "operation {} has no keys",
                        operation.id
                    )))
                }
            },
            Some(first) if self.partitioning.same_shard(&existing)? => self
                .partitioning
                .current_partition(first)
                .ok_or(shardrun_partitioning::PartitionError::Unassigned { key: *first })?,
            Some(_) => {
                let destination = self.partitioning.choose_destination(&existing)?;
                return self.begin_migrations(operation, existing, destination);
            }
        };

        let index = self.lane_index(partition)?;
        self.lanes[index].push(priority, operation);
        Ok(())
    }

    /// Park `operation` and release every key not already on `destination`.
    fn begin_migrations(
        &mut self,
        operation: Operation,
        keys: Vec<ObjectKey>,
        destination: PartitionId,
    ) -> Result<(), SchedulerError> {
        let mut waiting = HashSet::new();
        for key in keys {
            let source = self
                .partitioning
                .current_partition(&key)
                .ok_or(shardrun_partitioning::PartitionError::Unassigned { key })?;
            if source == destination || !waiting.insert(key) {
                continue;
            }
            self.migrations.begin(key, source, destination)?;
            self.parked_by_key.insert(key, operation.id);
            self.stats.lock().migrations_started += 1;
            let request = TxRequest::MoveTo {
                key: self.resolve(key),
                destination,
            };
            self.send(source, &request, InFlight::MoveTo(key))?;
        }

        debug!(
            id = %operation.id,
            method = %operation.method,
            destination = destination.0,
            migrating = waiting.len(),
            "Operation parked for migration"
        );
        self.parked.insert(
            operation.id,
            Parked {
                operation,
                destination,
                waiting,
                failed: false,
            },
        );
        Ok(())
    }

    /// A migration of `key` finished, successfully or not.
    fn settle_migration(&mut self, key: ObjectKey, committed: bool) -> Result<(), SchedulerError> {
        let id = self.parked_by_key.remove(&key).ok_or_else(|| {
            SchedulerError::Invariant(format!("migration of {key} has no parked operation"))
        })?;
        let parked = self.parked.get_mut(&id).ok_or_else(|| {
            SchedulerError::Invariant(format!("parked operation {id} missing for {key}"))
        })?;
        parked.waiting.remove(&key);
        if !committed {
            parked.failed = true;
            self.abandoned.insert(key);
        }
        if !parked.waiting.is_empty() {
            return Ok(());
        }

        let Some(parked) = self.parked.remove(&id) else {
            return Ok(());
        };
        if parked.failed {
            return self.drop_operation(parked.operation);
        }
        let index = self.lane_index(parked.destination)?;
        self.lanes[index].push(Priority::Migrated, parked.operation);
        Ok(())
    }

    /// Release an operation without sending it.
    fn drop_operation(&mut self, operation: Operation) -> Result<(), SchedulerError> {
        error!(
            id = %operation.id,
            method = %operation.method,
            "Dropping operation on abandoned object"
        );
        self.stats.lock().abandoned += 1;
        if let Some(created) = operation.creates {
            self.abandoned.insert(created);
        }
        self.release(&operation.keys)
    }

    fn release(&mut self, keys: &[ObjectKey]) -> Result<(), SchedulerError> {
        let freed = self.graph.release(keys)?;
        self.ready
            .extend(freed.into_iter().map(|operation| (operation, Priority::Freed)));
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Send queued work on lane `index` up to its budget, then, when
    /// `allow_pull` is set, pull fresh operations against the budget the lane
    /// had on entry.
    pub fn pump(&mut self, index: usize, allow_pull: bool) -> Result<(), SchedulerError> {
        let mut credit = if allow_pull {
            self.lanes[index].budget()
        } else {
            0
        };
        loop {
            while self.lanes[index].budget() > 0 {
                let Some(operation) = self.lanes[index].pop_next() else {
                    break;
                };
                let partition = self.lanes[index].partition;
                self.send_operation(partition, operation)?;
            }
            if credit == 0 || self.lanes[index].budget() == 0 {
                return Ok(());
            }
            let Some(operation) = self.pull() else {
                return Ok(());
            };
            credit -= 1;
            self.ingest(operation)?;
        }
    }

    /// Flush every lane's queues up to its budget.
    pub fn pump_all(&mut self, allow_pull: bool) -> Result<(), SchedulerError> {
        for index in 0..self.lanes.len() {
            self.pump(index, allow_pull)?;
        }
        Ok(())
    }

    fn send_operation(
        &mut self,
        partition: PartitionId,
        operation: Operation,
    ) -> Result<(), SchedulerError> {
        let resolved_keys = operation.keys.iter().map(|key| self.resolve(*key)).collect();
        let request = TxRequest::Operation {
            operation: operation.clone(),
            resolved_keys,
        };
        self.send(partition, &request, InFlight::Operation(operation))
    }

    fn send(
        &mut self,
        partition: PartitionId,
        request: &TxRequest,
        what: InFlight,
    ) -> Result<(), SchedulerError> {
        let index = self.lane_index(partition)?;
        let tx = self.ledger.sign(partition, request)?;
        let hash = tx.hash;
        self.submitters[index].send(tx).map_err(|_| {
            SchedulerError::Invariant(format!("submitter for {partition} stopped"))
        })?;
        self.lanes[index].track(hash, what);
        self.stats.lock().sent += 1;
        Ok(())
    }

    fn resolve(&self, key: ObjectKey) -> ObjectKey {
        self.resolution.get(&key).copied().unwrap_or(key)
    }

    fn lane_index(&self, partition: PartitionId) -> Result<usize, SchedulerError> {
        if partition.0 == 0 || partition.index() >= self.lanes.len() {
            return Err(SchedulerError::Invariant(format!(
                "{partition} outside 1..={}",
                self.lanes.len()
            )));
        }
        Ok(partition.index())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Input
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether more operations may be admitted now.
    ///
    /// Admitted-but-unfinished operations are capped at the sum of the
    /// current windows, so a hot key cannot pull the whole stream into the
    /// graph.
    pub fn admission_open(&self) -> bool {
        let limit: usize = self.lanes.iter().map(|lane| lane.window.current()).sum();
        self.input.is_some() && self.graph.live() < limit
    }

    fn pull(&mut self) -> Option<Operation> {
        if !self.admission_open() {
            return None;
        }
        let input = self.input.as_mut()?;
        match input.try_recv() {
            Ok(operation) => Some(operation),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.close_input();
                None
            }
        }
    }

    /// Wait for the next operation from the source.
    ///
    /// Pending forever once the input is closed.
    pub async fn next_input(&mut self) -> Option<Operation> {
        match self.input.as_mut() {
            Some(input) => input.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Stop taking operations; everything admitted still drains.
    pub fn close_input(&mut self) {
        if self.input.take().is_some() {
            info!(live = self.graph.live(), "Operation input closed, draining");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Completion
    // ═══════════════════════════════════════════════════════════════════════

    /// Input closed and every admitted operation and migration settled.
    pub fn is_finished(&self) -> bool {
        self.input.is_none()
            && self.ready.is_empty()
            && self.graph.is_empty()
            && self.migrations.is_empty()
            && self.lanes.iter().all(Lane::is_idle)
    }

    pub fn finish(self, elapsed: Duration) -> RunReport {
        let stats = self.stats.lock().clone();
        RunReport::new(stats, elapsed, self.latency)
    }
}
