//! In-memory ledger with per-partition blocks, ownership and finality.

use crate::{Faults, SimulationConfig};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use shardrun_core::{Ledger, LedgerError};
use shardrun_partitioning::home_partition;
use shardrun_types::{
    BlockHeight, BlockResult, ExecutionEvent, ObjectKey, PartitionId, Proof, SignedHeader,
    SignedTx, TxExecution, TxHash, TxRequest,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Where the ledger believes an object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Owned by a partition.
    Resident(PartitionId),
    /// Released by `from` towards `to` at `height`, not yet accepted.
    InTransit {
        /// Releasing partition.
        from: PartitionId,
        /// Accepting partition.
        to: PartitionId,
        /// Height of the block that executed the release.
        height: BlockHeight,
    },
}

struct PartitionState {
    height: BlockHeight,
    mempool: VecDeque<TxHash>,
    results: broadcast::Sender<BlockResult>,
    headers: broadcast::Sender<SignedHeader>,
}

struct World {
    partitions: Vec<PartitionState>,
    residency: HashMap<ObjectKey, Residency>,
    signed: HashMap<TxHash, TxRequest>,
    next_created_id: u64,
    nonce: u64,
    faults: Faults,
    executed: u64,
}

/// Multi-partition ledger living in process memory.
///
/// Objects never seen before are resident at their hash-home partition.
/// Blocks are produced explicitly with [`SimulatedLedger::produce_block`] or
/// on a timer with [`SimulatedLedger::spawn_producers`]. The signed header
/// for height `H` is published when block `H + 1` is produced.
pub struct SimulatedLedger {
    config: SimulationConfig,
    world: Mutex<World>,
}

impl SimulatedLedger {
    /// Create a ledger at genesis.
    pub fn new(config: SimulationConfig) -> Self {
        let partitions = PartitionId::all(config.num_partitions)
            .map(|_| PartitionState {
                height: BlockHeight::GENESIS,
                mempool: VecDeque::new(),
                results: broadcast::channel(config.stream_capacity).0,
                headers: broadcast::channel(config.stream_capacity).0,
            })
            .collect();
        let world = World {
            partitions,
            residency: HashMap::new(),
            signed: HashMap::new(),
            next_created_id: config.first_created_id,
            nonce: 0,
            faults: config.faults.clone(),
            executed: 0,
        };
        info!(
            num_partitions = config.num_partitions,
            block_capacity = config.block_capacity,
            "Simulated ledger created"
        );
        Self {
            config,
            world: Mutex::new(world),
        }
    }

    /// Number of partitions.
    pub fn num_partitions(&self) -> u64 {
        self.config.num_partitions
    }

    /// Produce the next block on `partition` from its mempool.
    pub fn produce_block(&self, partition: PartitionId) -> Result<BlockResult, LedgerError> {
        let mut world = self.world.lock();
        let capacity = self.config.block_capacity;
        let index = self.index(partition)?;

        let height = world.partitions[index].height.next();
        world.partitions[index].height = height;

        let take = world.partitions[index].mempool.len().min(capacity);
        let batch: Vec<TxHash> = world.partitions[index].mempool.drain(..take).collect();
        let mut executions = Vec::with_capacity(batch.len());
        for hash in batch {
            let execution = world.execute(partition, height, hash);
            executions.push(execution);
        }
        world.executed += executions.len() as u64;

        let result = BlockResult {
            partition,
            height,
            executions,
        };
        trace!(
            partition = partition.0,
            height = height.0,
            txs = result.executions.len(),
            "Produced block"
        );
        // No subscribers is fine.
        let _ = world.partitions[index].results.send(result.clone());

        if !world.faults.suppress_headers {
            if let Some(finalized) = height.prev() {
                let header = SignedHeader {
                    partition,
                    height: finalized,
                    blob: TxHash::from_parts(&[
                        b"header",
                        &partition.0.to_le_bytes(),
                        &finalized.0.to_le_bytes(),
                    ])
                    .as_bytes()
                    .to_vec(),
                };
                let _ = world.partitions[index].headers.send(header);
            }
        }

        Ok(result)
    }

    /// Produce one block on every partition.
    pub fn produce_round(&self) -> Result<Vec<BlockResult>, LedgerError> {
        PartitionId::all(self.config.num_partitions)
            .map(|p| self.produce_block(p))
            .collect()
    }

    /// Spawn one block producer per partition ticking at the configured
    /// interval until `shutdown` is cancelled.
    pub fn spawn_producers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        PartitionId::all(self.config.num_partitions)
            .map(|partition| {
                let ledger = Arc::clone(self);
                let shutdown = shutdown.clone();
                let period = self.config.block_interval;
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticker.tick() => {
                                if let Err(e) = ledger.produce_block(partition) {
                                    warn!(partition = partition.0, error = %e, "Block production failed");
                                    break;
                                }
                            }
                        }
                    }
                    debug!(partition = partition.0, "Block producer stopped");
                })
            })
            .collect()
    }

    /// Where the ledger believes `key` lives.
    pub fn residency(&self, key: &ObjectKey) -> Residency {
        let world = self.world.lock();
        world.residency_of(key, self.config.num_partitions)
    }

    /// Current height of `partition`.
    pub fn height(&self, partition: PartitionId) -> Option<BlockHeight> {
        let world = self.world.lock();
        self.index(partition)
            .ok()
            .map(|i| world.partitions[i].height)
    }

    /// Transactions waiting in `partition`'s mempool.
    pub fn mempool_len(&self, partition: PartitionId) -> usize {
        let world = self.world.lock();
        self.index(partition)
            .map(|i| world.partitions[i].mempool.len())
            .unwrap_or(0)
    }

    /// Total transactions executed across all partitions.
    pub fn executed(&self) -> u64 {
        self.world.lock().executed
    }

    fn index(&self, partition: PartitionId) -> Result<usize, LedgerError> {
        if partition.0 == 0 || partition.0 > self.config.num_partitions {
            return Err(LedgerError::Rejected {
                partition,
                reason: "no such partition".into(),
            });
        }
        Ok(partition.index())
    }
}

impl World {
    fn residency_of(&self, key: &ObjectKey, num_partitions: u64) -> Residency {
        self.residency
            .get(key)
            .copied()
            .unwrap_or_else(|| Residency::Resident(home_partition(key, num_partitions)))
    }

    fn execute(&mut self, partition: PartitionId, height: BlockHeight, hash: TxHash) -> TxExecution {
        let Some(request) = self.signed.remove(&hash) else {
            return TxExecution::failed(hash, "unknown transaction");
        };

        let method = request.method();
        if let Some(remaining) = self.faults.failing_methods.get_mut(&method) {
            if *remaining > 0 {
                *remaining -= 1;
                return TxExecution::failed(hash, format!("injected {} failure", method));
            }
        }

        let num_partitions = self.partitions.len() as u64;
        match request {
            TxRequest::Operation {
                operation,
                resolved_keys,
            } => {
                let existing = operation
                    .keys
                    .iter()
                    .zip(&resolved_keys)
                    .filter(|(logical, _)| Some(**logical) != operation.creates)
                    .map(|(_, ledger_key)| *ledger_key);
                for key in existing {
                    match self.residency_of(&key, num_partitions) {
                        Residency::Resident(p) if p == partition => {}
                        other => {
                            return TxExecution::failed(
                                hash,
                                format!("{} not resident here ({:?})", key, other),
                            );
                        }
                    }
                }

                let mut execution = TxExecution::ok(hash);
                if operation.method.creates_object() {
                    let created = ObjectKey::Id(self.next_created_id);
                    self.next_created_id += 1;
                    self.residency
                        .insert(created, Residency::Resident(partition));
                    execution
                        .events
                        .push(ExecutionEvent::object_created(created));
                }
                execution
            }

            TxRequest::MoveTo { key, destination } => {
                match self.residency_of(&key, num_partitions) {
                    Residency::Resident(p) if p == partition && destination != partition => {
                        self.residency.insert(
                            key,
                            Residency::InTransit {
                                from: partition,
                                to: destination,
                                height,
                            },
                        );
                        TxExecution::ok(hash)
                    }
                    other => TxExecution::failed(hash, format!("cannot release {}: {:?}", key, other)),
                }
            }

            TxRequest::Move2 {
                key,
                source,
                proof,
                header,
            } => match self.residency_of(&key, num_partitions) {
                Residency::InTransit { from, to, .. }
                    if from == source
                        && to == partition
                        && header.partition == source
                        && header.height == proof.height =>
                {
                    self.residency.insert(key, Residency::Resident(partition));
                    TxExecution::ok(hash)
                }
                other => TxExecution::failed(hash, format!("cannot accept {}: {:?}", key, other)),
            },
        }
    }
}

#[async_trait]
impl Ledger for SimulatedLedger {
    fn sign(&self, partition: PartitionId, request: &TxRequest) -> Result<SignedTx, LedgerError> {
        self.index(partition)?;
        let mut world = self.world.lock();
        let nonce = world.nonce;
        world.nonce += 1;
        let hash = TxHash::from_parts(&[
            b"tx",
            &partition.0.to_le_bytes(),
            &nonce.to_le_bytes(),
        ]);
        world.signed.insert(hash, request.clone());
        Ok(SignedTx {
            hash,
            partition,
            payload: format!("{}:{}", request.method(), nonce).into_bytes(),
        })
    }

    async fn submit(&self, tx: SignedTx) -> Result<(), LedgerError> {
        let index = self.index(tx.partition)?;
        let mut world = self.world.lock();
        if world.faults.submit_failures > 0 {
            world.faults.submit_failures -= 1;
            return Err(LedgerError::Unavailable {
                partition: tx.partition,
                reason: "injected submit failure".into(),
            });
        }
        if !world.signed.contains_key(&tx.hash) {
            return Err(LedgerError::Rejected {
                partition: tx.partition,
                reason: format!("unsigned transaction {}", tx.hash),
            });
        }
        world.partitions[index].mempool.push_back(tx.hash);
        Ok(())
    }

    async fn block_results(
        &self,
        partition: PartitionId,
    ) -> Result<BoxStream<'static, BlockResult>, LedgerError> {
        let index = self.index(partition)?;
        let rx = self.world.lock().partitions[index].results.subscribe();
        Ok(subscription(rx, partition))
    }

    async fn signed_headers(
        &self,
        partition: PartitionId,
    ) -> Result<BoxStream<'static, SignedHeader>, LedgerError> {
        let index = self.index(partition)?;
        let rx = self.world.lock().partitions[index].headers.subscribe();
        Ok(subscription(rx, partition))
    }

    async fn fetch_proof(
        &self,
        partition: PartitionId,
        key: ObjectKey,
    ) -> Result<Proof, LedgerError> {
        self.index(partition)?;
        let mut world = self.world.lock();
        if world.faults.proof_failures > 0 {
            world.faults.proof_failures -= 1;
            return Err(LedgerError::Unavailable {
                partition,
                reason: "injected proof failure".into(),
            });
        }
        match world.residency_of(&key, self.config.num_partitions) {
            Residency::InTransit { from, height, .. } if from == partition => Ok(Proof {
                partition,
                key,
                height,
                blob: TxHash::from_parts(&[b"proof", &height.0.to_le_bytes()])
                    .as_bytes()
                    .to_vec(),
            }),
            other => Err(LedgerError::Rejected {
                partition,
                reason: format!("{} has no released state here: {:?}", key, other),
            }),
        }
    }

    fn resolve_new_object_id(&self, events: &[ExecutionEvent]) -> Option<ObjectKey> {
        events.iter().find_map(ExecutionEvent::created_object)
    }
}

/// Adapt a broadcast receiver into an endless stream, skipping over lag.
fn subscription<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
    partition: PartitionId,
) -> BoxStream<'static, T> {
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(partition = partition.0, skipped, "Subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
