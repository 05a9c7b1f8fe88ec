//! End-to-end scheduling against the simulated ledger.

use futures::stream::{self, StreamExt};
use shardrun_emitter::{Emitter, EmitterConfig, RunReport, SchedulerError};
use shardrun_migration::MigrationConfig;
use shardrun_simulation::{Faults, Residency, SimulatedLedger, SimulationConfig};
use shardrun_test_helpers::ops;
use shardrun_types::{Method, ObjectKey, Operation, PartitionId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RUN_LIMIT: Duration = Duration::from_secs(20);

struct Cluster {
    ledger: Arc<SimulatedLedger>,
    producers: CancellationToken,
}

impl Cluster {
    fn new(config: SimulationConfig) -> Self {
        let ledger = Arc::new(SimulatedLedger::new(
            config.with_block_interval(Duration::from_millis(5)),
        ));
        let producers = CancellationToken::new();
        ledger.spawn_producers(producers.clone());
        Self { ledger, producers }
    }

    fn emitter(&self, config: EmitterConfig) -> Emitter {
        let migration = MigrationConfig::default().with_header_timeout(Duration::from_secs(2));
        Emitter::new(config, self.ledger.clone())
            .unwrap()
            .with_migration_config(migration)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.producers.cancel();
    }
}

async fn run(emitter: &Emitter, operations: Vec<Operation>) -> Result<RunReport, SchedulerError> {
    tokio::time::timeout(
        RUN_LIMIT,
        emitter.run(stream::iter(operations), CancellationToken::new()),
    )
    .await
    .expect("run did not finish")
}

#[tokio::test]
async fn test_single_partition_workload_completes() {
    let cluster = Cluster::new(SimulationConfig::new(1));
    let emitter = cluster.emitter(EmitterConfig::new(1));
    let operations = (1..=50).map(|i| ops::transfer(i, i % 10)).collect();

    let report = run(&emitter, operations).await.unwrap();

    assert_eq!(report.stats.sent, 50);
    assert_eq!(report.stats.total_executed(), 50);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.samples(), 50);
    assert_eq!(cluster.ledger.executed(), 50);
}

#[tokio::test]
async fn test_cross_shard_operation_moves_object() {
    let cluster = Cluster::new(SimulationConfig::new(2));
    let emitter = cluster.emitter(EmitterConfig::new(2));
    // Key 1 starts on partition 2, key 2 on partition 1.
    let operations = vec![ops::breed(1, 1, 2), ops::transfer(2, 1)];

    let report = run(&emitter, operations).await.unwrap();

    assert_eq!(report.stats.moved, 1);
    assert_eq!(report.stats.migrations_started, 1);
    assert_eq!(report.stats.failed, 0);
    // MoveTo, Move2, breed, transfer.
    assert_eq!(report.stats.total_executed(), 4);
    assert_eq!(
        emitter.partitioning().current_partition(&ops::key(1)),
        Some(PartitionId(1))
    );
    assert_eq!(
        cluster.ledger.residency(&ops::key(1)),
        Residency::Resident(PartitionId(1))
    );
}

#[tokio::test]
async fn test_created_object_migrates_under_ledger_key() {
    let cluster = Cluster::new(SimulationConfig::new(2));
    let emitter = cluster.emitter(EmitterConfig::new(2));
    let operations = vec![
        ops::birth(1, 1, 2, 100),
        ops::transfer(2, 100),
        // Key 3 lives alone on partition 2, which is then the lighter side.
        ops::breed(3, 100, 3),
    ];

    let report = run(&emitter, operations).await.unwrap();

    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.stats.moved, 2);
    assert_eq!(
        emitter.partitioning().current_partition(&ops::key(100)),
        Some(PartitionId(2))
    );
    let ledger_key = ObjectKey::Id(SimulationConfig::default().first_created_id);
    assert_eq!(
        cluster.ledger.residency(&ledger_key),
        Residency::Resident(PartitionId(2))
    );
}

#[tokio::test]
async fn test_failed_accept_retries_with_fresh_proof() {
    let faults = Faults::default().failing(Method::Move2, 1);
    let cluster = Cluster::new(SimulationConfig::new(2).with_faults(faults));
    let emitter = cluster.emitter(EmitterConfig::new(2));

    let report = run(&emitter, vec![ops::breed(1, 1, 2)]).await.unwrap();

    assert_eq!(report.stats.move2_retries, 1);
    assert_eq!(report.stats.moved, 1);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.abandoned, 0);
    assert_eq!(
        cluster.ledger.residency(&ops::key(1)),
        Residency::Resident(PartitionId(1))
    );
}

#[tokio::test]
async fn test_transient_faults_are_retried() {
    let faults = Faults::default()
        .with_proof_failures(2)
        .with_submit_failures(2);
    let cluster = Cluster::new(SimulationConfig::new(2).with_faults(faults));
    let config = EmitterConfig::new(2).with_submit_retries(5, Duration::from_millis(5));
    let emitter = cluster.emitter(config);

    let report = run(&emitter, vec![ops::breed(1, 1, 2)]).await.unwrap();

    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.stats.moved, 1);
    assert_eq!(report.stats.total_executed(), 3);
}

#[tokio::test]
async fn test_execution_failure_ends_run_by_default() {
    let faults = Faults::default().failing(Method::Transfer, 1);
    let cluster = Cluster::new(SimulationConfig::new(1).with_faults(faults));
    let emitter = cluster.emitter(EmitterConfig::new(1));

    let err = run(&emitter, vec![ops::transfer(1, 7)]).await.unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::TransactionFailed {
            method: Method::Transfer,
            ..
        }
    ));
}

#[tokio::test]
async fn test_execution_failure_tolerated_when_configured() {
    let faults = Faults::default().failing(Method::Transfer, 1);
    let cluster = Cluster::new(SimulationConfig::new(1).with_faults(faults));
    let emitter = cluster.emitter(EmitterConfig::new(1).with_fail_on_exception(false));

    let operations = vec![ops::transfer(1, 7), ops::transfer(2, 7)];
    let report = run(&emitter, operations).await.unwrap();

    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.total_executed(), 2);
}

#[tokio::test]
async fn test_missing_headers_abandon_migration() {
    let faults = Faults::default().without_headers();
    let cluster = Cluster::new(SimulationConfig::new(2).with_faults(faults));
    let migration = MigrationConfig::default()
        .with_header_timeout(Duration::from_millis(50))
        .with_max_header_waits(2);
    let emitter = Emitter::new(EmitterConfig::new(2), cluster.ledger.clone())
        .unwrap()
        .with_migration_config(migration);
    let operations = vec![
        ops::breed(1, 1, 2),
        ops::transfer(2, 1),
        // Key 4 lives on partition 1 and is unaffected.
        ops::transfer(3, 4),
    ];

    let report = run(&emitter, operations).await.unwrap();

    assert_eq!(report.stats.abandoned, 2);
    assert_eq!(report.stats.moved, 0);
    // MoveTo and the unrelated transfer.
    assert_eq!(report.stats.total_executed(), 2);
    assert!(matches!(
        cluster.ledger.residency(&ops::key(1)),
        Residency::InTransit { .. }
    ));
}

#[tokio::test]
async fn test_stop_drains_sent_operations() {
    let cluster = Cluster::new(SimulationConfig::new(2));
    let emitter = cluster.emitter(EmitterConfig::new(2));
    let operations = stream::iter((1..=30).map(|i| ops::transfer(i, i % 6)))
        .chain(stream::pending());

    let stop = CancellationToken::new();
    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
    });

    let report = tokio::time::timeout(RUN_LIMIT, emitter.run(operations, stop))
        .await
        .expect("run did not drain")
        .unwrap();

    assert!(report.stats.sent > 0);
    assert!(report.stats.sent <= 30);
    assert_eq!(report.stats.total_executed(), report.stats.sent);
}

#[tokio::test]
async fn test_mixed_workload_keeps_single_ownership() {
    let cluster = Cluster::new(SimulationConfig::new(3));
    let emitter = cluster.emitter(EmitterConfig::new(3));
    let operations = (1..=200u64)
        .map(|i| {
            let a = i % 40 + 1;
            let b = (i * 7) % 40 + 1;
            if a == b {
                ops::transfer(i, a)
            } else {
                ops::breed(i, a, b)
            }
        })
        .collect();

    let report = run(&emitter, operations).await.unwrap();

    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.stats.abandoned, 0);
    assert!(report.stats.moved > 0);
    for id in 1..=40 {
        let key = ops::key(id);
        let Some(partition) = emitter.partitioning().current_partition(&key) else {
            continue;
        };
        assert_eq!(cluster.ledger.residency(&key), Residency::Resident(partition));
    }
    let loads: u64 = emitter.partitioning().loads().iter().sum();
    assert_eq!(loads as usize, emitter.partitioning().assigned_count());
}
