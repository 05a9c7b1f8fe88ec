//! Async finality driver: proof fetch, header wait, report.
//!
//! One driver task runs per migration attempt once the release step is
//! confirmed. It never touches scheduler state directly; everything it learns
//! goes back to the emitter as a [`SchedulerEvent`].

use crate::{HeaderRegistry, MigrationConfig, MigrationError};
use shardrun_core::{Ledger, SchedulerEvent};
use shardrun_types::{ObjectKey, PartitionId, Proof, SignedHeader};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Spawns and runs finality drivers for migrations.
#[derive(Clone)]
pub struct FinalityDriver {
    ledger: Arc<dyn Ledger>,
    registry: Arc<HeaderRegistry>,
    config: MigrationConfig,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    shutdown: CancellationToken,
}

impl FinalityDriver {
    /// Create a driver reporting to `events`. Tasks stop without reporting
    /// once `shutdown` is cancelled.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<HeaderRegistry>,
        config: MigrationConfig,
        events: mpsc::UnboundedSender<SchedulerEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            registry,
            config,
            events,
            shutdown,
        }
    }

    /// Spawn the driver for one attempt of one migration.
    ///
    /// `key` is the logical key the emitter tracks; `ledger_key` is what the
    /// ledger knows the object as. Reports `FinalityPending` once the proof is
    /// in hand, then exactly one of `Move2Ready` or `MigrationAbandoned`.
    pub fn spawn(
        &self,
        key: ObjectKey,
        ledger_key: ObjectKey,
        source: PartitionId,
        attempt: u32,
    ) -> JoinHandle<()> {
        let driver = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = driver.shutdown.cancelled() => return,
                outcome = driver.drive(key, ledger_key, source, attempt) => outcome,
            };

            let event = match outcome {
                Ok((proof, header)) => SchedulerEvent::Move2Ready {
                    key,
                    attempt,
                    proof,
                    header,
                },
                Err(e) => {
                    error!(%key, attempt, error = %e, "Migration finality failed");
                    SchedulerEvent::MigrationAbandoned {
                        key,
                        attempt,
                        reason: e.to_string(),
                    }
                }
            };
            // The emitter may already be gone during shutdown.
            let _ = driver.events.send(event);
        })
    }

    /// Fetch a proof from `source` and wait for the matching signed header.
    pub async fn drive(
        &self,
        key: ObjectKey,
        ledger_key: ObjectKey,
        source: PartitionId,
        attempt: u32,
    ) -> Result<(Proof, SignedHeader), MigrationError> {
        let proof = self.fetch_proof(key, ledger_key, source).await?;
        let height = proof.height;
        debug!(%key, attempt, height = height.0, "Proof fetched, awaiting signed header");
        let _ = self.events.send(SchedulerEvent::FinalityPending {
            key,
            attempt,
            height,
        });

        for wait in 1..=self.config.max_header_waits {
            let rx = self.registry.register(source, height);
            match tokio::time::timeout(self.config.header_timeout, rx).await {
                Ok(Ok(header)) => return Ok((proof, header)),
                Ok(Err(_)) => return Err(MigrationError::RegistryClosed { key }),
                Err(_) => {
                    warn!(
                        %key,
                        height = height.0,
                        wait,
                        timeout = ?self.config.header_timeout,
                        "Timed out waiting for signed header"
                    );
                }
            }
        }

        Err(MigrationError::HeaderTimeout {
            key,
            height,
            waits: self.config.max_header_waits,
        })
    }

    async fn fetch_proof(
        &self,
        key: ObjectKey,
        ledger_key: ObjectKey,
        source: PartitionId,
    ) -> Result<Proof, MigrationError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.ledger.fetch_proof(source, ledger_key).await {
                Ok(proof) => return Ok(proof),
                Err(e) if e.is_transient() && attempts < self.config.proof_retries => {
                    let delay = self.config.proof_backoff_for(attempts);
                    warn!(%key, attempts, error = %e, ?delay, "Proof fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(MigrationError::ProofUnavailable {
                        key,
                        attempts,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

impl std::fmt::Debug for FinalityDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalityDriver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardrun_test_helpers::StubLedger;
    use shardrun_types::BlockHeight;
    use std::time::Duration;
    use tokio::time::Instant;

    const KEY: ObjectKey = ObjectKey::Id(42);
    const SOURCE: PartitionId = PartitionId(2);

    struct Harness {
        ledger: Arc<StubLedger>,
        registry: Arc<HeaderRegistry>,
        driver: FinalityDriver,
        events: mpsc::UnboundedReceiver<SchedulerEvent>,
        shutdown: CancellationToken,
    }

    fn harness(ledger: StubLedger, config: MigrationConfig) -> Harness {
        let ledger = Arc::new(ledger);
        let registry = Arc::new(HeaderRegistry::new(config.header_cache));
        let (tx, events) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let driver = FinalityDriver::new(
            ledger.clone(),
            registry.clone(),
            config,
            tx,
            shutdown.clone(),
        );
        Harness {
            ledger,
            registry,
            driver,
            events,
            shutdown,
        }
    }

    fn header(height: u64) -> SignedHeader {
        SignedHeader {
            partition: SOURCE,
            height: BlockHeight(height),
            blob: b"sig".to_vec(),
        }
    }

    fn fast_config() -> MigrationConfig {
        MigrationConfig::default()
            .with_header_timeout(Duration::from_secs(1))
            .with_max_header_waits(3)
            .with_proof_retries(3, Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_move2_ready_with_proof_and_header() {
        let mut h = harness(StubLedger::new().with_proof_height(7), fast_config());
        h.registry.fulfill(header(7));

        h.driver.spawn(KEY, KEY, SOURCE, 1).await.unwrap();

        match h.events.recv().await.unwrap() {
            SchedulerEvent::FinalityPending {
                key,
                attempt,
                height,
            } => {
                assert_eq!((key, attempt, height), (KEY, 1, BlockHeight(7)));
            }
            other => panic!("unexpected event {}", other.type_name()),
        }
        match h.events.recv().await.unwrap() {
            SchedulerEvent::Move2Ready {
                attempt,
                proof,
                header,
                ..
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(proof.height, BlockHeight(7));
                assert_eq!(header.height, BlockHeight(7));
            }
            other => panic!("unexpected event {}", other.type_name()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_proof_failures_are_retried() {
        let mut h = harness(
            StubLedger::new().with_proof_height(3).with_proof_failures(2),
            fast_config(),
        );
        h.registry.fulfill(header(3));

        h.driver.spawn(KEY, KEY, SOURCE, 1).await.unwrap();

        assert_eq!(h.ledger.proof_calls(), 3);
        let _pending = h.events.recv().await.unwrap();
        assert!(matches!(
            h.events.recv().await.unwrap(),
            SchedulerEvent::Move2Ready { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_proof_budget_exhausted_abandons() {
        let mut h = harness(StubLedger::new().with_proof_failures(10), fast_config());

        h.driver.spawn(KEY, KEY, SOURCE, 1).await.unwrap();

        assert_eq!(h.ledger.proof_calls(), 3);
        match h.events.recv().await.unwrap() {
            SchedulerEvent::MigrationAbandoned { key, attempt, .. } => {
                assert_eq!((key, attempt), (KEY, 1));
            }
            other => panic!("unexpected event {}", other.type_name()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_proof_error_not_retried() {
        let mut h = harness(StubLedger::new().rejecting_proofs(), fast_config());

        h.driver.spawn(KEY, KEY, SOURCE, 1).await.unwrap();

        assert_eq!(h.ledger.proof_calls(), 1);
        assert!(matches!(
            h.events.recv().await.unwrap(),
            SchedulerEvent::MigrationAbandoned { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_header_timeout_rewaits_and_sends_once() {
        let mut h = harness(StubLedger::new().with_proof_height(5), fast_config());
        let registry = h.registry.clone();

        let task = h.driver.spawn(KEY, KEY, SOURCE, 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        registry.fulfill(header(5));
        task.await.unwrap();

        assert!(logs_contain("Timed out waiting for signed header"));

        let mut ready = 0;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, SchedulerEvent::Move2Ready { .. }) {
                ready += 1;
            }
        }
        assert_eq!(ready, 1);
        assert_eq!(h.registry.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_never_arrives() {
        let mut h = harness(StubLedger::new().with_proof_height(5), fast_config());
        let started = Instant::now();

        h.driver.spawn(KEY, KEY, SOURCE, 2).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        let _pending = h.events.recv().await.unwrap();
        match h.events.recv().await.unwrap() {
            SchedulerEvent::MigrationAbandoned {
                attempt, reason, ..
            } => {
                assert_eq!(attempt, 2);
                assert!(reason.contains("after 3 waits"));
            }
            other => panic!("unexpected event {}", other.type_name()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_without_report() {
        let mut h = harness(StubLedger::new().with_proof_height(5), fast_config());

        let task = h.driver.spawn(KEY, KEY, SOURCE, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.shutdown.cancel();
        task.await.unwrap();

        let _pending = h.events.recv().await.unwrap();
        assert!(h.events.try_recv().is_err());
    }
}
