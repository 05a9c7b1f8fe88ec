//! Per-object migration records and their state transitions.
//!
//! A record exists from the moment the release step (`MoveTo`) is sent until
//! the accept step (`Move2`) is observed committed. The object's partition
//! assignment is not touched here; callers update placement only on
//! [`Move2Outcome::Committed`].

use shardrun_types::{BlockHeight, ObjectKey, PartitionId};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by migration bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    /// A transition was requested for an object with no migration.
    #[error("no migration in progress for {key}")]
    Unknown {
        /// The object.
        key: ObjectKey,
    },

    /// A migration was started for an object already migrating.
    #[error("{key} is already migrating")]
    AlreadyMigrating {
        /// The object.
        key: ObjectKey,
    },

    /// A transition did not match the record's state.
    #[error("{key}: expected state {expected}, found {found}")]
    UnexpectedState {
        /// The object.
        key: ObjectKey,
        /// State the transition requires.
        expected: &'static str,
        /// State the record is in.
        found: &'static str,
    },

    /// The proof could not be fetched within the retry budget.
    #[error("proof for {key} unavailable after {attempts} attempts: {reason}")]
    ProofUnavailable {
        /// The object.
        key: ObjectKey,
        /// Fetch attempts made.
        attempts: u32,
        /// Last error.
        reason: String,
    },

    /// No signed header arrived within the wait budget.
    #[error("no signed header for {key} at {height} after {waits} waits")]
    HeaderTimeout {
        /// The object.
        key: ObjectKey,
        /// Height awaited.
        height: BlockHeight,
        /// Waits made.
        waits: u32,
    },

    /// The header registry was dropped while a wait was registered.
    #[error("header registry closed while waiting for {key}")]
    RegistryClosed {
        /// The object.
        key: ObjectKey,
    },
}

/// Progress of one object through the migration protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Release transaction sent on the source partition.
    MoveToSubmitted,

    /// Release confirmed; proof requested for the current attempt.
    ProofFetched,

    /// Proof in hand, waiting for the signed header at `height`.
    AwaitingFinality {
        /// Height whose signed header must accompany the proof.
        height: BlockHeight,
    },

    /// Accept transaction sent on the destination partition.
    Move2Submitted,
}

impl MigrationState {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            MigrationState::MoveToSubmitted => "MoveToSubmitted",
            MigrationState::ProofFetched => "ProofFetched",
            MigrationState::AwaitingFinality { .. } => "AwaitingFinality",
            MigrationState::Move2Submitted => "Move2Submitted",
        }
    }
}

/// One object mid-migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Logical key of the object.
    pub key: ObjectKey,
    /// Partition releasing the object.
    pub source: PartitionId,
    /// Partition accepting the object.
    pub destination: PartitionId,
    /// Current state.
    pub state: MigrationState,
    /// Finality attempt, starting at 1 once the release is confirmed.
    ///
    /// Bumped each time a failed accept sends the migration back to wait
    /// for finality.
    pub attempt: u32,
}

/// Result of observing the release transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveToOutcome {
    /// Release committed; start the finality driver for `attempt`.
    Confirmed {
        /// Partition to fetch the proof from.
        source: PartitionId,
        /// Attempt number for the driver.
        attempt: u32,
    },
    /// Release failed; the record is gone and the object stays at `source`.
    Abandoned {
        /// Partition the object remains on.
        source: PartitionId,
    },
}

/// Result of observing the accept transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move2Outcome {
    /// The object now lives on `destination`.
    Committed {
        /// Previous partition.
        source: PartitionId,
        /// New partition.
        destination: PartitionId,
    },
    /// Accept failed; restart the finality driver for `attempt`.
    Retry {
        /// Partition to re-fetch the proof from.
        source: PartitionId,
        /// New attempt number.
        attempt: u32,
    },
    /// Accept failed and the attempt budget is spent; the record is gone.
    Abandoned {
        /// Attempts made.
        attempts: u32,
    },
}

/// All in-flight migrations, keyed by object.
///
/// Purely synchronous; the emitter owns it and applies transitions in the
/// order it observes ledger results and driver reports.
#[derive(Debug)]
pub struct Migrations {
    records: HashMap<ObjectKey, MigrationRecord>,
    max_move2_attempts: u32,
}

impl Migrations {
    /// Create an empty set with the given accept-step attempt budget.
    pub fn new(max_move2_attempts: u32) -> Self {
        Self {
            records: HashMap::new(),
            max_move2_attempts: max_move2_attempts.max(1),
        }
    }

    /// Start a migration: the release transaction has just been sent.
    pub fn begin(
        &mut self,
        key: ObjectKey,
        source: PartitionId,
        destination: PartitionId,
    ) -> Result<(), MigrationError> {
        if self.records.contains_key(&key) {
            return Err(MigrationError::AlreadyMigrating { key });
        }
        debug!(%key, source = source.0, destination = destination.0, "Migration started");
        self.records.insert(
            key,
            MigrationRecord {
                key,
                source,
                destination,
                state: MigrationState::MoveToSubmitted,
                attempt: 0,
            },
        );
        Ok(())
    }

    /// Apply the observed outcome of the release transaction.
    pub fn move_to_executed(
        &mut self,
        key: ObjectKey,
        success: bool,
    ) -> Result<MoveToOutcome, MigrationError> {
        let record = self.expect_state(key, "MoveToSubmitted", |s| {
            matches!(s, MigrationState::MoveToSubmitted)
        })?;

        if !success {
            let source = record.source;
            self.records.remove(&key);
            return Ok(MoveToOutcome::Abandoned { source });
        }

        record.state = MigrationState::ProofFetched;
        record.attempt = 1;
        Ok(MoveToOutcome::Confirmed {
            source: record.source,
            attempt: record.attempt,
        })
    }

    /// The driver fetched a proof at `height` for `attempt`.
    ///
    /// Returns `false` and leaves the record alone when the report belongs to
    /// an older attempt.
    pub fn finality_pending(
        &mut self,
        key: ObjectKey,
        attempt: u32,
        height: BlockHeight,
    ) -> Result<bool, MigrationError> {
        let record = self.get_mut(key)?;
        if record.attempt != attempt {
            return Ok(false);
        }
        match record.state {
            MigrationState::ProofFetched | MigrationState::AwaitingFinality { .. } => {
                record.state = MigrationState::AwaitingFinality { height };
                Ok(true)
            }
            other => Err(MigrationError::UnexpectedState {
                key,
                expected: "ProofFetched",
                found: other.name(),
            }),
        }
    }

    /// Proof and header are ready for `attempt`.
    ///
    /// Returns `true` exactly once per attempt: the caller must send the
    /// accept transaction. Reports for a stale attempt, or a duplicate for the
    /// current one, return `false`.
    pub fn move2_ready(&mut self, key: ObjectKey, attempt: u32) -> Result<bool, MigrationError> {
        let record = self.get_mut(key)?;
        if record.attempt != attempt {
            warn!(%key, attempt, current = record.attempt, "Dropping stale Move2Ready");
            return Ok(false);
        }
        match record.state {
            MigrationState::ProofFetched | MigrationState::AwaitingFinality { .. } => {
                record.state = MigrationState::Move2Submitted;
                Ok(true)
            }
            MigrationState::Move2Submitted => {
                warn!(%key, attempt, "Accept step already submitted for this attempt");
                Ok(false)
            }
            MigrationState::MoveToSubmitted => Err(MigrationError::UnexpectedState {
                key,
                expected: "AwaitingFinality",
                found: "MoveToSubmitted",
            }),
        }
    }

    /// Apply the observed outcome of the accept transaction.
    pub fn move2_executed(
        &mut self,
        key: ObjectKey,
        success: bool,
    ) -> Result<Move2Outcome, MigrationError> {
        let max_attempts = self.max_move2_attempts;
        let record = self.expect_state(key, "Move2Submitted", |s| {
            matches!(s, MigrationState::Move2Submitted)
        })?;

        if success {
            let outcome = Move2Outcome::Committed {
                source: record.source,
                destination: record.destination,
            };
            self.records.remove(&key);
            return Ok(outcome);
        }

        if record.attempt >= max_attempts {
            let attempts = record.attempt;
            self.records.remove(&key);
            return Ok(Move2Outcome::Abandoned { attempts });
        }

        record.attempt += 1;
        record.state = MigrationState::ProofFetched;
        Ok(Move2Outcome::Retry {
            source: record.source,
            attempt: record.attempt,
        })
    }

    /// Drop a migration after its driver gave up.
    ///
    /// Returns the record when `attempt` is current; stale reports leave the
    /// record in place and return `None`.
    pub fn abandon(&mut self, key: ObjectKey, attempt: u32) -> Option<MigrationRecord> {
        match self.records.get(&key) {
            Some(record) if record.attempt == attempt => self.records.remove(&key),
            _ => None,
        }
    }

    /// Record for `key`, if migrating.
    pub fn get(&self, key: &ObjectKey) -> Option<&MigrationRecord> {
        self.records.get(key)
    }

    /// Whether `key` is migrating.
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.records.contains_key(key)
    }

    /// Number of in-flight migrations.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no migration is in flight.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn get_mut(&mut self, key: ObjectKey) -> Result<&mut MigrationRecord, MigrationError> {
        self.records
            .get_mut(&key)
            .ok_or(MigrationError::Unknown { key })
    }

    fn expect_state(
        &mut self,
        key: ObjectKey,
        expected: &'static str,
        accepts: impl Fn(&MigrationState) -> bool,
    ) -> Result<&mut MigrationRecord, MigrationError> {
        let record = self.get_mut(key)?;
        if !accepts(&record.state) {
            return Err(MigrationError::UnexpectedState {
                key,
                expected,
                found: record.state.name(),
            });
        }
        Ok(record)
    }
}
