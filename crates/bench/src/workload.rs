//! Workloads under test
//!
//! Every workload is a function of an explicit database handle and the
//! [`Fixture`] it runs against. Session and transaction scopes are acquired at
//! the start of the workload and released before it returns, on every path.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};
use txcost_core::{Database, Key, Record, SessionId, StoreError, TransactionOptions};

/// Group key of the invariant check aggregation
const SUM_GROUP: &str = "total";

/// Largest amount moved between the two records in one read-modify-write
pub const MAX_TRANSFER: i64 = 100;

/// Errors a workload execution can fail with
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// The database could not be reached; the rest of the run is pointless
    #[error("connectivity error: {0}")]
    Connectivity(#[source] StoreError),

    /// The transaction was aborted and none of its writes were applied
    #[error("transaction aborted: {0}")]
    TransactionAbort(#[source] StoreError),

    /// A single operation failed
    #[error("operation failed: {0}")]
    Operation(#[source] StoreError),
}

impl WorkloadError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// Classify a failed commit: anything but lost connectivity aborts the transaction
    fn from_commit(err: StoreError) -> Self {
        if err.is_connectivity() {
            Self::Connectivity(err)
        } else {
            Self::TransactionAbort(err)
        }
    }
}

impl From<StoreError> for WorkloadError {
    fn from(err: StoreError) -> Self {
        if err.is_connectivity() {
            Self::Connectivity(err)
        } else if err.is_transaction_abort() {
            Self::TransactionAbort(err)
        } else {
            Self::Operation(err)
        }
    }
}

/// Result of one successful workload execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkloadOutcome {
    /// Ran to completion with the invariant intact
    Completed,

    /// Ran to completion but observed a total that breaks the fixture invariant
    Violation { expected: i64, observed: i64 },
}

/// Two records whose field values always add up to the same total
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fixture {
    pub collection: String,
    pub field: String,
    pub keys: [Key; 2],
    pub initial_value: i64,
}

impl Fixture {
    /// Records `1` and `2` with `n = 100` each
    pub fn canonical(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            field: "n".to_string(),
            keys: [1, 2],
            initial_value: 100,
        }
    }

    /// Total the two records always add up to
    pub fn invariant(&self) -> i64 {
        self.initial_value * self.keys.len() as i64
    }

    /// Starting rows
    pub fn records(&self) -> Vec<Record> {
        self.keys
            .iter()
            .map(|key| Record::new(*key).with_field(self.field.clone(), self.initial_value))
            .collect()
    }
}

/// A workload the matrix can run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Workload {
    /// Sleeps for a fixed delay without touching the database
    Noop {
        #[serde(rename = "delay_ms", serialize_with = "crate::metrics::serialize_millis")]
        delay: Duration,
    },

    /// Increment record 1
    Update,

    /// Move a random amount from record 1 to record 2 and check the total
    ReadModifyWrite,

    /// [`Workload::ReadModifyWrite`] inside a causally consistent session
    ReadModifyWriteSession,

    /// [`Workload::ReadModifyWrite`] inside a multi-statement transaction
    ReadModifyWriteTransaction { options: TransactionOptions },
}

impl Workload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Noop { .. } => "noop",
            Self::Update => "update",
            Self::ReadModifyWrite => "read_modify_write",
            Self::ReadModifyWriteSession => "read_modify_write_session",
            Self::ReadModifyWriteTransaction { .. } => "read_modify_write_transaction",
        }
    }

    /// Whether the workload runs inside a transaction
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::ReadModifyWriteTransaction { .. })
    }

    /// Whether the workload checks the fixture invariant
    pub fn checks_invariant(&self) -> bool {
        matches!(
            self,
            Self::ReadModifyWrite
                | Self::ReadModifyWriteSession
                | Self::ReadModifyWriteTransaction { .. }
        )
    }

    /// Run the workload once
    pub async fn execute(
        &self,
        db: &dyn Database,
        fixture: &Fixture,
    ) -> Result<WorkloadOutcome, WorkloadError> {
        match self {
            Self::Noop { delay } => noop(*delay).await,
            Self::Update => update(db, fixture, None).await,
            Self::ReadModifyWrite => read_modify_write(db, fixture, None).await,
            Self::ReadModifyWriteSession => read_modify_write_session(db, fixture).await,
            Self::ReadModifyWriteTransaction { options } => {
                read_modify_write_transaction(db, fixture, options).await
            }
        }
    }
}

/// Sleep for `delay`
pub async fn noop(delay: Duration) -> Result<WorkloadOutcome, WorkloadError> {
    tokio::time::sleep(delay).await;
    Ok(WorkloadOutcome::Completed)
}

/// Increment the first record's field by one
pub async fn update(
    db: &dyn Database,
    fixture: &Fixture,
    session: Option<&SessionId>,
) -> Result<WorkloadOutcome, WorkloadError> {
    db.update_one(&fixture.collection, fixture.keys[0], &fixture.field, 1, session).await?;
    Ok(WorkloadOutcome::Completed)
}

/// Move a random amount in `[-100, 100]` between the two records and verify the total
pub async fn read_modify_write(
    db: &dyn Database,
    fixture: &Fixture,
    session: Option<&SessionId>,
) -> Result<WorkloadOutcome, WorkloadError> {
    let amount = rand::thread_rng().gen_range(-MAX_TRANSFER..=MAX_TRANSFER);
    transfer(db, fixture, session, amount).await
}

/// Read-modify-write with a fixed amount
pub async fn transfer(
    db: &dyn Database,
    fixture: &Fixture,
    session: Option<&SessionId>,
    amount: i64,
) -> Result<WorkloadOutcome, WorkloadError> {
    let [from, to] = fixture.keys;
    let collection = &fixture.collection;
    let field = &fixture.field;

    db.find_one(collection, from, session).await?;
    db.update_one(collection, from, field, -amount, session).await?;
    db.find_one(collection, to, session).await?;
    db.update_one(collection, to, field, amount, session).await?;

    let total = db.aggregate_sum(collection, SUM_GROUP, field, session).await?;
    let expected = fixture.invariant();
    if total != expected {
        error!(
            expected,
            observed = total,
            amount,
            concerns = %db.concerns(),
            "correctness violation: sum total diverged from the fixture invariant"
        );
        return Ok(WorkloadOutcome::Violation {
            expected,
            observed: total,
        });
    }
    Ok(WorkloadOutcome::Completed)
}

/// Read-modify-write bound to a causally consistent session
pub async fn read_modify_write_session(
    db: &dyn Database,
    fixture: &Fixture,
) -> Result<WorkloadOutcome, WorkloadError> {
    let session = db.start_session(true).await?;
    let result = read_modify_write(db, fixture, Some(&session)).await;
    end_session(db, session).await;
    result
}

/// Read-modify-write inside a transaction on a causally consistent session
///
/// A failed commit surfaces as [`WorkloadError::TransactionAbort`]; it is never
/// retried here.
pub async fn read_modify_write_transaction(
    db: &dyn Database,
    fixture: &Fixture,
    options: &TransactionOptions,
) -> Result<WorkloadOutcome, WorkloadError> {
    let session = db.start_session(true).await?;
    let result = run_transaction(db, fixture, options, &session).await;
    end_session(db, session).await;
    result
}

async fn run_transaction(
    db: &dyn Database,
    fixture: &Fixture,
    options: &TransactionOptions,
    session: &SessionId,
) -> Result<WorkloadOutcome, WorkloadError> {
    db.start_transaction(session, options).await?;

    let outcome = match read_modify_write(db, fixture, Some(session)).await {
        Ok(outcome) => outcome,
        Err(err) => {
            abort_transaction(db, session).await;
            return Err(err);
        }
    };

    db.commit_transaction(session)
        .await
        .map_err(WorkloadError::from_commit)?;
    Ok(outcome)
}

async fn abort_transaction(db: &dyn Database, session: &SessionId) {
    match db.abort_transaction(session).await {
        Ok(()) => debug!(session = %session, "transaction aborted"),
        // the server already ended it (write conflict)
        Err(StoreError::NoTransaction(_)) => {}
        Err(err) => warn!(session = %session, error = %err, "failed to abort transaction"),
    }
}

async fn end_session(db: &dyn Database, session: SessionId) {
    if let Err(err) = db.end_session(session).await {
        warn!(session = %session, error = %err, "failed to end session");
    }
}
