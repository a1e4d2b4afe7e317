//! Database trait definition

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::concern::{ConcernSet, ReadPreference, TransactionOptions};

/// Primary key of a record
pub type Key = i64;

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database cannot be reached
    #[error("database unreachable: {0}")]
    Unreachable(String),

    /// No member matches the read preference
    #[error("no replica set member matches read preference {0}")]
    NoEligibleMember(ReadPreference),

    /// Record not found
    #[error("record {key} not found in {collection}")]
    NotFound { collection: String, key: Key },

    /// Session not found (never started or already ended)
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Transaction operation without an open transaction
    #[error("no transaction in progress for session {0}")]
    NoTransaction(SessionId),

    /// Transaction started twice on the same session
    #[error("transaction already in progress for session {0}")]
    TransactionInProgress(SessionId),

    /// Another write touched a record after the transaction's snapshot
    #[error("write conflict on {collection}/{key}")]
    WriteConflict { collection: String, key: Key },

    /// Transaction could not be committed; none of its writes were applied
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// Operation not allowed with the requested options
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl StoreError {
    /// Whether the error means the database itself could not be reached
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::NoEligibleMember(_))
    }

    /// Whether the error ended the surrounding transaction
    pub fn is_transaction_abort(&self) -> bool {
        matches!(
            self,
            Self::TransactionAborted(_) | Self::WriteConflict { .. }
        )
    }
}

/// A record in a collection: an integer key and named integer fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: Key,
    pub fields: BTreeMap<String, i64>,
}

impl Record {
    pub fn new(id: Key) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Set a field
    pub fn with_field(mut self, name: impl Into<String>, value: i64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Get a field value
    pub fn get(&self, field: &str) -> Option<i64> {
        self.fields.get(field).copied()
    }
}

/// Server identification used to label reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub storage_engine: String,
}

/// Identifier of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The database capability the harness measures
///
/// A handle is bound to exactly one [`ConcernSet`] when it is created; no
/// operation takes a per-call override. Operations that accept a session run
/// inside that session (and inside its transaction, when one is open).
#[async_trait]
pub trait Database: Send + Sync {
    /// Concern triple this handle was bound to
    fn concerns(&self) -> &ConcernSet;

    /// Find a record by key
    async fn find_one(
        &self,
        collection: &str,
        key: Key,
        session: Option<&SessionId>,
    ) -> Result<Record, StoreError>;

    /// Increment `field` of the record with `key` by `delta`
    async fn update_one(
        &self,
        collection: &str,
        key: Key,
        field: &str,
        delta: i64,
        session: Option<&SessionId>,
    ) -> Result<(), StoreError>;

    /// Sum `field` over every record of the collection, grouped under `group_key`
    async fn aggregate_sum(
        &self,
        collection: &str,
        group_key: &str,
        field: &str,
        session: Option<&SessionId>,
    ) -> Result<i64, StoreError>;

    /// Start a client session
    async fn start_session(&self, causal_consistency: bool) -> Result<SessionId, StoreError>;

    /// Start a multi-statement transaction on a session
    async fn start_transaction(
        &self,
        session: &SessionId,
        options: &TransactionOptions,
    ) -> Result<(), StoreError>;

    /// Commit the session's transaction
    async fn commit_transaction(&self, session: &SessionId) -> Result<(), StoreError>;

    /// Abort the session's transaction, discarding its writes
    async fn abort_transaction(&self, session: &SessionId) -> Result<(), StoreError>;

    /// End a session, aborting any transaction still open on it
    async fn end_session(&self, session: SessionId) -> Result<(), StoreError>;

    /// Drop a collection (no-op when it does not exist)
    async fn drop_collection(&self, collection: &str) -> Result<(), StoreError>;

    /// Insert a record
    async fn insert(&self, collection: &str, record: Record) -> Result<(), StoreError>;

    /// Server version and storage engine
    async fn server_info(&self) -> Result<ServerInfo, StoreError>;
}
