//! # txcost core
//!
//! Shared abstractions for measuring what consistency and durability cost on a
//! replicated database.
//!
//! ## Modules
//!
//! - [`concern`]: write concern, read concern and read preference levels
//! - [`persistence`]: the [`Database`] capability and an in-memory simulated
//!   replica set implementing it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Database (trait)                         │
//! │  (find_one, update_one, aggregate_sum, sessions, txns)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   InMemoryReplicaSet                         │
//! │  (primary + lagging secondaries replaying a shared oplog)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod concern;
pub mod persistence;

pub use concern::{
    Acknowledgement, ConcernSet, ReadConcern, ReadPreference, TransactionOptions, WriteConcern,
};
pub use persistence::{
    Database, InMemoryReplicaSet, Key, LatencyModel, Record, ReplicaSetHandle, ReplicationLag,
    ServerInfo, SessionId, SimulationConfig, StoreError,
};
