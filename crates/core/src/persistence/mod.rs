//! Persistence layer for the harness
//!
//! This module provides:
//! - [`Database`] trait: the capability the workloads run against
//! - [`InMemoryReplicaSet`]: a simulated replica set with replication lag,
//!   causal sessions and snapshot transactions

mod memory;
mod store;

pub use memory::{
    InMemoryReplicaSet, LatencyModel, ReplicaSetHandle, ReplicationLag, SimulationConfig,
};
pub use store::{Database, Key, Record, ServerInfo, SessionId, StoreError};
