//! Database connections and fixture seeding

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use txcost_core::{
    ConcernSet, Database, InMemoryReplicaSet, ReadPreference, StoreError, WriteConcern,
};

use crate::workload::Fixture;

/// Errors obtaining a database handle
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Database cannot be reached
    #[error("database unreachable: {0}")]
    Unreachable(String),

    /// The requested concern triple cannot be honoured by this deployment
    #[error("invalid concern: {0}")]
    InvalidConcern(String),
}

impl From<StoreError> for ConnectError {
    fn from(err: StoreError) -> Self {
        if err.is_connectivity() {
            Self::Unreachable(err.to_string())
        } else {
            Self::InvalidConcern(err.to_string())
        }
    }
}

/// Obtains database handles bound to a concern triple
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// Handle bound to `concerns` for the whole configuration run
    async fn connect(&self, concerns: &ConcernSet) -> Result<Arc<dyn Database>, ConnectError>;

    /// Handle used to reseed fixtures: writes are acknowledged by every member,
    /// so the run starts from the same state on every replica
    async fn connect_admin(&self) -> Result<Arc<dyn Database>, ConnectError>;
}

/// Connector for an [`InMemoryReplicaSet`]
#[derive(Clone)]
pub struct InMemoryConnector {
    cluster: InMemoryReplicaSet,
}

impl InMemoryConnector {
    pub fn new(cluster: InMemoryReplicaSet) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &InMemoryReplicaSet {
        &self.cluster
    }
}

#[async_trait]
impl DatabaseConnector for InMemoryConnector {
    async fn connect(&self, concerns: &ConcernSet) -> Result<Arc<dyn Database>, ConnectError> {
        let handle = self.cluster.connect(*concerns)?;
        debug!(concerns = %concerns, "connected");
        Ok(Arc::new(handle))
    }

    async fn connect_admin(&self) -> Result<Arc<dyn Database>, ConnectError> {
        let concerns = ConcernSet::new()
            .with_write(WriteConcern::nodes(self.cluster.member_count()).with_journal(true))
            .with_preference(ReadPreference::Primary);
        let handle = self.cluster.connect(concerns)?;
        Ok(Arc::new(handle))
    }
}

/// Drop the fixture collection and insert the canonical starting rows
///
/// Calling it twice in a row leaves the same state as calling it once.
pub async fn reseed(db: &dyn Database, fixture: &Fixture) -> Result<(), StoreError> {
    db.drop_collection(&fixture.collection).await?;
    for record in fixture.records() {
        db.insert(&fixture.collection, record).await?;
    }
    info!(
        collection = %fixture.collection,
        invariant = fixture.invariant(),
        "fixture reseeded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use txcost_core::{Acknowledgement, ReplicationLag, SimulationConfig};

    fn connector(lag: ReplicationLag) -> InMemoryConnector {
        InMemoryConnector::new(InMemoryReplicaSet::new(
            SimulationConfig::default().with_replication_lag(lag),
        ))
    }

    async fn fixture_sum(db: &dyn Database, fixture: &Fixture) -> i64 {
        let mut total = 0;
        for key in fixture.keys {
            let record = db.find_one(&fixture.collection, key, None).await.unwrap();
            total += record.get(&fixture.field).unwrap();
        }
        total
    }

    #[tokio::test]
    async fn test_reseed_establishes_invariant() {
        let connector = connector(ReplicationLag::fixed(3));
        let fixture = Fixture::canonical("hltest");
        let admin = connector.connect_admin().await.unwrap();

        reseed(admin.as_ref(), &fixture).await.unwrap();

        assert_eq!(fixture_sum(admin.as_ref(), &fixture).await, fixture.invariant());
    }

    #[tokio::test]
    async fn test_reseed_reaches_every_member() {
        let connector = connector(ReplicationLag::fixed(3));
        let fixture = Fixture::canonical("hltest");
        let admin = connector.connect_admin().await.unwrap();

        reseed(admin.as_ref(), &fixture).await.unwrap();

        for secondary in 0..2 {
            assert_eq!(
                connector.cluster().secondary_records(secondary, "hltest"),
                fixture.records()
            );
        }
    }

    #[tokio::test]
    async fn test_reseed_is_idempotent() {
        let connector = connector(ReplicationLag::none());
        let fixture = Fixture::canonical("hltest");
        let admin = connector.connect_admin().await.unwrap();
        let db = connector.connect(&ConcernSet::new()).await.unwrap();

        reseed(admin.as_ref(), &fixture).await.unwrap();
        let first = connector.cluster().primary_records("hltest");

        db.update_one("hltest", 1, "n", 42, None).await.unwrap();
        reseed(admin.as_ref(), &fixture).await.unwrap();
        reseed(admin.as_ref(), &fixture).await.unwrap();
        let second = connector.cluster().primary_records("hltest");

        assert_eq!(first, second);
        assert_eq!(first, fixture.records());
    }

    #[tokio::test]
    async fn test_connect_binds_concerns() {
        let connector = connector(ReplicationLag::none());
        let concerns = ConcernSet::new().with_write(WriteConcern::majority());

        let db = connector.connect(&concerns).await.unwrap();
        assert_eq!(db.concerns().write.map(|w| w.w), Some(Acknowledgement::Majority));
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let connector = connector(ReplicationLag::none());
        connector.cluster().set_reachable(false);

        let err = connector.connect(&ConcernSet::new()).await.err().unwrap();
        assert!(matches!(err, ConnectError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_connect_invalid_concern() {
        let connector = connector(ReplicationLag::none());
        let concerns = ConcernSet::new().with_write(WriteConcern::nodes(7));

        let err = connector.connect(&concerns).await.err().unwrap();
        assert!(matches!(err, ConnectError::InvalidConcern(_)));
    }
}
