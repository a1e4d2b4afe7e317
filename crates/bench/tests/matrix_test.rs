//! End-to-end runs of the test matrix against the simulated replica set

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use txcost_bench::{
    load_config, ConfigurationEntry, ConnectError, DatabaseConnector, DriverState, EntryOutcome,
    FailureStage, Fixture, InMemoryConnector, TestMatrix, TestMatrixDriver, Workload,
};
use txcost_core::{
    ConcernSet, Database, InMemoryReplicaSet, Key, ReadConcern, ReadPreference, Record,
    ReplicationLag, ServerInfo, SessionId, SimulationConfig, StoreError, TransactionOptions,
    WriteConcern,
};

fn connector(lag: ReplicationLag) -> InMemoryConnector {
    InMemoryConnector::new(InMemoryReplicaSet::new(
        SimulationConfig::default().with_replication_lag(lag),
    ))
}

fn driver<C: DatabaseConnector>(
    connector: C,
    matrix: TestMatrix,
    dir: &tempfile::TempDir,
) -> TestMatrixDriver<C> {
    TestMatrixDriver::new(connector, matrix, Fixture::canonical("hltest"))
        .with_output_dir(dir.path())
        .with_output(Box::new(std::io::sink()))
}

/// Fails the `fail_on`-th call to `connect` (0-based) as if the server were down
struct FlakyConnector {
    inner: InMemoryConnector,
    fail_on: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl DatabaseConnector for FlakyConnector {
    async fn connect(&self, concerns: &ConcernSet) -> Result<Arc<dyn Database>, ConnectError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            return Err(ConnectError::Unreachable("connection refused".to_string()));
        }
        self.inner.connect(concerns).await
    }

    async fn connect_admin(&self) -> Result<Arc<dyn Database>, ConnectError> {
        self.inner.connect_admin().await
    }
}

/// Database handle that loses its connection after `remaining` data operations
struct DroppingDatabase {
    inner: Arc<dyn Database>,
    remaining: AtomicUsize,
}

impl DroppingDatabase {
    fn tick(&self) -> Result<(), StoreError> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StoreError::Unreachable("connection reset".to_string()));
        }
        self.remaining.store(left - 1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Database for DroppingDatabase {
    fn concerns(&self) -> &ConcernSet {
        self.inner.concerns()
    }

    async fn find_one(
        &self,
        collection: &str,
        key: Key,
        session: Option<&SessionId>,
    ) -> Result<Record, StoreError> {
        self.tick()?;
        self.inner.find_one(collection, key, session).await
    }

    async fn update_one(
        &self,
        collection: &str,
        key: Key,
        field: &str,
        delta: i64,
        session: Option<&SessionId>,
    ) -> Result<(), StoreError> {
        self.tick()?;
        self.inner
            .update_one(collection, key, field, delta, session)
            .await
    }

    async fn aggregate_sum(
        &self,
        collection: &str,
        group_key: &str,
        field: &str,
        session: Option<&SessionId>,
    ) -> Result<i64, StoreError> {
        self.tick()?;
        self.inner
            .aggregate_sum(collection, group_key, field, session)
            .await
    }

    async fn start_session(&self, causal_consistency: bool) -> Result<SessionId, StoreError> {
        self.inner.start_session(causal_consistency).await
    }

    async fn start_transaction(
        &self,
        session: &SessionId,
        options: &TransactionOptions,
    ) -> Result<(), StoreError> {
        self.inner.start_transaction(session, options).await
    }

    async fn commit_transaction(&self, session: &SessionId) -> Result<(), StoreError> {
        self.inner.commit_transaction(session).await
    }

    async fn abort_transaction(&self, session: &SessionId) -> Result<(), StoreError> {
        self.inner.abort_transaction(session).await
    }

    async fn end_session(&self, session: SessionId) -> Result<(), StoreError> {
        self.inner.end_session(session).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.inner.drop_collection(collection).await
    }

    async fn insert(&self, collection: &str, record: Record) -> Result<(), StoreError> {
        self.inner.insert(collection, record).await
    }

    async fn server_info(&self) -> Result<ServerInfo, StoreError> {
        self.inner.server_info().await
    }
}

/// Hands out a [`DroppingDatabase`] for the `entry`-th call to `connect` (0-based)
struct DroppingConnector {
    inner: InMemoryConnector,
    entry: usize,
    operations_before_drop: usize,
    connects: AtomicUsize,
}

#[async_trait]
impl DatabaseConnector for DroppingConnector {
    async fn connect(&self, concerns: &ConcernSet) -> Result<Arc<dyn Database>, ConnectError> {
        let db = self.inner.connect(concerns).await?;
        if self.connects.fetch_add(1, Ordering::SeqCst) != self.entry {
            return Ok(db);
        }
        Ok(Arc::new(DroppingDatabase {
            inner: db,
            remaining: AtomicUsize::new(self.operations_before_drop),
        }))
    }

    async fn connect_admin(&self) -> Result<Arc<dyn Database>, ConnectError> {
        self.inner.connect_admin().await
    }
}

#[test_log::test(tokio::test)]
async fn test_default_matrix_reports_every_entry_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(None).unwrap().with_iterations(5);
    let matrix = config.matrix().unwrap();
    let expected: Vec<ConfigurationEntry> = matrix.entries().to_vec();

    let mut driver = driver(connector(ReplicationLag::default()), matrix, &dir);
    let run = driver.run().await;

    assert_eq!(driver.state(), DriverState::Done);
    assert_eq!(run.entries.len(), expected.len());
    for (position, report) in run.entries.iter().enumerate() {
        assert_eq!(report.index, position);
        assert_eq!(report.entry, expected[position]);
        assert!(!report.is_failed(), "{}", report.text);
        assert_eq!(report.samples.len(), 5);
        assert!(report.graph.as_ref().unwrap().exists());
    }

    let summary = run.summary_path.as_ref().unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(summary).unwrap()).unwrap();
    assert_eq!(json["entries"].as_array().unwrap().len(), expected.len());
    assert_eq!(json["entries"][0]["outcome"]["status"], "completed");
}

#[tokio::test]
async fn test_connect_failure_is_isolated_to_its_entry() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![
        ConfigurationEntry::new(Workload::Update, ConcernSet::new()).unwrap(),
        ConfigurationEntry::new(
            Workload::ReadModifyWrite,
            ConcernSet::new().with_write(WriteConcern::majority()),
        )
        .unwrap(),
        ConfigurationEntry::new(Workload::ReadModifyWriteSession, ConcernSet::new()).unwrap(),
    ];
    let connector = FlakyConnector {
        inner: connector(ReplicationLag::none()),
        fail_on: 1,
        calls: AtomicUsize::new(0),
    };

    let run = driver(connector, TestMatrix::new(3, entries).unwrap(), &dir)
        .run()
        .await;

    assert_eq!(run.entries.len(), 3);
    assert!(!run.entries[0].is_failed());
    assert!(matches!(
        &run.entries[1].outcome,
        EntryOutcome::Failed {
            stage: FailureStage::Connecting,
            partial: None,
            ..
        }
    ));
    assert!(run.entries[1].text.contains("FAILED while connecting"));
    assert!(!run.entries[2].is_failed());
    assert_eq!(run.entries[2].samples.len(), 3);
    assert_eq!((run.completed(), run.failed()), (2, 1));
}

#[tokio::test]
async fn test_unreachable_database_fails_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let connector = connector(ReplicationLag::none());
    connector.cluster().set_reachable(false);
    let entries = vec![
        ConfigurationEntry::new(Workload::Update, ConcernSet::new()).unwrap(),
        ConfigurationEntry::new(Workload::ReadModifyWrite, ConcernSet::new()).unwrap(),
    ];

    let run = driver(connector, TestMatrix::new(10, entries).unwrap(), &dir)
        .run()
        .await;

    assert_eq!(run.entries.len(), 2);
    assert_eq!(run.failed(), 2);
    // the summary is still written
    assert!(run.summary_path.unwrap().exists());
}

#[tokio::test]
async fn test_noop_timer_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let entry = ConfigurationEntry::new(
        Workload::Noop {
            delay: Duration::from_millis(10),
        },
        ConcernSet::new(),
    )
    .unwrap();

    let run = driver(
        connector(ReplicationLag::none()),
        TestMatrix::new(5, vec![entry]).unwrap(),
        &dir,
    )
    .run()
    .await;

    let report = &run.entries[0];
    assert_eq!(report.samples.len(), 5);
    for sample in &report.samples {
        assert!(sample.millis() >= 10.0);
    }
    let stats = report.statistics().unwrap();
    assert_eq!(stats.count, 5);
    assert!(stats.median >= 10.0 && stats.median < 40.0, "{}", stats.median);
}

#[tokio::test]
async fn test_weak_consistency_violates_and_strong_does_not() {
    let dir = tempfile::tempdir().unwrap();
    let weak = ConfigurationEntry::new(
        Workload::ReadModifyWrite,
        ConcernSet::new()
            .with_write(WriteConcern::nodes(1))
            .with_read(ReadConcern::Local)
            .with_preference(ReadPreference::Secondary),
    )
    .unwrap();
    let strong = ConfigurationEntry::new(
        Workload::ReadModifyWrite,
        ConcernSet::new()
            .with_write(WriteConcern::majority())
            .with_read(ReadConcern::Linearizable)
            .with_preference(ReadPreference::Primary),
    )
    .unwrap();

    let run = driver(
        connector(ReplicationLag::fixed(1)),
        TestMatrix::new(50, vec![weak, strong]).unwrap(),
        &dir,
    )
    .run()
    .await;

    assert!(run.entries[0].violations() >= 1);
    assert_eq!(run.entries[1].violations(), 0);
    // violations are informational: both entries complete
    assert_eq!(run.failed(), 0);
}

#[tokio::test]
async fn test_transactions_keep_the_invariant_under_lag() {
    let dir = tempfile::tempdir().unwrap();
    let majority = ConcernSet::new()
        .with_write(WriteConcern::majority())
        .with_read(ReadConcern::Snapshot)
        .with_preference(ReadPreference::Primary);
    let entry = ConfigurationEntry::new(
        Workload::ReadModifyWriteTransaction { options: majority },
        majority,
    )
    .unwrap();
    let connector = connector(ReplicationLag::fixed(2));
    let cluster = connector.cluster().clone();

    let run = driver(connector, TestMatrix::new(20, vec![entry]).unwrap(), &dir)
        .run()
        .await;

    assert_eq!(run.entries[0].violations(), 0);
    assert_eq!(cluster.open_sessions(), 0);
    assert_eq!(cluster.open_transactions(), 0);
}

#[tokio::test]
async fn test_connectivity_lost_mid_run_truncates_only_that_entry() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![
        ConfigurationEntry::new(Workload::Update, ConcernSet::new()).unwrap(),
        ConfigurationEntry::new(Workload::Update, ConcernSet::new()).unwrap(),
    ];
    let connector = DroppingConnector {
        inner: connector(ReplicationLag::none()),
        entry: 0,
        operations_before_drop: 3,
        connects: AtomicUsize::new(0),
    };

    let run = driver(connector, TestMatrix::new(10, entries).unwrap(), &dir)
        .run()
        .await;

    assert_eq!(run.entries.len(), 2);
    match &run.entries[0].outcome {
        EntryOutcome::Failed {
            stage: FailureStage::Running,
            error,
            partial: Some(partial),
        } => {
            assert!(error.contains("connection reset"), "{}", error);
            assert_eq!(partial.count, 4);
        }
        other => panic!("expected a truncated run, got {:?}", other),
    }
    // three completed iterations plus the one that hit the reset
    assert_eq!(run.entries[0].samples.len(), 4);
    assert!(run.entries[0].samples[3].is_failure());

    assert!(!run.entries[1].is_failed(), "{}", run.entries[1].text);
    assert_eq!(run.entries[1].samples.len(), 10);
    assert_eq!((run.completed(), run.failed()), (1, 1));
}

#[tokio::test]
async fn test_artifact_write_failure_does_not_stop_the_matrix() {
    let dir = tempfile::tempdir().unwrap();
    // a regular file where the output directory's parent should be
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"not a directory").unwrap();
    let entries = vec![
        ConfigurationEntry::new(Workload::Update, ConcernSet::new()).unwrap(),
        ConfigurationEntry::new(Workload::ReadModifyWrite, ConcernSet::new()).unwrap(),
    ];

    let run = TestMatrixDriver::new(
        connector(ReplicationLag::none()),
        TestMatrix::new(3, entries).unwrap(),
        Fixture::canonical("hltest"),
    )
    .with_output_dir(blocker.join("out"))
    .with_output(Box::new(std::io::sink()))
    .run()
    .await;

    assert_eq!(run.entries.len(), 2);
    assert_eq!(run.failed(), 0);
    for report in &run.entries {
        assert!(report.graph.is_none());
        assert_eq!(report.samples.len(), 3);
        assert!(report.text.contains("median"), "{}", report.text);
    }
    assert!(run.summary_path.is_none());
}
