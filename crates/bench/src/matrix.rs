//! Test matrix and the driver that runs it
//!
//! The driver walks every [`ConfigurationEntry`] in order through
//! `ConnectingForEntry -> Reseeding -> Running -> Reporting`, and finishes in
//! `Done`. A failure in any stage is confined to its entry: the entry gets an
//! error section and the driver moves on to the next one.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use txcost_core::{ConcernSet, ReadConcern, ReadPreference, ServerInfo, TransactionOptions};

use crate::connector::{reseed, DatabaseConnector};
use crate::graph::{artifact_path, plot_title, GraphReporter};
use crate::metrics::{DurationSample, StatisticsSummary};
use crate::report::{render, render_failure, write_run_summary, ReportContext};
use crate::runner::LoopRunner;
use crate::workload::{Fixture, Workload};

/// Invalid matrix definitions, rejected before anything runs
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("read concern snapshot is only valid for transaction workloads, not {0}")]
    SnapshotOutsideTransaction(&'static str),

    #[error("read concern linearizable requires read preference primary, got {0}")]
    LinearizableOffPrimary(ReadPreference),

    #[error("transactions require read preference primary, got {0}")]
    TransactionOffPrimary(ReadPreference),

    #[error("read concern {0} is not supported in a transaction")]
    TransactionReadConcern(ReadConcern),

    #[error("iteration count must be at least 1")]
    ZeroIterations,

    #[error("test matrix has no entries")]
    Empty,
}

/// One row of the matrix: a workload and the concerns its handle is bound to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationEntry {
    workload: Workload,
    concerns: ConcernSet,
}

impl ConfigurationEntry {
    pub fn new(workload: Workload, concerns: ConcernSet) -> Result<Self, MatrixError> {
        check_linearizable(&concerns)?;

        match &workload {
            Workload::ReadModifyWriteTransaction { options } => {
                check_linearizable(options)?;
                if let Some(preference) = options.preference {
                    if preference != ReadPreference::Primary {
                        return Err(MatrixError::TransactionOffPrimary(preference));
                    }
                }
                let read = options.read.or(concerns.read).unwrap_or_default();
                if matches!(read, ReadConcern::Linearizable | ReadConcern::Available) {
                    return Err(MatrixError::TransactionReadConcern(read));
                }
            }
            other => {
                if concerns.read == Some(ReadConcern::Snapshot) {
                    return Err(MatrixError::SnapshotOutsideTransaction(other.name()));
                }
            }
        }

        Ok(Self { workload, concerns })
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn concerns(&self) -> &ConcernSet {
        &self.concerns
    }

    pub fn transaction_options(&self) -> Option<&TransactionOptions> {
        match &self.workload {
            Workload::ReadModifyWriteTransaction { options } => Some(options),
            _ => None,
        }
    }

    /// Human readable label, e.g. `read_modify_write, w=1, rc=local, rp=secondary`
    pub fn description(&self) -> String {
        match &self.workload {
            Workload::Noop { delay } => {
                format!("noop {}ms, {}", delay.as_millis(), self.concerns)
            }
            Workload::ReadModifyWriteTransaction { options } => {
                format!("{} [txn: {}], {}", self.workload.name(), options, self.concerns)
            }
            workload => format!("{}, {}", workload.name(), self.concerns),
        }
    }
}

fn check_linearizable(concerns: &ConcernSet) -> Result<(), MatrixError> {
    if concerns.read == Some(ReadConcern::Linearizable) {
        let preference = concerns.effective_preference();
        if preference != ReadPreference::Primary {
            return Err(MatrixError::LinearizableOffPrimary(preference));
        }
    }
    Ok(())
}

/// Ordered, validated list of configurations run with the same iteration count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestMatrix {
    iterations: u64,
    entries: Vec<ConfigurationEntry>,
}

impl TestMatrix {
    pub fn new(iterations: u64, entries: Vec<ConfigurationEntry>) -> Result<Self, MatrixError> {
        if iterations == 0 {
            return Err(MatrixError::ZeroIterations);
        }
        if entries.is_empty() {
            return Err(MatrixError::Empty);
        }
        Ok(Self {
            iterations,
            entries,
        })
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn entries(&self) -> &[ConfigurationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where the driver is in the matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    ConnectingForEntry(usize),
    Reseeding(usize),
    Running(usize),
    Reporting(usize),
    Done,
}

/// Stage an entry failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Connecting,
    Reseeding,
    Running,
    Reporting,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Reseeding => write!(f, "reseeding"),
            Self::Running => write!(f, "running"),
            Self::Reporting => write!(f, "reporting"),
        }
    }
}

/// How one configuration run ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryOutcome {
    Completed {
        statistics: StatisticsSummary,
        violations: usize,
        failures: usize,
    },
    Failed {
        stage: FailureStage,
        error: String,
        /// Statistics over the iterations that ran before the failure
        partial: Option<StatisticsSummary>,
    },
}

/// Result of one configuration run
#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    /// Position in the matrix
    pub index: usize,
    pub entry: ConfigurationEntry,
    pub server: Option<ServerInfo>,
    pub outcome: EntryOutcome,
    pub samples: Vec<DurationSample>,
    /// Scatter plot written for this entry
    pub graph: Option<PathBuf>,
    /// Rendered text block
    #[serde(skip)]
    pub text: String,
}

impl EntryReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, EntryOutcome::Failed { .. })
    }

    pub fn statistics(&self) -> Option<&StatisticsSummary> {
        match &self.outcome {
            EntryOutcome::Completed { statistics, .. } => Some(statistics),
            EntryOutcome::Failed { partial, .. } => partial.as_ref(),
        }
    }

    pub fn violations(&self) -> usize {
        self.samples.iter().filter(|s| s.is_violation()).count()
    }
}

/// Every entry's report, in matrix order
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub test_name: String,
    pub started_at: DateTime<Utc>,
    pub iterations: u64,
    pub entries: Vec<EntryReport>,
    #[serde(skip)]
    pub summary_path: Option<PathBuf>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_failed()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| e.is_failed()).count()
    }
}

/// Runs every entry of a [`TestMatrix`] against a connector
pub struct TestMatrixDriver<C> {
    connector: C,
    matrix: TestMatrix,
    fixture: Fixture,
    graphs: GraphReporter,
    test_name: String,
    output_dir: PathBuf,
    output: Box<dyn Write + Send>,
    state: DriverState,
}

impl<C: DatabaseConnector> TestMatrixDriver<C> {
    pub fn new(connector: C, matrix: TestMatrix, fixture: Fixture) -> Self {
        Self {
            connector,
            matrix,
            fixture,
            graphs: GraphReporter::default(),
            test_name: "single_threaded".to_string(),
            output_dir: PathBuf::from("results"),
            output: Box::new(std::io::stdout()),
            state: DriverState::Idle,
        }
    }

    pub fn with_test_name(mut self, test_name: impl Into<String>) -> Self {
        self.test_name = test_name.into();
        self
    }

    /// Directory graphs and the run summary are written to
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Sink for the text reports (stdout by default)
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run the whole matrix
    ///
    /// Always returns one report per entry, in matrix order.
    pub async fn run(&mut self) -> RunReport {
        let started_at = Utc::now();
        let entries = self.matrix.entries().to_vec();
        info!(
            test_name = %self.test_name,
            entries = entries.len(),
            iterations = self.matrix.iterations(),
            "starting test matrix"
        );

        let mut reports = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let report = self.run_entry(index, entry).await;
            if let Err(err) = writeln!(self.output, "{}", report.text) {
                warn!(error = %err, "failed to write report");
            }
            reports.push(report);
        }
        self.transition(DriverState::Done);

        let mut run = RunReport {
            test_name: self.test_name.clone(),
            started_at,
            iterations: self.matrix.iterations(),
            entries: reports,
            summary_path: None,
        };

        let timestamp = started_at.format("%Y%m%d-%H%M%S").to_string();
        match write_run_summary(&self.output_dir, &timestamp, &run) {
            Ok(path) => {
                info!(path = %path.display(), "run summary written");
                run.summary_path = Some(path);
            }
            Err(err) => error!(error = %err, "failed to write run summary"),
        }

        info!(
            completed = run.completed(),
            failed = run.failed(),
            "test matrix finished"
        );
        run
    }

    async fn run_entry(&mut self, index: usize, entry: ConfigurationEntry) -> EntryReport {
        let mut context = ReportContext {
            test_name: self.test_name.clone(),
            server: ServerInfo {
                version: "unknown".to_string(),
                storage_engine: "unknown".to_string(),
            },
            iterations: self.matrix.iterations(),
        };

        self.transition(DriverState::ConnectingForEntry(index));
        let db = match self.connector.connect(entry.concerns()).await {
            Ok(db) => db,
            Err(err) => {
                return self.failed(
                    index,
                    entry,
                    FailureStage::Connecting,
                    err.to_string(),
                    &context,
                );
            }
        };
        let server = match db.server_info().await {
            Ok(server) => server,
            Err(err) => {
                return self.failed(
                    index,
                    entry,
                    FailureStage::Connecting,
                    err.to_string(),
                    &context,
                );
            }
        };
        context.server = server.clone();

        self.transition(DriverState::Reseeding(index));
        let seeded = match self.connector.connect_admin().await {
            Ok(admin) => reseed(admin.as_ref(), &self.fixture)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        if let Err(err) = seeded {
            let mut report = self.failed(index, entry, FailureStage::Reseeding, err, &context);
            report.server = Some(server);
            return report;
        }

        self.transition(DriverState::Running(index));
        let result = {
            let db = db.as_ref();
            let fixture = &self.fixture;
            let workload = entry.workload();
            LoopRunner::new(self.matrix.iterations())
                .run(move || workload.execute(db, fixture))
                .await
        };

        self.transition(DriverState::Reporting(index));
        let statistics = match StatisticsSummary::from_samples(&result.samples) {
            Ok(statistics) => statistics,
            Err(err) => {
                let mut report =
                    self.failed(index, entry, FailureStage::Reporting, err.to_string(), &context);
                report.server = Some(server);
                return report;
            }
        };

        let path = artifact_path(
            &self.output_dir,
            &entry,
            &server,
            &Utc::now().format("%Y%m%d-%H%M%S%.3f").to_string(),
        );
        let graph = match self
            .graphs
            .plot(&result.samples, &plot_title(&entry, &server), &path)
        {
            Ok(()) => {
                debug!(path = %path.display(), "graph written");
                Some(path)
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to write graph");
                None
            }
        };

        let text = render(&statistics, &entry, &result, &context);
        let outcome = if result.truncated {
            EntryOutcome::Failed {
                stage: FailureStage::Running,
                error: result
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| "loop aborted".to_string()),
                partial: Some(statistics),
            }
        } else {
            EntryOutcome::Completed {
                statistics,
                violations: result.violations(),
                failures: result.failures(),
            }
        };

        info!(
            index,
            entry = %entry.description(),
            violations = result.violations(),
            failures = result.failures(),
            truncated = result.truncated,
            "entry finished"
        );

        EntryReport {
            index,
            entry,
            server: Some(server),
            outcome,
            samples: result.samples,
            graph,
            text,
        }
    }

    fn failed(
        &self,
        index: usize,
        entry: ConfigurationEntry,
        stage: FailureStage,
        error: String,
        context: &ReportContext,
    ) -> EntryReport {
        error!(index, entry = %entry.description(), %stage, %error, "entry failed");
        let text = render_failure(&entry, &stage.to_string(), &error, context);
        EntryReport {
            index,
            entry,
            server: None,
            outcome: EntryOutcome::Failed {
                stage,
                error,
                partial: None,
            },
            samples: Vec::new(),
            graph: None,
            text,
        }
    }

    fn transition(&mut self, next: DriverState) {
        debug!(from = ?self.state, to = ?next, "driver state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use txcost_core::WriteConcern;

    fn transaction(options: TransactionOptions) -> Workload {
        Workload::ReadModifyWriteTransaction { options }
    }

    #[test]
    fn test_snapshot_only_in_transactions() {
        let snapshot = ConcernSet::new().with_read(ReadConcern::Snapshot);

        assert_eq!(
            ConfigurationEntry::new(Workload::ReadModifyWrite, snapshot).unwrap_err(),
            MatrixError::SnapshotOutsideTransaction("read_modify_write")
        );
        assert!(ConfigurationEntry::new(transaction(ConcernSet::new()), snapshot).is_ok());
        assert!(ConfigurationEntry::new(transaction(snapshot), ConcernSet::new()).is_ok());
    }

    #[test]
    fn test_linearizable_requires_primary() {
        let concerns = ConcernSet::new()
            .with_read(ReadConcern::Linearizable)
            .with_preference(ReadPreference::Secondary);

        assert_eq!(
            ConfigurationEntry::new(Workload::ReadModifyWrite, concerns).unwrap_err(),
            MatrixError::LinearizableOffPrimary(ReadPreference::Secondary)
        );
        assert!(ConfigurationEntry::new(
            Workload::ReadModifyWrite,
            ConcernSet::new().with_read(ReadConcern::Linearizable)
        )
        .is_ok());
    }

    #[test]
    fn test_transaction_options_validated() {
        let secondary = ConcernSet::new().with_preference(ReadPreference::Secondary);
        assert_eq!(
            ConfigurationEntry::new(transaction(secondary), ConcernSet::new()).unwrap_err(),
            MatrixError::TransactionOffPrimary(ReadPreference::Secondary)
        );

        let available = ConcernSet::new().with_read(ReadConcern::Available);
        assert_eq!(
            ConfigurationEntry::new(transaction(ConcernSet::new()), available).unwrap_err(),
            MatrixError::TransactionReadConcern(ReadConcern::Available)
        );
    }

    #[test]
    fn test_matrix_rejects_empty_and_zero_iterations() {
        let entry = ConfigurationEntry::new(Workload::Update, ConcernSet::new()).unwrap();

        assert_eq!(
            TestMatrix::new(0, vec![entry.clone()]).unwrap_err(),
            MatrixError::ZeroIterations
        );
        assert_eq!(TestMatrix::new(10, vec![]).unwrap_err(), MatrixError::Empty);
        assert_eq!(TestMatrix::new(10, vec![entry]).unwrap().len(), 1);
    }

    #[test]
    fn test_descriptions() {
        let majority = ConcernSet::new().with_write(WriteConcern::majority());

        let plain = ConfigurationEntry::new(Workload::ReadModifyWrite, majority).unwrap();
        assert_eq!(plain.description(), "read_modify_write, w=majority");

        let txn = ConfigurationEntry::new(transaction(ConcernSet::new()), majority).unwrap();
        assert_eq!(
            txn.description(),
            "read_modify_write_transaction [txn: server defaults], w=majority"
        );

        let noop = ConfigurationEntry::new(
            Workload::Noop {
                delay: Duration::from_millis(10),
            },
            ConcernSet::new(),
        )
        .unwrap();
        assert_eq!(noop.description(), "noop 10ms, server defaults");
    }
}
