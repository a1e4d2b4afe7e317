//! Consistency and durability latency harness
//!
//! Runs a fixed read-modify-write workload through a matrix of write concerns,
//! read concerns and read preferences, timing every iteration and reporting
//! descriptive statistics plus a latency scatter plot per configuration.
//!
//! Control flow per matrix entry:
//!
//! ```text
//! TestMatrixDriver -> DatabaseConnector::connect -> reseed
//!                  -> LoopRunner (timeit(Workload::execute) x N)
//!                  -> StatisticsSummary -> text report + SVG graph
//! ```

pub mod config;
pub mod connector;
pub mod graph;
pub mod matrix;
pub mod metrics;
pub mod report;
pub mod runner;
pub mod workload;

pub use config::{load_config, parse_config, ConfigError, HarnessConfig};
pub use connector::{reseed, ConnectError, DatabaseConnector, InMemoryConnector};
pub use graph::{artifact_path, Figure, GraphReporter, Plotter, SvgPlotter};
pub use matrix::{
    ConfigurationEntry, DriverState, EntryOutcome, EntryReport, FailureStage, MatrixError,
    RunReport, TestMatrix, TestMatrixDriver,
};
pub use metrics::{summarize, DurationSample, SampleOutcome, StatisticsSummary, StatsError};
pub use report::{ArtifactError, ReportContext};
pub use runner::{timeit, LoopResult, LoopRunner};
pub use workload::{Fixture, Workload, WorkloadError, WorkloadOutcome};
