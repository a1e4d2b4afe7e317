// Harness configuration loading
//
// Loads the test matrix and the simulated cluster settings from a TOML file,
// or uses the built-in default reproducing the reference matrix.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use txcost_core::{ConcernSet, ReadConcern, ReadPreference, SimulationConfig, WriteConcern};

use crate::matrix::{ConfigurationEntry, MatrixError, TestMatrix};
use crate::workload::{Fixture, Workload};

/// Built-in default configuration (embedded in binary)
const DEFAULT_MATRIX_CONFIG: &str = include_str!("../../../config/matrix.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid matrix entry #{index}: {source}")]
    InvalidEntry {
        index: usize,
        #[source]
        source: MatrixError,
    },

    #[error("invalid test matrix: {0}")]
    Invalid(#[from] MatrixError),
}

/// Workload names accepted in `[[matrix]]` entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Noop,
    Update,
    ReadModifyWrite,
    ReadModifyWriteSession,
    ReadModifyWriteTransaction,
}

/// One `[[matrix]]` entry from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixEntryConfig {
    pub workload: WorkloadKind,

    /// Delay of the `noop` workload
    #[serde(default)]
    pub delay_ms: u64,

    /// Options passed to `startTransaction`; omit for server defaults
    #[serde(default)]
    pub transaction: Option<ConcernSet>,

    pub write: Option<WriteConcern>,
    pub read: Option<ReadConcern>,
    pub preference: Option<ReadPreference>,
}

impl MatrixEntryConfig {
    fn into_entry(self) -> Result<ConfigurationEntry, MatrixError> {
        let workload = match self.workload {
            WorkloadKind::Noop => Workload::Noop {
                delay: Duration::from_millis(self.delay_ms),
            },
            WorkloadKind::Update => Workload::Update,
            WorkloadKind::ReadModifyWrite => Workload::ReadModifyWrite,
            WorkloadKind::ReadModifyWriteSession => Workload::ReadModifyWriteSession,
            WorkloadKind::ReadModifyWriteTransaction => Workload::ReadModifyWriteTransaction {
                options: self.transaction.unwrap_or_default(),
            },
        };
        let concerns = ConcernSet {
            write: self.write,
            read: self.read,
            preference: self.preference,
        };
        ConfigurationEntry::new(workload, concerns)
    }
}

fn default_test_name() -> String {
    "single_threaded".to_string()
}

fn default_iterations() -> u64 {
    100
}

fn default_collection() -> String {
    "hltest".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Root config structure
#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfigFile {
    #[serde(default = "default_test_name")]
    pub test_name: String,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub cluster: SimulationConfig,
    #[serde(default)]
    pub matrix: Vec<MatrixEntryConfig>,
}

/// Parsed configuration with validated matrix entries
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub test_name: String,
    pub iterations: u64,
    pub collection: String,
    pub output_dir: PathBuf,
    pub cluster: SimulationConfig,
    pub entries: Vec<ConfigurationEntry>,
}

impl HarnessConfig {
    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Override the simulation seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.cluster.seed = seed;
        self
    }

    /// Build the test matrix, checking the iteration count
    pub fn matrix(&self) -> Result<TestMatrix, ConfigError> {
        Ok(TestMatrix::new(self.iterations, self.entries.clone())?)
    }

    pub fn fixture(&self) -> Fixture {
        Fixture::canonical(self.collection.clone())
    }
}

/// Load the harness configuration from file or use built-in defaults
///
/// If `config_path` is provided, loads from that file (a missing file is an
/// error). Otherwise uses the built-in default configuration.
pub fn load_config(config_path: Option<&Path>) -> Result<HarnessConfig, ConfigError> {
    let config_str = match config_path {
        Some(path) => {
            info!("Loading harness config from: {}", path.display());
            std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?
        }
        None => {
            info!("No config path specified, using built-in defaults");
            DEFAULT_MATRIX_CONFIG.to_string()
        }
    };

    parse_config(&config_str)
}

/// Parse harness configuration from a TOML string
pub fn parse_config(config_str: &str) -> Result<HarnessConfig, ConfigError> {
    let file: HarnessConfigFile = toml::from_str(config_str)?;

    let entries = file
        .matrix
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            entry
                .into_entry()
                .map_err(|source| ConfigError::InvalidEntry { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        "Loaded {} matrix entries ({} iterations each)",
        entries.len(),
        file.iterations
    );

    let config = HarnessConfig {
        test_name: file.test_name,
        iterations: file.iterations,
        collection: file.collection,
        output_dir: file.output_dir,
        cluster: file.cluster,
        entries,
    };
    config.matrix()?;
    Ok(config)
}
