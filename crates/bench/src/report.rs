//! Textual statistics report and the JSON run summary

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use txcost_core::ServerInfo;

use crate::matrix::ConfigurationEntry;
use crate::metrics::StatisticsSummary;
use crate::runner::LoopResult;

/// Raw timings are printed only for runs up to this many iterations
pub const RAW_TIMINGS_LIMIT: usize = 100;

/// Errors writing a report artifact
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to write artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to render artifact: {0}")]
    Render(#[from] minijinja::Error),

    #[error("failed to serialize artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Run-wide details shown next to each entry's statistics
#[derive(Debug, Clone, Serialize)]
pub struct ReportContext {
    pub test_name: String,
    pub server: ServerInfo,
    pub iterations: u64,
}

/// Render the statistics block of one configuration run
pub fn render(
    summary: &StatisticsSummary,
    entry: &ConfigurationEntry,
    result: &LoopResult,
    context: &ReportContext,
) -> String {
    let mut out = header(entry, context);

    let _ = writeln!(
        out,
        "iterations: {}/{} (violations: {}, failures: {})",
        summary.count,
        context.iterations,
        result.violations(),
        result.failures()
    );
    if result.truncated {
        let _ = writeln!(
            out,
            "truncated: {}",
            result.abort_reason.as_deref().unwrap_or("unknown error")
        );
    }

    let rows = [
        ("average", summary.mean),
        ("variance", summary.variance),
        ("variance/mean", summary.variance_to_mean),
        ("(max-min)/median", summary.range_to_median),
        ("min", summary.min),
        ("median", summary.median),
        ("90%", summary.p90),
        ("95%", summary.p95),
        ("98%", summary.p98),
        ("99%", summary.p99),
        ("max", summary.max),
    ];
    for (label, value) in rows {
        let _ = writeln!(out, "  {:<18} {:>12.3}", label, value);
    }

    if result.samples.len() <= RAW_TIMINGS_LIMIT {
        let timings: Vec<String> = result
            .samples
            .iter()
            .map(|s| format!("{:.3}", s.millis()))
            .collect();
        let _ = writeln!(out, "timings (ms): {}", timings.join(", "));
    }

    out
}

/// Render the error section of an entry that could not be measured
pub fn render_failure(
    entry: &ConfigurationEntry,
    stage: &str,
    error: &str,
    context: &ReportContext,
) -> String {
    let mut out = header(entry, context);
    let _ = writeln!(out, "FAILED while {}: {}", stage, error);
    out
}

fn header(entry: &ConfigurationEntry, context: &ReportContext) -> String {
    format!(
        "=== {} | {} | server {} ({}) ===\n",
        context.test_name,
        entry.description(),
        context.server.version,
        context.server.storage_engine
    )
}

/// Write `summary` as `summary-<timestamp>.json` under `dir`
pub fn write_run_summary<T: Serialize>(
    dir: &Path,
    timestamp: &str,
    summary: &T,
) -> Result<PathBuf, ArtifactError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("summary-{}.json", timestamp));
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(&path, json)?;
    Ok(path)
}
