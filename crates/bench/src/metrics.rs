//! Duration samples and descriptive statistics
//!
//! Percentiles are on a 0-100 scale and interpolate linearly between the two
//! nearest order statistics (`rank = p / 100 * (n - 1)`).

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::workload::WorkloadOutcome;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    #[error("cannot summarize an empty sample sequence")]
    Empty,
}

/// How a measured iteration ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SampleOutcome {
    Ok,
    Violation { expected: i64, observed: i64 },
    Failed { error: String },
}

impl From<WorkloadOutcome> for SampleOutcome {
    fn from(outcome: WorkloadOutcome) -> Self {
        match outcome {
            WorkloadOutcome::Completed => Self::Ok,
            WorkloadOutcome::Violation { expected, observed } => {
                Self::Violation { expected, observed }
            }
        }
    }
}

/// One timed workload execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationSample {
    /// 1-based iteration number
    pub iteration: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub outcome: SampleOutcome,
}

/// Serialize a [`Duration`] as fractional milliseconds
pub(crate) fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

impl DurationSample {
    pub fn new(iteration: u64, elapsed: Duration, outcome: SampleOutcome) -> Self {
        Self {
            iteration,
            elapsed,
            outcome,
        }
    }

    /// Elapsed time in milliseconds
    pub fn millis(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }

    pub fn is_violation(&self) -> bool {
        matches!(self.outcome, SampleOutcome::Violation { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, SampleOutcome::Failed { .. })
    }
}

/// Descriptive statistics of one configuration run, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSummary {
    pub count: usize,
    pub mean: f64,
    /// Population variance (ms²)
    pub variance: f64,
    pub variance_to_mean: f64,
    /// (max - min) / median
    pub range_to_median: f64,
    pub min: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub p98: f64,
    pub p99: f64,
    pub max: f64,
}

impl StatisticsSummary {
    /// Summarize timed samples
    pub fn from_samples(samples: &[DurationSample]) -> Result<Self, StatsError> {
        let millis: Vec<f64> = samples.iter().map(DurationSample::millis).collect();
        summarize(&millis)
    }
}

/// Summarize a sequence of latencies (milliseconds)
pub fn summarize(values: &[f64]) -> Result<StatisticsSummary, StatsError> {
    if values.is_empty() {
        return Err(StatsError::Empty);
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let count = sorted.len();
    let mean = sorted.iter().sum::<f64>() / count as f64;
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    let min = sorted[0];
    let max = sorted[count - 1];
    let median = percentile(&sorted, 50.0);

    Ok(StatisticsSummary {
        count,
        mean,
        variance,
        variance_to_mean: ratio(variance, mean),
        range_to_median: ratio(max - min, median),
        min,
        median,
        p90: percentile(&sorted, 90.0),
        p95: percentile(&sorted, 95.0),
        p98: percentile(&sorted, 98.0),
        p99: percentile(&sorted, 99.0),
        max,
    })
}

/// Percentile `p` (0-100) of ascending `sorted` values, linearly interpolated
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        if numerator == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        numerator / denominator
    }
}
