//! Timer and sequential loop runner
//!
//! Iterations run strictly one after another: each call is awaited to
//! completion before the next one starts, so no two executions overlap.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics::{DurationSample, SampleOutcome};
use crate::workload::{WorkloadError, WorkloadOutcome};

/// Upper bound on the samples reserved before the loop starts
const PREALLOCATED_SAMPLES: u64 = 4096;

/// Await `future` and return its output with the wall-clock time it took
pub async fn timeit<F: Future>(future: F) -> (F::Output, Duration) {
    let start = Instant::now();
    let output = future.await;
    (output, start.elapsed())
}

/// Samples collected by one loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopResult {
    /// One sample per executed iteration, in iteration order
    pub samples: Vec<DurationSample>,
    /// The loop stopped early on a connectivity error
    pub truncated: bool,
    /// Error that stopped the loop
    pub abort_reason: Option<String>,
}

impl LoopResult {
    pub fn violations(&self) -> usize {
        self.samples.iter().filter(|s| s.is_violation()).count()
    }

    pub fn failures(&self) -> usize {
        self.samples.iter().filter(|s| s.is_failure()).count()
    }
}

/// Runs an operation a fixed number of times, timing each call
#[derive(Debug, Clone, Copy)]
pub struct LoopRunner {
    iterations: u64,
}

impl LoopRunner {
    pub fn new(iterations: u64) -> Self {
        Self { iterations }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Execute `operation` `iterations` times
    ///
    /// Failed iterations are recorded with their duration and the loop moves
    /// on; a connectivity error stops the loop and marks the result truncated.
    pub async fn run<F, Fut>(&self, mut operation: F) -> LoopResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<WorkloadOutcome, WorkloadError>>,
    {
        let mut result = LoopResult {
            samples: Vec::with_capacity(self.iterations.min(PREALLOCATED_SAMPLES) as usize),
            ..Default::default()
        };
        let progress_step = (self.iterations / 10).max(1);

        for iteration in 1..=self.iterations {
            let (outcome, elapsed) = timeit(operation()).await;

            match outcome {
                Ok(outcome) => {
                    result
                        .samples
                        .push(DurationSample::new(iteration, elapsed, outcome.into()));
                }
                Err(err) => {
                    warn!(iteration, error = %err, "iteration failed");
                    let connectivity = err.is_connectivity();
                    result.samples.push(DurationSample::new(
                        iteration,
                        elapsed,
                        SampleOutcome::Failed {
                            error: err.to_string(),
                        },
                    ));
                    if connectivity {
                        warn!(
                            iteration,
                            total = self.iterations,
                            "connectivity lost, aborting remaining iterations"
                        );
                        result.truncated = true;
                        result.abort_reason = Some(err.to_string());
                        break;
                    }
                }
            }

            if iteration % progress_step == 0 {
                debug!(
                    "Progress: {}/{} iterations ({} violations, {} failures)",
                    iteration,
                    self.iterations,
                    result.violations(),
                    result.failures()
                );
            }
        }

        result
    }
}
