//! Per-step latency statistics
//!
//! Workflows report timings over a channel; a single collector owns the
//! histograms, so recording never contends with other virtual users.

use crate::error::WorkflowStep;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Upper bound of the latency histograms, 10 minutes in microseconds
const MAX_LATENCY_US: u64 = 600_000_000;

/// One finished platform round trip
#[derive(Clone, Copy, Debug)]
pub struct StepTiming {
    pub step: WorkflowStep,
    pub latency: Duration,
    pub succeeded: bool,
}

/// Cloneable handle workflows use to report step timings
#[derive(Clone, Debug)]
pub struct StepRecorder {
    tx: mpsc::UnboundedSender<StepTiming>,
}

impl StepRecorder {
    pub fn record(&self, step: WorkflowStep, latency: Duration, succeeded: bool) {
        // The collector is gone once the run is shutting down
        let _ = self.tx.send(StepTiming {
            step,
            latency,
            succeeded,
        });
    }
}

/// Receiving side, turned into a [`StepReport`] once every recorder is dropped
#[derive(Debug)]
pub struct StepMetrics {
    rx: mpsc::UnboundedReceiver<StepTiming>,
}

pub fn step_metrics() -> (StepRecorder, StepMetrics) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StepRecorder { tx }, StepMetrics { rx })
}

struct StepStats {
    succeeded: u64,
    failed: u64,
    latency_us: Histogram<u64>,
}

impl StepMetrics {
    /// Drain timings until every [`StepRecorder`] has been dropped
    pub async fn collect(mut self) -> StepReport {
        let mut steps: BTreeMap<WorkflowStep, StepStats> = BTreeMap::new();

        while let Some(timing) = self.rx.recv().await {
            let stats = match steps.entry(timing.step) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => match Histogram::new_with_bounds(1, MAX_LATENCY_US, 3) {
                    Ok(latency_us) => e.insert(StepStats {
                        succeeded: 0,
                        failed: 0,
                        latency_us,
                    }),
                    Err(err) => {
                        warn!("Failed to create latency histogram: {}", err);
                        continue;
                    }
                },
            };

            if timing.succeeded {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            stats
                .latency_us
                .saturating_record(timing.latency.as_micros().min(MAX_LATENCY_US as u128) as u64);
        }

        StepReport {
            steps: steps
                .into_iter()
                .map(|(step, stats)| StepSummary {
                    step: step.name(),
                    succeeded: stats.succeeded,
                    failed: stats.failed,
                    latency_p50_us: stats.latency_us.value_at_quantile(0.50),
                    latency_p90_us: stats.latency_us.value_at_quantile(0.90),
                    latency_p99_us: stats.latency_us.value_at_quantile(0.99),
                    latency_max_us: stats.latency_us.max(),
                    latency_mean_us: stats.latency_us.mean() as u64,
                })
                .collect(),
        }
    }
}

/// Totals and latency percentiles for one step
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepSummary {
    pub step: &'static str,
    pub succeeded: u64,
    pub failed: u64,
    pub latency_p50_us: u64,
    pub latency_p90_us: u64,
    pub latency_p99_us: u64,
    pub latency_max_us: u64,
    pub latency_mean_us: u64,
}

/// Step statistics in workflow order
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StepReport {
    pub steps: Vec<StepSummary>,
}

impl StepReport {
    pub fn step(&self, step: WorkflowStep) -> Option<&StepSummary> {
        self.steps.iter().find(|s| s.step == step.name())
    }

    /// Workflows that made it all the way to playback
    pub fn completed_workflows(&self) -> u64 {
        self.step(WorkflowStep::ResolveEdge).map_or(0, |s| s.succeeded)
    }

    /// A workflow stops at its first failed step, so failures add up per workflow
    pub fn failed_workflows(&self) -> u64 {
        self.steps.iter().map(|s| s.failed).sum()
    }

    /// Print formatted report to stderr
    pub fn print_report(&self) {
        eprintln!("╠══════════════════════════════════════════════════════════════╣");
        eprintln!("║ WORKFLOW STEPS (latency in milliseconds)                     ║");
        eprintln!("║   step            ok    failed     p50     p90     p99   max ║");
        for s in &self.steps {
            eprintln!(
                "║   {:<12} {:>6} {:>9} {:>7} {:>7} {:>7} {:>5} ║",
                s.step,
                s.succeeded,
                s.failed,
                s.latency_p50_us / 1000,
                s.latency_p90_us / 1000,
                s.latency_p99_us / 1000,
                s.latency_max_us / 1000,
            );
        }
    }
}
