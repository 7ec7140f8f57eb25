//! Bounded-concurrency admission of virtual users

use fanstorm_core::RampPlan;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Outcome of one admission loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RampReport {
    /// Tasks started, also the next index that would have been handed out
    pub admitted: u64,
    /// Tasks that panicked instead of returning
    pub panicked: u64,
    /// Loop ended because the run was cancelled
    pub cancelled: bool,
}

/// Admits one task per ramp interval, never more than `concurrency` at once
#[derive(Clone, Debug)]
pub struct RampController {
    plan: RampPlan,
}

impl RampController {
    pub fn new(plan: RampPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &RampPlan {
        &self.plan
    }

    /// Admit tasks until `max_users` is reached or `cancel` fires, then
    /// wait for every admitted task to finish.
    ///
    /// `launch` receives indices 0, 1, 2, ... in admission order. Each
    /// returned future runs as its own task and holds its admission slot
    /// until it completes, whatever the outcome.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut launch: F) -> RampReport
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let slots = Arc::new(Semaphore::new(self.plan.concurrency()));
        let mut tasks = JoinSet::new();
        let mut report = RampReport::default();

        info!(
            "Ramping up to {} concurrent users, one every {:?}",
            self.plan.concurrency(),
            self.plan.ramp_interval()
        );

        loop {
            if let Some(max) = self.plan.max_users() {
                if report.admitted >= max {
                    info!("Admitted all {} users", max);
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = sleep(self.plan.ramp_interval()) => {}
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // Only happens if the semaphore is closed
                    Err(_) => break,
                },
            };

            let index = report.admitted;
            debug!("Admitting user {}", index);
            let task = launch(index);
            tasks.spawn(async move {
                let _slot = permit;
                task.await;
            });
            report.admitted += 1;

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!("Virtual user task failed: {}", e);
                    report.panicked += 1;
                }
            }
        }

        if report.cancelled {
            info!("Ramp cancelled after {} users", report.admitted);
        }

        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                error!("Virtual user task failed: {}", e);
                report.panicked += 1;
            }
        }

        report
    }
}
