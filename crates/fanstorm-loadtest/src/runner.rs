//! Test run orchestration
//!
//! A [`TestRun`] is the aggregate root of one experiment: it provisions
//! the broadcast, starts the ingest, ramps virtual users locally or across
//! the fleet, and owns the single result stream.

use crate::aggregator::{AggregateReport, ResultAggregator, SampleSink};
use crate::broadcast::BroadcastProvisioner;
use crate::error::RunResult;
use crate::fanout::{FanCommand, FanoutCoordinator, FanoutReport};
use crate::identity::IdentityGenerator;
use crate::ramp::{RampController, RampReport};
use crate::stats::{step_metrics, StepReport};
use crate::workflow::{precreate_fans, run_virtual_user, BroadcastTarget, PrecreateReport, WorkflowContext};
use fanstorm_client::{BroadcastOwner, StreamPlatform};
use fanstorm_core::{BroadcastSession, ConfigError, RunConfig};
use fanstorm_media::{PlaybackObserver, SampleSender, StreamIngest};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

// ============================================================================
// REPORT
// ============================================================================

/// Everything a finished run measured
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub broadcast: Option<BroadcastSession>,
    pub ramp: RampReport,
    pub precreated: Option<PrecreateReport>,
    pub fanout: Option<FanoutReport>,
    pub steps: StepReport,
    pub results: AggregateReport,
    pub duration_secs: f64,
}

impl RunReport {
    /// Print formatted report to stderr; stdout carries the samples
    pub fn print_report(&self) {
        eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
        eprintln!("║                 FANSTORM LOAD TEST RESULTS                   ║");
        eprintln!("╠══════════════════════════════════════════════════════════════╣");
        if let Some(broadcast) = &self.broadcast {
            eprintln!("║ Broadcast:         {:<42}║", broadcast.display_name);
        }
        eprintln!("║ Duration:          {:>10.2} seconds                        ║", self.duration_secs);
        eprintln!("║ Users admitted:    {:>10}                                 ║", self.ramp.admitted);
        eprintln!(
            "║ Reached playback:  {:>10}                                 ║",
            self.steps.completed_workflows()
        );
        eprintln!(
            "║ Aborted:           {:>10}                                 ║",
            self.steps.failed_workflows()
        );
        if let Some(fanout) = &self.fanout {
            eprintln!(
                "║ Worker nodes:      {:>10}                                 ║",
                fanout.assignments.len()
            );
            for (node, reason) in fanout.unreachable.iter().chain(&fanout.failed) {
                eprintln!("║   {} failed: {}", node, reason);
            }
        }
        eprintln!("║ Samples written:   {:>10}                                 ║", self.results.written);
        eprintln!(
            "║ Write errors:      {:>10}                                 ║",
            self.results.write_errors
        );
        eprintln!(
            "║ Viewers:           {:>10}                                 ║",
            self.results.playback.subject_count()
        );
        eprintln!(
            "║ Lagged viewers:    {:>10}                                 ║",
            self.results.playback.lagged_count()
        );
        eprintln!(
            "║ Avg bitrate:       {:>10.1} kbit/s                         ║",
            self.results.playback.average_bitrate_kbits()
        );
        if !self.steps.steps.is_empty() {
            self.steps.print_report();
        }
        eprintln!("╚══════════════════════════════════════════════════════════════╝");
    }
}

// ============================================================================
// TEST RUN
// ============================================================================

/// One load test run
pub struct TestRun {
    config: RunConfig,
    platform: Arc<dyn StreamPlatform>,
    observer: Arc<dyn PlaybackObserver>,
    owner: Option<Arc<dyn BroadcastOwner>>,
    ingest: Option<Arc<dyn StreamIngest>>,
    fleet: Option<FanoutCoordinator>,
    cancel: CancellationToken,
}

impl TestRun {
    pub fn new(
        config: RunConfig,
        platform: Arc<dyn StreamPlatform>,
        observer: Arc<dyn PlaybackObserver>,
    ) -> Self {
        Self {
            config,
            platform,
            observer,
            owner: None,
            ingest: None,
            fleet: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Needed to provision and feed the broadcast in a full run
    pub fn with_broadcast(mut self, owner: Arc<dyn BroadcastOwner>, ingest: Arc<dyn StreamIngest>) -> Self {
        self.owner = Some(owner);
        self.ingest = Some(ingest);
        self
    }

    /// Workers to spread virtual users over; none keeps the run local
    pub fn with_fleet(mut self, fleet: FanoutCoordinator) -> Self {
        self.fleet = Some(fleet);
        self
    }

    /// Token that stops the whole run when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Full experiment: provision and push the broadcast, then ramp viewers
    pub async fn run_test<S>(&self, sink: S) -> RunResult<RunReport>
    where
        S: SampleSink + 'static,
    {
        self.config.validate()?;
        let (owner, ingest) = match (&self.owner, &self.ingest) {
            (Some(owner), Some(ingest)) => (owner.clone(), ingest.clone()),
            _ => {
                return Err(ConfigError::Invalid(
                    "a full run needs a broadcast owner and an ingest".to_string(),
                )
                .into())
            }
        };
        let plan = self.config.ramp_plan()?;
        let started = Instant::now();

        let broadcast = BroadcastProvisioner::new(owner.as_ref(), &self.config.broadcast)
            .provision(
                &self.config.owner.email,
                &self.config.owner.oauth_token,
                &self.cancel,
            )
            .await?;
        let session = broadcast.session;

        // Stopped once the viewers are done, or with the run
        let ingest_stop = self.cancel.child_token();
        let origin_url = owner.origin_url(&session.origin_host, &session.display_name);
        let ingest_task = {
            let stop = ingest_stop.clone();
            tokio::spawn(async move {
                if let Err(e) = ingest.push(&origin_url, stop).await {
                    error!("Broadcast ingest failed: {}", e);
                }
            })
        };

        info!("Letting the encoder warm up for {:?}", self.config.broadcast.push_warmup);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep(self.config.broadcast.push_warmup) => {}
        }

        let target = BroadcastTarget {
            influencer_id: session.session_id,
            stream_name: session.display_name.clone(),
        };

        let aggregator = ResultAggregator::new();
        let samples = aggregator.sender();
        let results = tokio::spawn(drain_into(aggregator, sink));

        let mut report = RunReport {
            broadcast: Some(session),
            ..Default::default()
        };

        let fanned_out = match &self.fleet {
            Some(fleet) if fleet.is_distributed() => {
                let command = FanCommand {
                    remote_binary: self.config.fleet.remote_binary.clone(),
                    influencer_id: target.influencer_id,
                    percent_new: self.config.identity.percent_new,
                    precreate: self.config.identity.precreate,
                };
                fleet
                    .run(
                        &plan,
                        self.config.identity.existing_offset,
                        &command,
                        samples,
                        self.cancel.clone(),
                    )
                    .await
                    .map(Some)
            }
            _ => self
                .drive_local(target, samples, &mut report)
                .await
                .map(|()| None),
        };

        ingest_stop.cancel();
        if let Err(e) = ingest_task.await {
            warn!("Ingest task failed: {}", e);
        }
        report.results = join_results(results).await;
        report.fanout = fanned_out?;
        report.duration_secs = started.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Fan side only, against an existing broadcast. This is what worker
    /// nodes run.
    pub async fn run_fans<S>(&self, sink: S) -> RunResult<RunReport>
    where
        S: SampleSink + 'static,
    {
        let influencer_id = self.config.validate_fan_only()?;
        let started = Instant::now();

        let profile = self.platform.influencer_profile(influencer_id).await?;
        info!("Watching {} ({})", profile.username, profile.id);
        let target = BroadcastTarget {
            influencer_id,
            stream_name: profile.username,
        };

        // Worker nodes lose their reader when the coordinator goes away
        let aggregator = ResultAggregator::new().stop_on_closed_output(self.cancel.clone());
        let samples = aggregator.sender();
        let results = tokio::spawn(drain_into(aggregator, sink));

        let mut report = RunReport::default();
        let driven = self.drive_local(target, samples, &mut report).await;

        report.results = join_results(results).await;
        driven?;
        report.duration_secs = started.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Ramp virtual users in this process until the ramp ends and every
    /// playback has finished
    async fn drive_local(
        &self,
        target: BroadcastTarget,
        samples: SampleSender,
        report: &mut RunReport,
    ) -> RunResult<()> {
        let plan = self.config.ramp_plan()?;
        let generator = IdentityGenerator::from_config(&self.config.identity);

        if self.config.identity.precreate {
            let pool = plan.max_users().unwrap_or(plan.concurrency() as u64);
            report.precreated = Some(
                precreate_fans(
                    self.platform.as_ref(),
                    &generator,
                    pool,
                    &self.config.platform.fan_password,
                )
                .await,
            );
        }

        let (steps, metrics) = step_metrics();
        let step_report = tokio::spawn(metrics.collect());

        let ctx = Arc::new(WorkflowContext {
            platform: self.platform.clone(),
            observer: self.observer.clone(),
            target,
            password: self.config.platform.fan_password.clone(),
            samples,
            steps,
            playbacks: TaskTracker::new(),
            cancel: self.cancel.clone(),
            hold_slot_during_playback: self.config.ramp.hold_slot_during_playback,
        });

        report.ramp = RampController::new(plan)
            .run(&self.cancel, |index| {
                let identity = generator.next(index);
                let ctx = ctx.clone();
                async move {
                    run_virtual_user(identity, ctx).await;
                }
            })
            .await;

        ctx.playbacks.close();
        ctx.playbacks.wait().await;
        drop(ctx);

        report.steps = match step_report.await {
            Ok(steps) => steps,
            Err(e) => {
                warn!("Step statistics task failed: {}", e);
                StepReport::default()
            }
        };
        Ok(())
    }
}

async fn drain_into<S: SampleSink>(aggregator: ResultAggregator, mut sink: S) -> AggregateReport {
    aggregator.drain(&mut sink).await
}

async fn join_results(results: tokio::task::JoinHandle<AggregateReport>) -> AggregateReport {
    match results.await {
        Ok(report) => {
            report.playback.log_summary();
            report
        }
        Err(e) => {
            error!("Result aggregator failed: {}", e);
            AggregateReport::default()
        }
    }
}
