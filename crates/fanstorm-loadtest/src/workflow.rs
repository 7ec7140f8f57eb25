//! One simulated viewer's walk through the platform

use crate::error::{WorkflowError, WorkflowState, WorkflowStep};
use crate::identity::IdentityGenerator;
use crate::stats::StepRecorder;
use fanstorm_client::{ClientResult, FanAccount, StreamPlatform};
use fanstorm_core::VirtualUserIdentity;
use fanstorm_media::{PlaybackObserver, SampleSender};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Sign-ups in flight while pre-creating the account pool
const PRECREATE_CONCURRENCY: usize = 16;

/// The stream every virtual user watches
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastTarget {
    pub influencer_id: u64,
    /// Stream name on the media server, the influencer's username
    pub stream_name: String,
}

/// Everything a workflow needs, shared read-only by all virtual users
pub struct WorkflowContext {
    pub platform: Arc<dyn StreamPlatform>,
    pub observer: Arc<dyn PlaybackObserver>,
    pub target: BroadcastTarget,
    pub password: String,
    pub samples: SampleSender,
    pub steps: StepRecorder,
    /// Playback tasks, so the run can wait for them after the ramp ends
    pub playbacks: TaskTracker,
    pub cancel: CancellationToken,
    /// Keep the ramp slot until playback finishes
    pub hold_slot_during_playback: bool,
}

/// A virtual user and the state it has reached
pub struct VirtualUser {
    identity: VirtualUserIdentity,
    state: WorkflowState,
    started: Instant,
}

impl VirtualUser {
    pub fn new(identity: VirtualUserIdentity) -> Self {
        Self {
            identity,
            state: WorkflowState::NotAuthenticated,
            started: Instant::now(),
        }
    }

    pub fn identity(&self) -> &VirtualUserIdentity {
        &self.identity
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    fn advance(&mut self, next: WorkflowState) {
        debug!("{}: {:?} -> {:?}", self.identity, self.state, next);
        self.state = next;
    }

    /// Run one platform call, timing it and stopping early on cancel
    async fn step<T, F>(&self, ctx: &WorkflowContext, step: WorkflowStep, call: F) -> Result<T, WorkflowError>
    where
        F: Future<Output = ClientResult<T>>,
    {
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(WorkflowError::Cancelled(self.state)),
            result = call => result,
        };
        ctx.steps.record(step, start.elapsed(), result.is_ok());

        result.map_err(|source| WorkflowError::Step {
            step,
            state: self.state,
            source,
        })
    }

    async fn authenticate(&mut self, ctx: &WorkflowContext) -> Result<FanAccount, WorkflowError> {
        let email = self.identity.email();

        let account = match self
            .step(ctx, WorkflowStep::SignIn, ctx.platform.sign_in(&email, &ctx.password))
            .await?
        {
            Some(account) => {
                info!("{} signed in", self.identity);
                account
            }
            None => {
                let account = self
                    .step(
                        ctx,
                        WorkflowStep::SignUp,
                        ctx.platform
                            .sign_up(&email, &self.identity.display_name, &ctx.password),
                    )
                    .await?;
                info!("{} signed up", self.identity);
                account
            }
        };

        self.advance(WorkflowState::Authenticated);
        Ok(account)
    }

    /// Walk sign-in, follow, join and leave, then start playback.
    ///
    /// Returns the playback task, which outlives the workflow.
    pub async fn run(&mut self, ctx: &WorkflowContext) -> Result<JoinHandle<()>, WorkflowError> {
        let target = &ctx.target;
        let account = self.authenticate(ctx).await?;

        self.step(
            ctx,
            WorkflowStep::Follow,
            ctx.platform.follow_influencer(&account, target.influencer_id),
        )
        .await?;
        self.advance(WorkflowState::Following);

        let joined = self
            .step(
                ctx,
                WorkflowStep::Join,
                ctx.platform.join_stream(target.influencer_id, account.id),
            )
            .await?;
        self.advance(WorkflowState::InStream);

        self.step(
            ctx,
            WorkflowStep::Leave,
            ctx.platform.leave_stream(target.influencer_id, account.id),
        )
        .await?;
        self.advance(WorkflowState::Left);

        let edge_url = self
            .step(
                ctx,
                WorkflowStep::ResolveEdge,
                ctx.platform.edge_url(&joined.origin_ip, &target.stream_name),
            )
            .await?;

        Ok(self.start_playback(ctx, edge_url))
    }

    fn start_playback(&self, ctx: &WorkflowContext, edge_url: String) -> JoinHandle<()> {
        let observer = ctx.observer.clone();
        let subject = self.identity.display_name.clone();
        let samples = ctx.samples.clone();
        let cancel = ctx.cancel.clone();
        let started = self.started;

        ctx.playbacks.spawn(async move {
            if let Err(e) = observer
                .observe(subject.clone(), edge_url, started, samples, cancel)
                .await
            {
                warn!("Playback for {} failed: {}", subject, e);
            }
        })
    }
}

/// Run one virtual user to completion, logging instead of returning errors.
///
/// Returns true if the user reached playback.
pub async fn run_virtual_user(identity: VirtualUserIdentity, ctx: Arc<WorkflowContext>) -> bool {
    let mut user = VirtualUser::new(identity);

    match user.run(&ctx).await {
        Ok(playback) => {
            if ctx.hold_slot_during_playback {
                if let Err(e) = playback.await {
                    warn!("Playback task for {} failed: {}", user.identity(), e);
                }
            }
            true
        }
        Err(WorkflowError::Cancelled(state)) => {
            debug!("{} cancelled in state {:?}", user.identity(), state);
            false
        }
        Err(e) => {
            warn!("{} aborted: {}", user.identity(), e);
            false
        }
    }
}

/// Sign up `identity` unless it can already sign in. True if it was created.
async fn ensure_account(
    platform: &dyn StreamPlatform,
    identity: &VirtualUserIdentity,
    password: &str,
) -> ClientResult<bool> {
    let email = identity.email();
    if platform.sign_in(&email, password).await?.is_some() {
        return Ok(false);
    }
    platform
        .sign_up(&email, &identity.display_name, password)
        .await?;
    Ok(true)
}

/// Result of pre-creating the existing account pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrecreateReport {
    pub existing: u64,
    pub created: u64,
    pub failed: u64,
}

/// Make sure the first `count` existing accounts exist before ramping.
///
/// Failures are logged and skipped.
pub async fn precreate_fans(
    platform: &dyn StreamPlatform,
    generator: &IdentityGenerator,
    count: u64,
    password: &str,
) -> PrecreateReport {
    info!("Pre-creating {} fan accounts", count);

    let outcomes: Vec<ClientResult<bool>> = stream::iter(generator.existing_pool(count))
        .map(|identity| async move { ensure_account(platform, &identity, password).await })
        .buffer_unordered(PRECREATE_CONCURRENCY)
        .collect()
        .await;

    let mut report = PrecreateReport::default();
    for outcome in outcomes {
        match outcome {
            Ok(true) => report.created += 1,
            Ok(false) => report.existing += 1,
            Err(e) => {
                warn!("Failed to pre-create fan account: {}", e);
                report.failed += 1;
            }
        }
    }

    info!(
        "Pre-created {} accounts ({} already existed, {} failed)",
        report.created, report.existing, report.failed
    );
    report
}
