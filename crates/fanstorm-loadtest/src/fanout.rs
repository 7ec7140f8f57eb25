//! Splitting a run across remote worker nodes
//!
//! Each node runs `fanstorm fan` over ssh with its share of the ramp plan.
//! Its stdout is the same CSV the local aggregator writes, so every line
//! is parsed back into a sample and merged into the local result stream.

use crate::aggregator::parse_sample_line;
use crate::error::{RemoteError, RemoteResult, RunError, RunResult};
use async_trait::async_trait;
use fanstorm_core::{ConfigError, FleetConfig, NodeFailurePolicy, RampPlan, RemoteNode};
use fanstorm_media::SampleSender;
use futures::future::join_all;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// ASSIGNMENTS
// ============================================================================

/// One node's share of the run
#[derive(Clone, Debug, PartialEq)]
pub struct NodeAssignment {
    pub node: RemoteNode,
    pub plan: RampPlan,
    pub existing_offset: u64,
}

/// Split `plan` evenly across `nodes`.
///
/// Node `i` starts its existing-account pool at
/// `existing_offset + i * 2 * concurrency`, so pools never overlap.
pub fn assign_nodes(
    nodes: &[RemoteNode],
    plan: &RampPlan,
    existing_offset: u64,
) -> Result<Vec<NodeAssignment>, ConfigError> {
    let share = plan.node_share(nodes.len())?;
    let spacing = 2 * plan.concurrency() as u64;

    Ok(nodes
        .iter()
        .enumerate()
        .map(|(i, node)| NodeAssignment {
            node: node.clone(),
            plan: share,
            existing_offset: existing_offset + i as u64 * spacing,
        })
        .collect())
}

/// Flags shared by every node's `fan` invocation
#[derive(Clone, Debug)]
pub struct FanCommand {
    pub remote_binary: String,
    pub influencer_id: u64,
    pub percent_new: u8,
    pub precreate: bool,
}

impl FanCommand {
    /// Shell command line for one node
    pub fn render(&self, assignment: &NodeAssignment) -> String {
        let plan = &assignment.plan;
        // One shell word, e.g. "1s500ms"
        let ramp = humantime::format_duration(plan.ramp_interval())
            .to_string()
            .replace(' ', "");
        let mut command = format!(
            "{} fan --users {} --ramp {} --existingoffset {} --percentnew {} --influencerid {}",
            self.remote_binary,
            plan.concurrency(),
            ramp,
            assignment.existing_offset,
            self.percent_new,
            self.influencer_id,
        );
        if let Some(max_users) = plan.max_users() {
            command.push_str(&format!(" --maxusers {}", max_users));
        }
        if self.precreate {
            command.push_str(" --precreatefans");
        }
        command
    }
}

// ============================================================================
// REMOTE SHELL
// ============================================================================

/// How commands reach a worker node
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Check the node accepts a session
    async fn probe(&self, node: &RemoteNode) -> RemoteResult<()>;

    /// Run `command` on `node`, forwarding each CSV sample it prints,
    /// until it exits or `cancel` fires. Cancelling must also end the
    /// remote process.
    async fn execute(
        &self,
        node: &RemoteNode,
        command: &str,
        samples: SampleSender,
        cancel: CancellationToken,
    ) -> RemoteResult<()>;
}

/// Remote shell through the system `ssh` client
#[derive(Clone, Debug)]
pub struct SshShell {
    binary: PathBuf,
}

impl SshShell {
    pub fn new(config: &FleetConfig) -> Self {
        Self {
            binary: PathBuf::from(&config.ssh_binary),
        }
    }

    /// `tty` forces a remote pseudo-terminal, so the remote process gets
    /// SIGHUP once the local client is gone.
    fn command(&self, node: &RemoteNode, remote: &str, tty: bool) -> Command {
        let mut command = Command::new(&self.binary);
        if tty {
            command.arg("-tt");
        }
        if let Some(key_file) = &node.credentials.key_file {
            command.arg("-i").arg(key_file);
        }
        command
            .args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"])
            .arg(&node.address)
            .arg(remote)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, source: std::io::Error) -> RemoteError {
        RemoteError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn probe(&self, node: &RemoteNode) -> RemoteResult<()> {
        let output = self
            .command(node, "true", false)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| self.spawn_error(source))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::Refused(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn execute(
        &self,
        node: &RemoteNode,
        command: &str,
        samples: SampleSender,
        cancel: CancellationToken,
    ) -> RemoteResult<()> {
        // The tty merges remote logs into stdout; they are logged below
        let mut child = self
            .command(node, command, true)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| self.spawn_error(source))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RemoteError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "ssh stdout not captured",
            ))
        })?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Closing session to {}", node);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to close session to {}: {}", node, e);
                    }
                    return Ok(());
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parse_sample_line(&line) {
                        Some(sample) => {
                            if samples.send(sample).is_err() {
                                return Ok(());
                            }
                        }
                        None => info!("{}: {}", node, line),
                    },
                    Ok(None) => break,
                    Err(e) => return Err(e.into()),
                },
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(RemoteError::Exited(status.to_string()))
        }
    }
}


// ============================================================================
// COORDINATOR
// ============================================================================

/// What happened across the fleet
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FanoutReport {
    pub assignments: Vec<NodeAssignment>,
    /// Nodes dropped before launch, with the reason
    pub unreachable: Vec<(String, String)>,
    /// Nodes whose remote run ended in an error
    pub failed: Vec<(String, String)>,
    /// Users lost to integer division of the concurrency
    pub undistributed: usize,
}

/// Connects to every worker and launches its share of the run
pub struct FanoutCoordinator {
    shell: Arc<dyn RemoteShell>,
    nodes: Vec<RemoteNode>,
    policy: NodeFailurePolicy,
}

impl FanoutCoordinator {
    pub fn new(shell: Arc<dyn RemoteShell>, nodes: Vec<RemoteNode>, policy: NodeFailurePolicy) -> Self {
        Self {
            shell,
            nodes,
            policy,
        }
    }

    /// With no nodes the run stays in-process
    pub fn is_distributed(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// Probe every node, applying the failure policy
    pub async fn connect(&self) -> RunResult<(Vec<RemoteNode>, Vec<(String, String)>)> {
        let probes = join_all(self.nodes.iter().map(|node| self.shell.probe(node))).await;

        let mut reachable = Vec::new();
        let mut unreachable = Vec::new();
        for (node, probe) in self.nodes.iter().zip(probes) {
            match probe {
                Ok(()) => {
                    info!("Connected to {}", node);
                    reachable.push(node.clone());
                }
                Err(source) => {
                    if self.policy == NodeFailurePolicy::Abort {
                        error!("Cannot reach {}: {}", node, source);
                        return Err(RunError::NodeUnreachable {
                            node: node.address.clone(),
                            source,
                        });
                    }
                    warn!("Dropping unreachable node {}: {}", node, source);
                    unreachable.push((node.address.clone(), source.to_string()));
                }
            }
        }

        if reachable.is_empty() {
            return Err(RunError::NoReachableNodes);
        }
        Ok((reachable, unreachable))
    }

    /// Run every node's share and wait for all of them to end
    pub async fn run(
        &self,
        plan: &RampPlan,
        existing_offset: u64,
        command: &FanCommand,
        samples: SampleSender,
        cancel: CancellationToken,
    ) -> RunResult<FanoutReport> {
        let (reachable, unreachable) = self.connect().await?;
        let assignments = assign_nodes(&reachable, plan, existing_offset)?;

        let undistributed = plan.undistributed(reachable.len());
        if undistributed > 0 {
            warn!(
                "{} users do not divide evenly across {} nodes and will not run",
                undistributed,
                reachable.len()
            );
        }

        let mut sessions = JoinSet::new();
        for assignment in &assignments {
            let shell = self.shell.clone();
            let node = assignment.node.clone();
            let remote = command.render(assignment);
            let samples = samples.clone();
            let cancel = cancel.clone();

            info!("Launching on {}: {}", node, remote);
            sessions.spawn(async move {
                let result = shell.execute(&node, &remote, samples, cancel).await;
                (node, result)
            });
        }
        drop(samples);

        let mut report = FanoutReport {
            assignments,
            unreachable,
            failed: Vec::new(),
            undistributed,
        };
        while let Some(finished) = sessions.join_next().await {
            match finished {
                Ok((node, Ok(()))) => info!("Node {} finished", node),
                Ok((node, Err(e))) => {
                    error!("Node {} failed: {}", node, e);
                    report.failed.push((node.address, e.to_string()));
                }
                Err(e) => error!("Node session task failed: {}", e),
            }
        }
        Ok(report)
    }
}
