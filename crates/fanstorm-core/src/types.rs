//! Shared data model for a viewer load test run

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// RAMP PLAN
// ============================================================================

/// Admission plan for virtual users.
///
/// `concurrency` bounds how many workflows are in flight at once,
/// `ramp_interval` bounds how fast new ones are admitted. An optional
/// `max_users` turns the otherwise endless admission loop into a bounded
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RampPlan {
    concurrency: usize,
    ramp_interval: Duration,
    max_users: Option<u64>,
}

impl RampPlan {
    /// Create a plan, rejecting a zero concurrency
    pub fn new(concurrency: usize, ramp_interval: Duration) -> Result<Self, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            concurrency,
            ramp_interval,
            max_users: None,
        })
    }

    /// Stop admitting after `max_users` virtual users
    pub fn with_max_users(mut self, max_users: Option<u64>) -> Self {
        self.max_users = max_users;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn ramp_interval(&self) -> Duration {
        self.ramp_interval
    }

    pub fn max_users(&self) -> Option<u64> {
        self.max_users
    }

    /// Per-node plan when the run is split across `node_count` workers.
    ///
    /// Concurrency is divided with integer division and the remainder is
    /// dropped. The ramp interval is multiplied so the fleet-wide admission
    /// rate stays the same as a single node running the full plan.
    pub fn node_share(&self, node_count: usize) -> Result<Self, ConfigError> {
        if node_count == 0 {
            return Err(ConfigError::Invalid("node count must be greater than zero".to_string()));
        }
        let concurrency = self.concurrency / node_count;
        if concurrency == 0 {
            return Err(ConfigError::EmptyNodeShare {
                concurrency: self.concurrency,
                nodes: node_count,
            });
        }
        let ramp_interval = u32::try_from(node_count)
            .ok()
            .and_then(|n| self.ramp_interval.checked_mul(n))
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "ramp interval {:?} across {} nodes is out of range",
                    self.ramp_interval, node_count
                ))
            })?;
        Ok(Self {
            concurrency,
            ramp_interval,
            max_users: self.max_users.map(|m| m / node_count as u64),
        })
    }

    /// Users lost to integer division when splitting across `node_count` nodes
    pub fn undistributed(&self, node_count: usize) -> usize {
        if node_count == 0 {
            return self.concurrency;
        }
        self.concurrency % node_count
    }
}

// ============================================================================
// VIRTUAL USERS
// ============================================================================

/// One simulated viewer's identity, fixed for the lifetime of its workflow
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualUserIdentity {
    /// Admission index assigned by the ramp controller
    pub sequence_index: u64,
    /// True when the account has never been seen by the platform
    pub is_new_user: bool,
    /// Username on the platform, also the subject of its progress samples
    pub display_name: String,
}

impl VirtualUserIdentity {
    /// Email address used for the platform account
    pub fn email(&self) -> String {
        format!("{}@e.com", self.display_name)
    }
}

impl fmt::Display for VirtualUserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name)
    }
}

// ============================================================================
// BROADCAST
// ============================================================================

/// The live stream under test, owned by the influencer account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSession {
    /// Influencer id on the platform
    pub session_id: u64,
    /// Ingest host for the encoder
    pub origin_host: String,
    /// Influencer username, also the stream name
    pub display_name: String,
    /// Set once the platform reports the stream server as ready
    pub ready: bool,
}

impl BroadcastSession {
    pub fn pending(session_id: u64, display_name: impl Into<String>) -> Self {
        Self {
            session_id,
            origin_host: String::new(),
            display_name: display_name.into(),
            ready: false,
        }
    }

    /// Apply a polled server status. Readiness never reverts.
    pub fn observe(&mut self, origin_host: &str, ready: bool) {
        if !origin_host.is_empty() {
            self.origin_host = origin_host.to_string();
        }
        self.ready = self.ready || ready;
    }
}

// ============================================================================
// PROGRESS SAMPLES
// ============================================================================

/// Playback metric carried by a progress sample
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    KiloBytes,
    Seconds,
    Percent,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::KiloBytes, Metric::Seconds, Metric::Percent];

    /// Column value written to the result stream
    pub fn name(&self) -> &'static str {
        match self {
            Metric::KiloBytes => "StreamProgressKiloBytes",
            Metric::Seconds => "StreamProgressSeconds",
            Metric::Percent => "StreamProgressPercent",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| format!("unknown metric: {}", s))
    }
}

/// One timestamped playback measurement for one virtual user
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub subject_id: String,
    /// Seconds since the subject's workflow started
    pub elapsed_seconds: f64,
    pub metric: Metric,
    pub value: f64,
}

impl ProgressSample {
    /// CSV record `[subject, elapsed, metric, value]` with two decimals
    pub fn to_record(&self) -> [String; 4] {
        [
            self.subject_id.clone(),
            format!("{:.2}", self.elapsed_seconds),
            self.metric.name().to_string(),
            format!("{:.2}", self.value),
        ]
    }

    /// Parse a record written by [`ProgressSample::to_record`]
    pub fn from_record<S: AsRef<str>>(fields: &[S]) -> Option<Self> {
        if fields.len() != 4 {
            return None;
        }
        Some(Self {
            subject_id: fields[0].as_ref().to_string(),
            elapsed_seconds: fields[1].as_ref().trim().parse().ok()?,
            metric: fields[2].as_ref().trim().parse().ok()?,
            value: fields[3].as_ref().trim().parse().ok()?,
        })
    }
}

// ============================================================================
// REMOTE NODES
// ============================================================================

/// Credentials for reaching a worker node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCredentials {
    /// Private key passed to ssh with `-i`
    pub key_file: Option<PathBuf>,
}

/// A worker machine that runs a share of the virtual users
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// ssh destination, e.g. `ubuntu@10.0.0.12`
    pub address: String,
    pub credentials: NodeCredentials,
}

impl fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// What to do when a worker node cannot be reached
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeFailurePolicy {
    /// Any unreachable node fails the whole run
    #[default]
    Abort,
    /// Continue with the reachable nodes
    Degrade,
}

impl FromStr for NodeFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(NodeFailurePolicy::Abort),
            "degrade" => Ok(NodeFailurePolicy::Degrade),
            other => Err(format!("unknown node failure policy: {}", other)),
        }
    }
}
