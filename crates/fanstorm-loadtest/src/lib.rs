//! # Fanstorm Viewer Load Testing
//!
//! Drives a synthetic audience against a live-streaming platform: one
//! influencer broadcast is provisioned and fed by an encoder, then virtual
//! fans sign in, follow, join, leave and finally watch the stream through a
//! decoder whose progress output is scraped into timestamped samples.
//!
//! ## Features
//!
//! - **Ramp Controller**: bounded concurrency with a fixed admission interval
//! - **Identity Generator**: reusable account pool mixed with fresh sign-ups
//! - **Virtual User Workflow**: per-step latency and failure accounting
//! - **Fan-out**: the same run split across ssh worker nodes
//! - **Result Aggregator**: one CSV stream for the whole fleet
//!
//! ## Usage
//!
//! ```bash
//! # 100 viewers, one every 200ms, against a fresh broadcast
//! fanstorm runtest --users 100 --ramp 200ms --email owner@e.com --token $TOKEN > results.csv
//!
//! # Only the viewer side, against an existing broadcast
//! fanstorm fan --users 20 --ramp 1s --influencerid 42
//!
//! # Split across three workers
//! fanstorm --users 300 --ramp 100ms --sshhosts "ubuntu@w1 ubuntu@w2 ubuntu@w3" --sshkeyfile ~/.ssh/lt.pem
//! ```

pub mod aggregator;
pub mod broadcast;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod ramp;
pub mod runner;
pub mod stats;
pub mod summary;
pub mod workflow;

pub use aggregator::{is_closed_output, parse_sample_line, AggregateReport, CsvSink, ResultAggregator, SampleSink};
pub use broadcast::{BroadcastProvisioner, ProvisionedBroadcast};
pub use error::{RemoteError, RemoteResult, RunError, RunResult, WorkflowError, WorkflowState, WorkflowStep};
pub use fanout::{assign_nodes, FanCommand, FanoutCoordinator, FanoutReport, NodeAssignment, RemoteShell, SshShell};
pub use identity::IdentityGenerator;
pub use ramp::{RampController, RampReport};
pub use runner::{RunReport, TestRun};
pub use stats::{step_metrics, StepRecorder, StepReport, StepSummary};
pub use summary::{PlaybackSummary, SubjectHealth};
pub use workflow::{precreate_fans, run_virtual_user, BroadcastTarget, PrecreateReport, VirtualUser, WorkflowContext};
