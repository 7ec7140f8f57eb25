//! Error types for load test orchestration

use fanstorm_client::ClientError;
use fanstorm_core::ConfigError;
use fanstorm_media::MediaError;
use std::fmt;
use thiserror::Error;

/// Steps of a virtual user's workflow that talk to the platform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkflowStep {
    SignIn,
    SignUp,
    Follow,
    Join,
    Leave,
    ResolveEdge,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 6] = [
        WorkflowStep::SignIn,
        WorkflowStep::SignUp,
        WorkflowStep::Follow,
        WorkflowStep::Join,
        WorkflowStep::Leave,
        WorkflowStep::ResolveEdge,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowStep::SignIn => "sign-in",
            WorkflowStep::SignUp => "sign-up",
            WorkflowStep::Follow => "follow",
            WorkflowStep::Join => "join",
            WorkflowStep::Leave => "leave",
            WorkflowStep::ResolveEdge => "edge-resolve",
        }
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Position of a virtual user in its workflow
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowState {
    NotAuthenticated,
    Authenticated,
    Following,
    InStream,
    Left,
}

/// Why a single virtual user stopped early
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("{step} failed in state {state:?}: {source}")]
    Step {
        step: WorkflowStep,
        state: WorkflowState,
        #[source]
        source: ClientError,
    },

    #[error("Cancelled in state {0:?}")]
    Cancelled(WorkflowState),
}

impl WorkflowError {
    /// The step that failed, if the workflow was not cancelled
    pub fn step(&self) -> Option<WorkflowStep> {
        match self {
            WorkflowError::Step { step, .. } => Some(*step),
            WorkflowError::Cancelled(_) => None,
        }
    }
}

/// Errors from a session on a worker node
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Session refused: {0}")]
    Refused(String),

    #[error("Remote run exited with {0}")]
    Exited(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that end a whole run
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broadcast setup failed at {stage}: {source}")]
    Broadcast {
        stage: &'static str,
        #[source]
        source: ClientError,
    },

    #[error("Broadcast not ready after {0} polls")]
    BroadcastNotReady(u32),

    #[error("Platform error: {0}")]
    Client(#[from] ClientError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Cannot reach node {node}: {source}")]
    NodeUnreachable {
        node: String,
        #[source]
        source: RemoteError,
    },

    #[error("No worker node is reachable")]
    NoReachableNodes,

    #[error("Run was cancelled")]
    Cancelled,
}

pub type RunResult<T> = Result<T, RunError>;
