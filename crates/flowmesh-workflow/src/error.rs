//! Error types for the workflow managers.

use flowmesh_core::{BusError, CallError, CompileError, OrchestratorError, ProcessError};
use flowmesh_state::StateError;
use thiserror::Error;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    // ── Validation ─────────────────────────────────────────────────
    #[error("{0} was not found")]
    NotFound(String),

    #[error("invalid process: {0}")]
    InvalidProcess(String),

    #[error("process has multiple entry points ({0}); one must be specified")]
    AmbiguousEntryPoint(String),

    #[error("unknown entry point: {0}")]
    UnknownEntryPoint(String),

    #[error("{0} is not a supported serialization type")]
    UnsupportedSerialization(String),

    #[error("{0} is not a supported call method")]
    UnsupportedMethod(String),

    #[error("request carries no flow id headers")]
    MissingIds,

    // ── Conflicts ──────────────────────────────────────────────────
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{id} is not in a startable state ({state})")]
    NotStartable { id: String, state: String },

    #[error("{id} is not in a stoppable state ({state})")]
    NotStoppable { id: String, state: String },

    #[error("{0} has live instances")]
    LiveInstances(String),

    #[error("deployment {id} is not RUNNING ({state})")]
    NotRunning { id: String, state: String },

    #[error("can only retry instances in STOPPED state; {id} is {state}")]
    NotRetryable { id: String, state: String },

    #[error("{id} cannot be deleted in state {state}")]
    NotDeletable { id: String, state: String },

    #[error("host {host} is already bound to {occupant}")]
    HostOccupied { host: String, occupant: String },

    #[error("host {host} is not bound to {deployment_id}")]
    HostMismatch { host: String, deployment_id: String },

    #[error("failed to fully remove {0} from the backing store")]
    IncompleteDelete(String),

    // ── Collaborators ──────────────────────────────────────────────
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("instance {instance_id} failed to start: {source}")]
    Call {
        instance_id: String,
        #[source]
        source: CallError,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<ProcessError> for WorkflowError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::AmbiguousEntryPoint(ids) => Self::AmbiguousEntryPoint(ids),
            ProcessError::UnknownEntryPoint(id) => Self::UnknownEntryPoint(id),
            ProcessError::UnsupportedSerialization(s) => Self::UnsupportedSerialization(s),
            ProcessError::Parse(msg) | ProcessError::Invalid(msg) => Self::InvalidProcess(msg),
        }
    }
}

impl WorkflowError {
    /// Negative status reported by the command surface.
    ///
    /// `-1` not found or invalid, `-2` state conflict, `-3` partial
    /// delete, `-4` orchestrator teardown failure.
    pub fn status(&self) -> i32 {
        match self {
            Self::NotStartable { .. }
            | Self::NotStoppable { .. }
            | Self::NotRunning { .. }
            | Self::NotRetryable { .. }
            | Self::NotDeletable { .. }
            | Self::AlreadyExists(_)
            | Self::LiveInstances(_)
            | Self::HostOccupied { .. }
            | Self::HostMismatch { .. } => -2,
            Self::IncompleteDelete(_) => -3,
            Self::Orchestrator(_) => -4,
            _ => -1,
        }
    }
}
