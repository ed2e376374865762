use thiserror::Error;

use flowmesh_state::StateError;
use flowmesh_workflow::WorkflowError;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("no probes running for {0}")]
    NotProbed(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    State(#[from] StateError),
}
