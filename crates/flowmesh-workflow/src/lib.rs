//! flowmesh-workflow — deployment and instance lifecycles.
//!
//! # Architecture
//!
//! ```text
//!   command surface ──▶ DeploymentManager ──▶ Compiler / Orchestrator / EventBus
//!          │                   │
//!          │                   ▼
//!          └─────────▶ InstanceManager ──▶ task calls (HTTP)
//!                              │
//!                              ▼
//!                     StateStore::transition
//! ```
//!
//! Every state change goes through [`flowmesh_state::StateStore::transition`];
//! the only unconditional state writes are the forced ERROR escapes after a
//! compiler / orchestrator failure.

pub mod call;
pub mod deployment;
pub mod error;
pub mod ingress;
pub mod instance;

#[cfg(test)]
pub(crate) mod test_support;

pub use deployment::{DeploymentManager, DeploymentRecord};
pub use error::{WorkflowError, WorkflowResult};
pub use ingress::IngressManager;
pub use instance::{FailOutcome, Instance, InstanceManager, RetryOutcome};

use flowmesh_core::process::ProcessGraph;
use flowmesh_state::{DeploymentKeys, StateStore};

/// Load the persisted process graph of deployment `id`.
pub fn load_graph(store: &StateStore, id: &str) -> WorkflowResult<ProcessGraph> {
    let raw = store
        .get(&DeploymentKeys::new(id).definition())?
        .ok_or_else(|| WorkflowError::NotFound(format!("deployment {id}")))?;
    Ok(ProcessGraph::from_bytes(&raw)?)
}
