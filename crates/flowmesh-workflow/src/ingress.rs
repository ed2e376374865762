//! Ingress bindings: which deployment answers at a public host.
//!
//! A binding lives at `ingress/{host}` and holds the deployment id. The
//! orchestrator applies the ingress spec before the binding is swapped, so
//! a failed apply leaves the previous occupant in place.

use std::sync::Arc;

use tracing::{info, warn};

use flowmesh_core::deploy::{Compiler, Orchestrator};
use flowmesh_state::StateStore;
use flowmesh_state::keys::{INGRESS_PREFIX, ingress};

use crate::error::{WorkflowError, WorkflowResult};
use crate::load_graph;

#[derive(Clone)]
pub struct IngressManager {
    store: StateStore,
    compiler: Arc<dyn Compiler>,
    orchestrator: Arc<dyn Orchestrator>,
}

impl IngressManager {
    pub fn new(
        store: StateStore,
        compiler: Arc<dyn Compiler>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            store,
            compiler,
            orchestrator,
        }
    }

    /// Deployment currently bound to `host`.
    pub fn occupant(&self, host: &str) -> WorkflowResult<Option<String>> {
        Ok(self.store.get_string(&ingress(host))?)
    }

    /// `host → deployment id` for every binding.
    pub fn bindings(&self) -> WorkflowResult<Vec<(String, String)>> {
        Ok(self
            .store
            .get_prefix(INGRESS_PREFIX)?
            .into_iter()
            .map(|(key, value)| {
                (
                    key[INGRESS_PREFIX.len()..].to_string(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect())
    }

    /// Bind `host` to `deployment_id`. An occupied host is only taken
    /// over when `switch_from` names the current occupant.
    pub async fn expose(
        &self,
        deployment_id: &str,
        host: &str,
        switch_from: Option<&str>,
    ) -> WorkflowResult<()> {
        let graph = load_graph(&self.store, deployment_id)?;
        let occupant = self.occupant(host)?;
        if let Some(current) = &occupant {
            if switch_from != Some(current.as_str()) && current != deployment_id {
                return Err(WorkflowError::HostOccupied {
                    host: host.to_string(),
                    occupant: current.clone(),
                });
            }
        }

        let spec = self.compiler.compile_ingress(deployment_id, &graph, host)?;
        self.orchestrator.apply(&spec).await?;

        let key = ingress(host);
        if !self.store.compare_and_swap(
            &key,
            occupant.as_deref().map(str::as_bytes),
            deployment_id.as_bytes(),
        )? {
            return Err(WorkflowError::HostOccupied {
                host: host.to_string(),
                occupant: self.occupant(host)?.unwrap_or_default(),
            });
        }
        info!(%host, %deployment_id, previous = ?occupant, "ingress exposed");

        if let Some(previous) = occupant.filter(|p| p != deployment_id) {
            if let Err(e) = self.withdraw(&previous, host).await {
                warn!(%host, deployment_id = %previous, error = %e, "previous ingress not removed");
            }
        }
        Ok(())
    }

    /// Unbind `host`, which must be bound to `deployment_id`.
    pub async fn clear(&self, deployment_id: &str, host: &str) -> WorkflowResult<()> {
        if self.occupant(host)?.as_deref() != Some(deployment_id) {
            return Err(WorkflowError::HostMismatch {
                host: host.to_string(),
                deployment_id: deployment_id.to_string(),
            });
        }
        self.withdraw(deployment_id, host).await?;
        self.store.delete(&ingress(host))?;
        info!(%host, %deployment_id, "ingress cleared");
        Ok(())
    }

    async fn withdraw(&self, deployment_id: &str, host: &str) -> WorkflowResult<()> {
        let graph = load_graph(&self.store, deployment_id)?;
        let spec = self.compiler.compile_ingress(deployment_id, &graph, host)?;
        self.orchestrator.remove(&spec).await?;
        Ok(())
    }
}
