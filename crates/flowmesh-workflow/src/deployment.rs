//! Deployment manager — applies process definitions and drives the
//! deployment lifecycle.
//!
//! ```text
//! apply ──▶ STARTING ──(reconciler: all probes UP)──▶ RUNNING
//!              ▲                                        │ stop
//!              │ start                                  ▼
//!           STOPPED ◀──(reconciler: all probes DOWN)── STOPPING
//! ```
//!
//! Promotion to RUNNING and demotion to STOPPED belong to the health
//! reconciler; this manager only requests the transitions it owns.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use flowmesh_core::deploy::{Compiler, Orchestrator};
use flowmesh_core::events::EventBus;
use flowmesh_core::process::ProcessGraph;
use flowmesh_state::keys::{DEPLOYMENTS_PREFIX, probe_task_from_key};
use flowmesh_state::{DeploymentKeys, DeploymentState, Lifecycle, StateStore};

use crate::error::{WorkflowError, WorkflowResult};
use crate::instance::live_instances_of;
use crate::load_graph;

/// What `ps` reports for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub state: Option<DeploymentState>,
    pub process_id: String,
    pub orchestrator: String,
    pub is_recoverable: bool,
    pub entry_points: Vec<String>,
    /// Task id → last reported health (`UP` / `DOWN`).
    pub probes: BTreeMap<String, String>,
}

/// `process id → deployment id → entry URLs` for RUNNING deployments.
pub type WorkflowMap = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Clone)]
pub struct DeploymentManager {
    store: StateStore,
    compiler: Arc<dyn Compiler>,
    orchestrator: Arc<dyn Orchestrator>,
    bus: Arc<dyn EventBus>,
}

impl DeploymentManager {
    pub fn new(
        store: StateStore,
        compiler: Arc<dyn Compiler>,
        orchestrator: Arc<dyn Orchestrator>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            store,
            compiler,
            orchestrator,
            bus,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Persist a process definition and start it (or leave it STOPPED).
    /// Returns the derived deployment id.
    pub async fn apply(&self, definition: &[u8], start_stopped: bool) -> WorkflowResult<String> {
        let graph = ProcessGraph::from_bytes(definition)?;
        let id = graph.deployment_id()?;
        let keys = DeploymentKeys::new(&id);

        if !self
            .store
            .put_if_absent(&keys.definition(), &graph.to_canonical_bytes()?)?
        {
            return Err(WorkflowError::AlreadyExists(id));
        }
        info!(deployment_id = %id, process_id = %graph.id, start_stopped, "deployment applied");

        if start_stopped {
            let created = self
                .store
                .put_if_absent(&keys.state(), DeploymentState::Stopped.as_str().as_bytes())?;
            if !created {
                warn!(
                    deployment_id = %id,
                    state = %self.state_label(&id)?,
                    "state key already present; left unchanged"
                );
            }
        } else {
            self.start(&id).await?;
        }
        Ok(id)
    }

    /// Move the deployment to STARTING and bring its services up. Any
    /// compiler or orchestrator failure forces ERROR.
    pub async fn start(&self, id: &str) -> WorkflowResult<()> {
        let keys = DeploymentKeys::new(id);
        let graph = load_graph(&self.store, id)?;

        let created = self
            .store
            .put_if_absent(&keys.state(), DeploymentState::Starting.as_str().as_bytes())?;
        if !created
            && !self.store.transition(
                &keys.state(),
                &[DeploymentState::Stopped],
                DeploymentState::Starting,
            )?
        {
            return Err(WorkflowError::NotStartable {
                id: id.to_string(),
                state: self.state_label(id)?,
            });
        }
        info!(deployment_id = %id, "deployment starting");

        if let Err(e) = self.bring_up(id, &graph).await {
            error!(deployment_id = %id, error = %e, "deployment failed to start");
            self.store.force_state::<DeploymentState>(&keys.state())?;
            return Err(e);
        }
        Ok(())
    }

    async fn bring_up(&self, id: &str, graph: &ProcessGraph) -> WorkflowResult<()> {
        let spec = self.compiler.compile(id, graph)?;
        self.orchestrator.apply(&spec).await?;
        for topic in graph.topics() {
            self.bus.create_topic(&topic)?;
        }
        Ok(())
    }

    /// Request the move to STOPPING. Teardown happens in the health
    /// reconciler once every task reports DOWN. Refuses while instances
    /// are live unless `force`.
    pub fn stop(&self, id: &str, force: bool) -> WorkflowResult<()> {
        let keys = DeploymentKeys::new(id);
        if self.state(id)?.is_none() {
            return Err(WorkflowError::NotFound(format!("deployment {id}")));
        }
        if !force {
            let live = live_instances_of(&self.store, id)?;
            if !live.is_empty() {
                warn!(deployment_id = %id, live = live.len(), "stop refused: live instances");
                return Err(WorkflowError::LiveInstances(id.to_string()));
            }
        }
        if !self.store.transition(
            &keys.state(),
            &[DeploymentState::Running, DeploymentState::Error],
            DeploymentState::Stopping,
        )? {
            return Err(WorkflowError::NotStoppable {
                id: id.to_string(),
                state: self.state_label(id)?,
            });
        }
        info!(deployment_id = %id, force, "deployment stopping");
        Ok(())
    }

    /// Tear down the deployed services. A failure forces ERROR.
    pub async fn remove(&self, id: &str) -> WorkflowResult<()> {
        let graph = load_graph(&self.store, id)?;
        let teardown = async {
            let spec = self.compiler.compile(id, &graph)?;
            self.orchestrator.remove(&spec).await?;
            Ok::<_, WorkflowError>(())
        };
        if let Err(e) = teardown.await {
            error!(deployment_id = %id, error = %e, "deployment teardown failed");
            self.store
                .force_state::<DeploymentState>(&DeploymentKeys::new(id).state())?;
            return Err(e);
        }
        info!(deployment_id = %id, "deployment services removed");
        Ok(())
    }

    /// Delete every key of a STOPPED or ERROR deployment. ERROR deployments
    /// are torn down first since nothing else will.
    pub async fn delete(&self, id: &str) -> WorkflowResult<()> {
        let keys = DeploymentKeys::new(id);
        let state = self.state(id)?;
        if state.is_none() && self.store.get(&keys.definition())?.is_none() {
            return Err(WorkflowError::NotFound(format!("deployment {id}")));
        }
        if let Some(state) = state {
            if !state.is_terminal() {
                return Err(WorkflowError::NotDeletable {
                    id: id.to_string(),
                    state: state.to_string(),
                });
            }
            if state == DeploymentState::Error {
                self.remove(id).await?;
            }
        }
        if !self.store.delete_prefix(&keys.root())? {
            return Err(WorkflowError::IncompleteDelete(id.to_string()));
        }
        info!(deployment_id = %id, "deployment deleted");
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn state(&self, id: &str) -> WorkflowResult<Option<DeploymentState>> {
        Ok(self
            .store
            .get_state::<DeploymentState>(&DeploymentKeys::new(id).state())?)
    }

    fn state_label(&self, id: &str) -> WorkflowResult<String> {
        Ok(self
            .store
            .get_string(&DeploymentKeys::new(id).state())?
            .unwrap_or_else(|| "ABSENT".to_string()))
    }

    pub fn list(&self) -> WorkflowResult<Vec<String>> {
        Ok(self.store.next_level(DEPLOYMENTS_PREFIX)?)
    }

    pub fn describe(&self, id: &str) -> WorkflowResult<DeploymentRecord> {
        let keys = DeploymentKeys::new(id);
        let graph = load_graph(&self.store, id)?;
        let probes = self
            .store
            .get_prefix(&keys.probes())?
            .into_iter()
            .filter_map(|(key, value)| {
                let task = probe_task_from_key(&key)?.to_string();
                Some((task, String::from_utf8_lossy(&value).into_owned()))
            })
            .collect();
        Ok(DeploymentRecord {
            id: id.to_string(),
            state: self.state(id)?,
            process_id: graph.id.clone(),
            orchestrator: graph.properties.orchestrator.as_str().to_string(),
            is_recoverable: graph.properties.is_recoverable,
            entry_points: graph.entry_points().map(|v| v.id.clone()).collect(),
            probes,
        })
    }

    /// Resolve a possibly abbreviated deployment id. A unique substring
    /// match wins; otherwise the query must be an exact id.
    pub fn resolve_id(&self, query: &str) -> WorkflowResult<String> {
        let ids = self.list()?;
        let matches: Vec<&String> = ids.iter().filter(|id| id.contains(query)).collect();
        if let [only] = matches.as_slice() {
            return Ok((*only).clone());
        }
        if ids.iter().any(|id| id == query) {
            return Ok(query.to_string());
        }
        Err(WorkflowError::NotFound(format!("deployment {query}")))
    }

    pub fn workflow_map(&self) -> WorkflowResult<WorkflowMap> {
        let mut map = WorkflowMap::new();
        for id in self.list()? {
            if self.state(&id)? != Some(DeploymentState::Running) {
                continue;
            }
            let graph = match load_graph(&self.store, &id) {
                Ok(graph) => graph,
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "skipping unreadable definition");
                    continue;
                }
            };
            let urls = graph
                .entry_points()
                .flat_map(|entry| graph.callable_successors(entry))
                .filter_map(|v| v.service.as_ref().map(|s| s.url()))
                .collect();
            map.entry(graph.id.clone()).or_default().insert(id, urls);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use flowmesh_core::deploy::DryRunOrchestrator;
    use flowmesh_core::events::MemoryBus;

    use super::*;
    use crate::test_support::{ORDER, manager_with, managers};

    #[tokio::test]
    async fn apply_starts_and_creates_topics() {
        let (deployments, _, orchestrator, bus) = managers();
        let id = deployments.apply(ORDER.as_bytes(), false).await.unwrap();

        assert!(id.starts_with("order-"));
        assert_eq!(deployments.state(&id).unwrap(), Some(DeploymentState::Starting));
        assert_eq!(orchestrator.applied().len(), 1);
        assert_eq!(bus.topics(), vec!["order-events".to_string()]);
    }

    #[tokio::test]
    async fn apply_twice_is_rejected() {
        let (deployments, ..) = managers();
        let id = deployments.apply(ORDER.as_bytes(), true).await.unwrap();
        let before = deployments
            .store()
            .get(&DeploymentKeys::new(&id).definition())
            .unwrap();

        let err = deployments.apply(ORDER.as_bytes(), false).await.unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyExists(ref dup) if *dup == id));
        assert_eq!(err.status(), -2);
        assert_eq!(
            deployments
                .store()
                .get(&DeploymentKeys::new(&id).definition())
                .unwrap(),
            before
        );
        assert_eq!(deployments.state(&id).unwrap(), Some(DeploymentState::Stopped));
    }

    #[tokio::test]
    async fn stopped_apply_keeps_a_leftover_state() {
        let (deployments, ..) = managers();
        let id = ProcessGraph::from_bytes(ORDER.as_bytes())
            .unwrap()
            .deployment_id()
            .unwrap();
        deployments
            .store()
            .put(&DeploymentKeys::new(&id).state(), b"ERROR")
            .unwrap();

        assert_eq!(deployments.apply(ORDER.as_bytes(), true).await.unwrap(), id);
        assert_eq!(deployments.state(&id).unwrap(), Some(DeploymentState::Error));
    }

    #[tokio::test]
    async fn orchestrator_failure_forces_error() {
        let orchestrator = Arc::new(DryRunOrchestrator::new());
        orchestrator.fail_next_apply();
        let deployments = manager_with(orchestrator.clone(), Arc::new(MemoryBus::new()));

        let err = deployments.apply(ORDER.as_bytes(), false).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Orchestrator(_)));
        let id = deployments.list().unwrap().remove(0);
        assert_eq!(deployments.state(&id).unwrap(), Some(DeploymentState::Error));
    }

    #[tokio::test]
    async fn start_only_from_stopped() {
        let (deployments, ..) = managers();
        let id = deployments.apply(ORDER.as_bytes(), true).await.unwrap();
        deployments.start(&id).await.unwrap();

        let err = deployments.start(&id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotStartable { ref state, .. } if state == "STARTING"));
    }

    #[tokio::test]
    async fn stop_requires_running_or_error() {
        let (deployments, ..) = managers();
        let id = deployments.apply(ORDER.as_bytes(), true).await.unwrap();
        assert!(matches!(
            deployments.stop(&id, false),
            Err(WorkflowError::NotStoppable { .. })
        ));

        let keys = DeploymentKeys::new(&id);
        deployments
            .store()
            .put(&keys.state(), b"RUNNING")
            .unwrap();
        deployments.stop(&id, false).unwrap();
        assert_eq!(deployments.state(&id).unwrap(), Some(DeploymentState::Stopping));

        deployments.store().force_state::<DeploymentState>(&keys.state()).unwrap();
        deployments.stop(&id, false).unwrap();
        assert!(matches!(
            deployments.stop("nope", false),
            Err(WorkflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_refuses_live_instances_unless_forced() {
        let (deployments, instances, ..) = managers();
        let id = deployments.apply(ORDER.as_bytes(), true).await.unwrap();
        let store = deployments.store();
        store.put(&DeploymentKeys::new(&id).state(), b"RUNNING").unwrap();

        let instance = instances.create(&id).unwrap();
        let keys = flowmesh_state::InstanceKeys::new(&instance.id);
        store.put(&keys.parent(), id.as_bytes()).unwrap();
        store.put(&keys.state(), b"RUNNING").unwrap();

        assert!(matches!(
            deployments.stop(&id, false),
            Err(WorkflowError::LiveInstances(_))
        ));
        deployments.stop(&id, true).unwrap();
    }

    #[tokio::test]
    async fn delete_only_terminal_deployments() {
        let (deployments, _, orchestrator, _) = managers();
        let id = deployments.apply(ORDER.as_bytes(), false).await.unwrap();

        let err = deployments.delete(&id).await.unwrap_err();
        assert_eq!(err.status(), -2);
        assert!(deployments.store().get(&DeploymentKeys::new(&id).definition()).unwrap().is_some());

        deployments
            .store()
            .force_state::<DeploymentState>(&DeploymentKeys::new(&id).state())
            .unwrap();
        deployments.delete(&id).await.unwrap();
        assert!(deployments.list().unwrap().is_empty());
        assert_eq!(orchestrator.removed().len(), 1);

        let err = deployments.delete(&id).await.unwrap_err();
        assert_eq!(err.status(), -1);
    }

    #[tokio::test]
    async fn delete_reports_teardown_failure() {
        let orchestrator = Arc::new(DryRunOrchestrator::new());
        let deployments = manager_with(orchestrator.clone(), Arc::new(MemoryBus::new()));
        let id = deployments.apply(ORDER.as_bytes(), false).await.unwrap();
        deployments
            .store()
            .force_state::<DeploymentState>(&DeploymentKeys::new(&id).state())
            .unwrap();

        orchestrator.fail_next_remove();
        let err = deployments.delete(&id).await.unwrap_err();
        assert_eq!(err.status(), -4);
        assert_eq!(deployments.list().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn describe_and_resolve() {
        let (deployments, ..) = managers();
        let id = deployments.apply(ORDER.as_bytes(), false).await.unwrap();
        deployments
            .store()
            .put(&DeploymentKeys::new(&id).probe("validate"), b"UP")
            .unwrap();

        let record = deployments.describe(&id).unwrap();
        assert_eq!(record.process_id, "order");
        assert_eq!(record.orchestrator, "docker");
        assert!(record.is_recoverable);
        assert_eq!(record.entry_points, vec!["start".to_string()]);
        assert_eq!(record.probes.get("validate").map(String::as_str), Some("UP"));

        let hash = id.rsplit('-').next().unwrap();
        assert_eq!(deployments.resolve_id(&hash[..6]).unwrap(), id);
        assert!(deployments.resolve_id("missing").is_err());
    }

    #[tokio::test]
    async fn workflow_map_lists_running_entry_urls() {
        let (deployments, ..) = managers();
        let id = deployments.apply(ORDER.as_bytes(), false).await.unwrap();
        assert!(deployments.workflow_map().unwrap().is_empty());

        deployments
            .store()
            .put(&DeploymentKeys::new(&id).state(), b"RUNNING")
            .unwrap();
        let map = deployments.workflow_map().unwrap();
        assert_eq!(
            map["order"][&id],
            vec!["http://validate:5000/validate".to_string()]
        );
    }
}
