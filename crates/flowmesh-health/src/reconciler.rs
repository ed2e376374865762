//! Health reconciler: drives deployments out of STARTING and STOPPING.
//!
//! The reconciler watches `deployments/`. A deployment entering STARTING
//! gets one probe per health-checked task and is promoted to RUNNING once
//! every probe reports UP. A deployment entering STOPPING is torn down
//! through the orchestrator and moved to STOPPED once every probe reports
//! DOWN. Both waits give up into ERROR when a deployment timeout is set.
//!
//! The same decisions are replayed from persisted state at startup and
//! after the watch lags, so a restarted daemon picks up half-finished
//! transitions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use flowmesh_state::keys::{DEPLOYMENTS_PREFIX, id_from_key};
use flowmesh_state::{
    DeploymentKeys, DeploymentState, EventKind, Lifecycle, StateStore, WatchEvent, WatchStream,
    Watched,
};
use flowmesh_workflow::{DeploymentManager, load_graph};

use crate::error::{HealthError, HealthResult};
use crate::probe::{ProbeStatus, TaskProbe, run_probe};

/// Per-deployment probe statuses, keyed by deployment then task.
pub type ProbeReport = BTreeMap<String, BTreeMap<String, ProbeStatus>>;

struct ProbeSet {
    probes: Vec<TaskProbe>,
    handles: Vec<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Settle {
    Up,
    Down,
}

enum Wake {
    Changed,
    Halted,
    Expired,
}

#[derive(Clone)]
pub struct HealthReconciler {
    store: StateStore,
    deployments: DeploymentManager,
    probes: Arc<RwLock<HashMap<String, ProbeSet>>>,
    pending: Arc<Mutex<HashSet<(String, Settle)>>>,
    deployment_timeout: Option<Duration>,
    halt: Arc<watch::Sender<bool>>,
}

impl HealthReconciler {
    pub fn new(deployments: DeploymentManager, deployment_timeout: Option<Duration>) -> Self {
        let (halt, _) = watch::channel(false);
        Self {
            store: deployments.store().clone(),
            deployments,
            probes: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
            deployment_timeout,
            halt: Arc::new(halt),
        }
    }

    /// Watch deployment state until `shutdown` flips, then stop every probe.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> HealthResult<()> {
        let mut events = self.store.watch_prefix(DEPLOYMENTS_PREFIX);
        self.resume().await?;
        info!("health reconciler running");

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Watched::Event(event)) => self.on_event(event),
                    Some(Watched::Lagged(missed)) => {
                        warn!(missed, "reconciler fell behind; replaying persisted state");
                        if let Err(e) = self.resume().await {
                            error!(error = %e, "replay failed");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        self.shutdown().await;
        info!("health reconciler stopped");
        Ok(())
    }

    /// Rebuild probes and pending waits from what the store holds.
    pub async fn resume(&self) -> HealthResult<()> {
        for id in self.deployments.list()? {
            match self.deployments.state(&id)? {
                Some(DeploymentState::Starting) => self.spawn_settle(&id, Settle::Up),
                Some(DeploymentState::Stopping) => self.spawn_settle(&id, Settle::Down),
                Some(DeploymentState::Running | DeploymentState::Error) => {
                    if let Err(e) = self.ensure_probes(&id).await {
                        warn!(deployment_id = %id, error = %e, "probes not restored");
                    }
                }
                Some(DeploymentState::Stopped) | None => {}
            }
        }
        Ok(())
    }

    fn on_event(&self, event: WatchEvent) {
        let Some(id) = id_from_key(DEPLOYMENTS_PREFIX, &event.key) else {
            return;
        };
        if event.key != DeploymentKeys::new(id).state() {
            return;
        }
        match event.kind {
            EventKind::Delete => {
                let this = self.clone();
                let id = id.to_string();
                tokio::spawn(async move { this.stop_probes(&id).await });
            }
            EventKind::Put => match event.value.as_deref().and_then(DeploymentState::from_bytes) {
                Some(DeploymentState::Starting) => self.spawn_settle(id, Settle::Up),
                Some(DeploymentState::Stopping) => self.spawn_settle(id, Settle::Down),
                _ => {}
            },
        }
    }

    /// At most one wait of each direction per deployment.
    fn spawn_settle(&self, id: &str, direction: Settle) {
        let entry = (id.to_string(), direction);
        let fresh = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.clone());
        if !fresh {
            debug!(deployment_id = %id, ?direction, "wait already pending");
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let id = entry.0.as_str();
            let result = match direction {
                Settle::Up => match this.ensure_probes(id).await {
                    Ok(()) => this.settle(id, Settle::Up).await,
                    Err(e) => Err(e),
                },
                Settle::Down => this.tear_down(id).await,
            };
            if let Err(e) = result {
                error!(deployment_id = %id, ?direction, error = %e, "reconcile failed");
            }
            this.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&entry);
        });
    }

    async fn tear_down(&self, id: &str) -> HealthResult<()> {
        // remove() has already forced ERROR when it fails.
        if let Err(e) = self.deployments.remove(id).await {
            error!(deployment_id = %id, error = %e, "teardown failed");
            return Ok(());
        }
        self.ensure_probes(id).await?;
        self.settle(id, Settle::Down).await
    }

    /// Wait until every probe agrees, then make the transition.
    async fn settle(&self, id: &str, direction: Settle) -> HealthResult<()> {
        let (from, to, expected) = match direction {
            Settle::Up => (
                DeploymentState::Starting,
                DeploymentState::Running,
                ProbeStatus::Up,
            ),
            Settle::Down => (
                DeploymentState::Stopping,
                DeploymentState::Stopped,
                ProbeStatus::Down,
            ),
        };
        let keys = DeploymentKeys::new(id);
        let tasks: Vec<String> = TaskProbe::for_graph(id, &load_graph(&self.store, id)?)
            .into_iter()
            .map(|p| p.task_id)
            .collect();
        let mut changes = self.store.watch_prefix(&keys.root());
        let mut halt = self.halt.subscribe();
        let deadline = self.deployment_timeout.map(|t| Instant::now() + t);

        loop {
            if *halt.borrow() {
                return Ok(());
            }
            if self.store.get_state::<DeploymentState>(&keys.state())? != Some(from) {
                debug!(deployment_id = %id, state = from.as_str(), "no longer waiting");
                return Ok(());
            }
            if self.all_report(&keys, &tasks, expected)? {
                if direction == Settle::Down {
                    self.stop_probes(id).await;
                }
                if self.store.transition(&keys.state(), &[from], to)? {
                    info!(deployment_id = %id, state = to.as_str(), "deployment settled");
                }
                return Ok(());
            }
            match next_change(&mut changes, &mut halt, deadline).await {
                Wake::Changed => {}
                Wake::Halted => return Ok(()),
                Wake::Expired => {
                    if self
                        .store
                        .transition(&keys.state(), &[from], DeploymentState::Error)?
                    {
                        warn!(
                            deployment_id = %id,
                            state = from.as_str(),
                            timeout = ?self.deployment_timeout,
                            "deployment did not settle in time"
                        );
                    }
                    return Ok(());
                }
            }
        }
    }

    fn all_report(
        &self,
        keys: &DeploymentKeys,
        tasks: &[String],
        expected: ProbeStatus,
    ) -> HealthResult<bool> {
        for task in tasks {
            let status = self.store.get(&keys.probe(task))?;
            if status.as_deref().and_then(ProbeStatus::from_bytes) != Some(expected) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ── Probe sets ─────────────────────────────────────────────────

    async fn ensure_probes(&self, id: &str) -> HealthResult<()> {
        let mut sets = self.probes.write().await;
        if sets.contains_key(id) {
            return Ok(());
        }
        let probes = TaskProbe::for_graph(id, &load_graph(&self.store, id)?);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = probes
            .iter()
            .cloned()
            .map(|probe| tokio::spawn(run_probe(probe, self.store.clone(), stop_rx.clone())))
            .collect();
        info!(deployment_id = %id, probes = probes.len(), "probes started");
        sets.insert(
            id.to_string(),
            ProbeSet {
                probes,
                handles,
                stop_tx,
            },
        );
        Ok(())
    }

    /// Stop the probes of `id` and wait for them to clear their keys.
    pub async fn stop_probes(&self, id: &str) {
        let Some(set) = self.probes.write().await.remove(id) else {
            return;
        };
        let _ = set.stop_tx.send(true);
        for handle in set.handles {
            if let Err(e) = handle.await {
                warn!(deployment_id = %id, error = %e, "probe task failed");
            }
        }
        info!(deployment_id = %id, "probes stopped");
    }

    /// Deployments that currently have probes, sorted.
    pub async fn probing(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.probes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Probe `target` (a deployment id, or `all`) immediately.
    pub async fn probe_now(&self, target: &str) -> HealthResult<ProbeReport> {
        let selected: Vec<(String, Vec<TaskProbe>)> = {
            let sets = self.probes.read().await;
            if target == "all" {
                sets.iter()
                    .map(|(id, set)| (id.clone(), set.probes.clone()))
                    .collect()
            } else {
                let set = sets
                    .get(target)
                    .ok_or_else(|| HealthError::NotProbed(target.to_string()))?;
                vec![(target.to_string(), set.probes.clone())]
            }
        };

        let mut report = ProbeReport::new();
        for (id, probes) in selected {
            let mut statuses = BTreeMap::new();
            for probe in probes {
                if let Some(status) = probe.probe_once(&self.store).await? {
                    statuses.insert(probe.task_id.clone(), status);
                }
            }
            report.insert(id, statuses);
        }
        Ok(report)
    }

    /// Cancel pending waits and stop every probe.
    pub async fn shutdown(&self) {
        self.halt.send_replace(true);
        let ids: Vec<String> = self.probes.read().await.keys().cloned().collect();
        for id in ids {
            self.stop_probes(&id).await;
        }
    }
}

async fn next_change(
    changes: &mut WatchStream,
    halt: &mut watch::Receiver<bool>,
    deadline: Option<Instant>,
) -> Wake {
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        event = changes.next() => match event {
            Some(_) => Wake::Changed,
            None => Wake::Halted,
        },
        _ = halt.changed() => Wake::Halted,
        _ = expiry => Wake::Expired,
    }
}

#[cfg(test)]
mod tests {
    use flowmesh_core::deploy::{DryRunOrchestrator, PrerenderedCompiler};
    use flowmesh_core::events::MemoryBus;

    use super::*;
    use crate::test_support::{HealthServer, eventually, shop_definition};

    struct Harness {
        reconciler: HealthReconciler,
        deployments: DeploymentManager,
        orchestrator: Arc<DryRunOrchestrator>,
        server: HealthServer,
        shutdown_tx: watch::Sender<bool>,
        task: JoinHandle<HealthResult<()>>,
    }

    impl Harness {
        async fn start(timeout: Option<Duration>) -> Self {
            Self::start_with(timeout, |_, _| async {}).await
        }

        /// `before` runs against the deployment manager before the
        /// reconciler is spawned.
        async fn start_with<F, Fut>(timeout: Option<Duration>, before: F) -> Self
        where
            F: FnOnce(DeploymentManager, std::net::SocketAddr) -> Fut,
            Fut: Future<Output = ()>,
        {
            let server = HealthServer::start().await;
            let orchestrator = Arc::new(DryRunOrchestrator::new());
            let deployments = DeploymentManager::new(
                StateStore::open_in_memory().unwrap(),
                Arc::new(PrerenderedCompiler),
                orchestrator.clone(),
                Arc::new(MemoryBus::new()),
            );
            before(deployments.clone(), server.addr).await;
            let reconciler = HealthReconciler::new(deployments.clone(), timeout);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn({
                let reconciler = reconciler.clone();
                async move { reconciler.run(shutdown_rx).await }
            });
            Self {
                reconciler,
                deployments,
                orchestrator,
                server,
                shutdown_tx,
                task,
            }
        }

        async fn apply(&self) -> String {
            self.deployments
                .apply(shop_definition(self.server.addr).as_bytes(), false)
                .await
                .unwrap()
        }

        fn state(&self, id: &str) -> Option<DeploymentState> {
            self.deployments.state(id).unwrap()
        }

        async fn reach(&self, id: &str, state: DeploymentState) {
            eventually(|| self.state(id) == Some(state)).await;
        }

        fn probes_empty(&self) -> bool {
            self.reconciler
                .probes
                .try_read()
                .map(|sets| sets.is_empty())
                .unwrap_or(false)
        }

        async fn finish(self) {
            self.shutdown_tx.send(true).unwrap();
            self.task.await.unwrap().unwrap();
            assert!(self.reconciler.probing().await.is_empty());
        }
    }

    #[tokio::test]
    async fn promotes_once_every_task_is_up() {
        let h = Harness::start(None).await;
        h.server.set_healthy("/cart/health", true);
        let id = h.apply().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.state(&id), Some(DeploymentState::Starting));

        h.server.set_healthy("/pay/health", true);
        h.reach(&id, DeploymentState::Running).await;
        assert_eq!(h.reconciler.probing().await, vec![id.clone()]);
        h.finish().await;
    }

    #[tokio::test]
    async fn stop_tears_down_then_waits_for_down() {
        let h = Harness::start(None).await;
        h.server.set_all(true);
        let id = h.apply().await;
        h.reach(&id, DeploymentState::Running).await;

        h.deployments.stop(&id, false).unwrap();
        eventually(|| h.orchestrator.removed().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.state(&id), Some(DeploymentState::Stopping));

        h.server.set_all(false);
        h.reach(&id, DeploymentState::Stopped).await;
        eventually(|| {
            h.deployments
                .store()
                .keys_with_prefix(&DeploymentKeys::new(&id).probes())
                .unwrap()
                .is_empty()
        })
        .await;
        assert!(h.reconciler.probing().await.is_empty());
        h.finish().await;
    }

    #[tokio::test]
    async fn failed_teardown_leaves_error() {
        let h = Harness::start(None).await;
        h.server.set_all(true);
        let id = h.apply().await;
        h.reach(&id, DeploymentState::Running).await;

        h.orchestrator.fail_next_remove();
        h.deployments.stop(&id, false).unwrap();
        h.reach(&id, DeploymentState::Error).await;
        h.finish().await;
    }

    #[tokio::test]
    async fn deployment_timeout_moves_to_error() {
        let h = Harness::start(Some(Duration::from_millis(150))).await;
        let id = h.apply().await;
        h.reach(&id, DeploymentState::Error).await;
        h.finish().await;
    }

    #[tokio::test]
    async fn resumes_a_deployment_left_starting() {
        let h = Harness::start_with(None, |deployments, addr| async move {
            // Applied by a daemon that exited before the tasks came up.
            deployments
                .apply(shop_definition(addr).as_bytes(), false)
                .await
                .unwrap();
        })
        .await;
        let id = h.deployments.list().unwrap().remove(0);
        assert_eq!(h.state(&id), Some(DeploymentState::Starting));

        h.server.set_all(true);
        h.reach(&id, DeploymentState::Running).await;
        h.finish().await;
    }

    #[tokio::test]
    async fn deleting_a_deployment_stops_its_probes() {
        let h = Harness::start(Some(Duration::from_millis(150))).await;
        let id = h.apply().await;
        h.reach(&id, DeploymentState::Error).await;
        assert_eq!(h.reconciler.probing().await, vec![id.clone()]);

        h.deployments.delete(&id).await.unwrap();
        eventually(|| h.probes_empty()).await;
        assert!(h.deployments.list().unwrap().is_empty());
        h.finish().await;
    }

    #[tokio::test]
    async fn probe_now_reports_each_task() {
        let h = Harness::start(None).await;
        h.server.set_all(true);
        let id = h.apply().await;
        h.reach(&id, DeploymentState::Running).await;

        h.server.set_healthy("/pay/health", false);
        let report = h.reconciler.probe_now("all").await.unwrap();
        assert_eq!(report[&id]["cart"], ProbeStatus::Up);
        assert_eq!(report[&id]["pay"], ProbeStatus::Down);

        assert!(matches!(
            h.reconciler.probe_now("missing").await,
            Err(HealthError::NotProbed(_))
        ));
        h.finish().await;
    }
}
