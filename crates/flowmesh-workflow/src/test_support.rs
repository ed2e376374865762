//! Fixtures shared by the manager tests: a process definition, managers
//! over an in-memory store, and a loopback task server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};

use flowmesh_core::deploy::{DryRunOrchestrator, PrerenderedCompiler};
use flowmesh_core::events::MemoryBus;
use flowmesh_state::{DeploymentKeys, StateStore};

use crate::{DeploymentManager, InstanceManager};

pub(crate) const ORDER: &str = r#"
id: order
properties:
  orchestrator: docker
  is_recoverable: true
  user_metadata:
    team: payments
vertices:
  - id: start
    type: start_event
    successors: [validate]
  - id: validate
    type: task
    name: Validate order
    service: { host: validate, port: 5000, path: /validate }
    health: { path: /health, period: 5s }
    successors: [route]
  - id: route
    type: exclusive_gateway
    service: { host: route-gw, port: 5000 }
    successors: [notify, end]
  - id: notify
    type: throw_event
    topic: order-events
    service: { host: notify-gw, port: 5000 }
    successors: [end]
  - id: end
    type: end_event
"#;

/// `ORDER` with the first task served at `addr`.
pub(crate) fn order_at(addr: SocketAddr, recoverable: bool) -> String {
    ORDER
        .replace(
            "service: { host: validate, port: 5000, path: /validate }",
            &format!(
                "service: {{ host: {}, port: {}, path: /validate }}",
                addr.ip(),
                addr.port()
            ),
        )
        .replace(
            "is_recoverable: true",
            &format!("is_recoverable: {recoverable}"),
        )
}

pub(crate) fn manager_with(
    orchestrator: Arc<DryRunOrchestrator>,
    bus: Arc<MemoryBus>,
) -> DeploymentManager {
    let store = StateStore::open_in_memory().unwrap();
    DeploymentManager::new(store, Arc::new(PrerenderedCompiler), orchestrator, bus)
}

pub(crate) fn managers() -> (
    DeploymentManager,
    InstanceManager,
    Arc<DryRunOrchestrator>,
    Arc<MemoryBus>,
) {
    let orchestrator = Arc::new(DryRunOrchestrator::new());
    let bus = Arc::new(MemoryBus::new());
    let deployments = manager_with(orchestrator.clone(), bus.clone());
    let instances = InstanceManager::new(deployments.store().clone(), Duration::from_secs(5));
    (deployments, instances, orchestrator, bus)
}

/// Apply `definition` and mark it RUNNING as the reconciler would.
pub(crate) async fn running_deployment(deployments: &DeploymentManager, definition: &str) -> String {
    let id = deployments.apply(definition.as_bytes(), false).await.unwrap();
    deployments
        .store()
        .put(&DeploymentKeys::new(&id).state(), b"RUNNING")
        .unwrap();
    id
}

// ── Task server ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub path: String,
    pub body: String,
    pub flow_id: Option<String>,
    pub wf_id: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Clone, Default)]
struct TaskState {
    received: Arc<Mutex<Vec<Received>>>,
    failing: Arc<AtomicBool>,
}

/// Loopback server recording every request. Answers 200, or 500 while
/// failing.
pub(crate) struct TaskServer {
    pub addr: SocketAddr,
    state: TaskState,
}

impl TaskServer {
    pub async fn start() -> Self {
        Self::spawn(false).await
    }

    pub async fn failing() -> Self {
        Self::spawn(true).await
    }

    async fn spawn(failing: bool) -> Self {
        let state = TaskState::default();
        state.failing.store(failing, Ordering::SeqCst);
        let router = Router::new().fallback(record).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }
}

async fn record(
    State(state): State<TaskState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.received.lock().unwrap().push(Received {
        path: uri.path().to_string(),
        body: String::from_utf8_lossy(&body).into_owned(),
        flow_id: header("x-flow-id"),
        wf_id: header("x-rexflow-wf-id"),
        content_type: header("content-type"),
    });
    if state.failing.load(Ordering::SeqCst) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}
