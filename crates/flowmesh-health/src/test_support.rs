//! Loopback health server and a two-task process for the probe tests.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};

use flowmesh_core::process::ProcessGraph;

const SHOP: &str = r#"
id: shop
properties:
  orchestrator: kubernetes
vertices:
  - id: start
    type: start_event
    successors: [cart]
  - id: cart
    type: task
    service: { host: HOST, port: PORT, path: /cart }
    health: { path: /cart/health, period: 20ms, timeout: 1s }
    successors: [pay]
  - id: pay
    type: task
    service: { host: HOST, port: PORT, path: /pay }
    health: { path: pay/health, period: 20ms, timeout: 1s }
    successors: [end]
  - id: end
    type: end_event
"#;

pub(crate) fn shop_definition(addr: SocketAddr) -> String {
    SHOP.replace("HOST", &addr.ip().to_string())
        .replace("PORT", &addr.port().to_string())
}

pub(crate) fn shop_graph(addr: SocketAddr) -> ProcessGraph {
    ProcessGraph::from_bytes(shop_definition(addr).as_bytes()).unwrap()
}

/// Answers 200 on healthy paths and 503 everywhere else.
pub(crate) struct HealthServer {
    pub addr: SocketAddr,
    healthy: Arc<Mutex<HashSet<String>>>,
}

impl HealthServer {
    pub async fn start() -> Self {
        let healthy: Arc<Mutex<HashSet<String>>> = Arc::default();
        let router = Router::new().fallback(answer).with_state(healthy.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self { addr, healthy }
    }

    pub fn set_healthy(&self, path: &str, healthy: bool) {
        let mut paths = self.healthy.lock().unwrap();
        if healthy {
            paths.insert(path.to_string());
        } else {
            paths.remove(path);
        }
    }

    pub fn set_all(&self, healthy: bool) {
        self.set_healthy("/cart/health", healthy);
        self.set_healthy("/pay/health", healthy);
    }
}

async fn answer(State(healthy): State<Arc<Mutex<HashSet<String>>>>, uri: Uri) -> StatusCode {
    if healthy.lock().unwrap().contains(uri.path()) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Poll `condition` every 10ms for up to five seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
