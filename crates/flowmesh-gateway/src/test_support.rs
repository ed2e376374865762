//! A loopback next hop that records what it receives.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};

#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub body: String,
    pub headers: HeaderMap,
}

impl Received {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Clone, Default)]
struct HopState {
    received: Arc<Mutex<HashMap<String, Vec<Received>>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

/// Answers 200 on every path except those marked failing, which get 500.
pub(crate) struct Hop {
    pub addr: SocketAddr,
    state: HopState,
}

impl Hop {
    pub async fn start() -> Self {
        let state = HopState::default();
        let router = Router::new().fallback(record).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn fail(&self, path: &str) {
        self.state.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn received(&self, path: &str) -> Vec<Received> {
        self.state
            .received
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.received(path).len()
    }
}

async fn record(State(state): State<HopState>, uri: Uri, headers: HeaderMap, body: Bytes) -> StatusCode {
    state
        .received
        .lock()
        .unwrap()
        .entry(uri.path().to_string())
        .or_default()
        .push(Received {
            body: String::from_utf8_lossy(&body).into_owned(),
            headers,
        });
    if state.failing.lock().unwrap().contains(uri.path()) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
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
