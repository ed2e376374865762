//! Per-task health probe.
//!
//! A probe sleeps its period, issues the task's health request and writes
//! `UP` or `DOWN` to `deployments/{id}/probes/{task}`. The write only lands
//! while the deployment's state key exists; a probe whose deployment is
//! gone stops itself. A stopping probe removes its key.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use flowmesh_core::config::parse_duration;
use flowmesh_core::http::request;
use flowmesh_core::process::{ProcessGraph, Vertex};
use flowmesh_state::{DeploymentKeys, StateResult, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatus {
    Up,
    Down,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        match raw {
            b"UP" => Some(Self::Up),
            b"DOWN" => Some(Self::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskProbe {
    pub deployment_id: String,
    pub task_id: String,
    pub url: String,
    method: Method,
    query: Option<String>,
    pub period: Duration,
    timeout: Duration,
}

impl TaskProbe {
    /// Probe for `vertex`, if it has both a service and health settings.
    pub fn for_vertex(deployment_id: &str, vertex: &Vertex) -> Option<Self> {
        let service = vertex.service.as_ref()?;
        let health = vertex.health.as_ref()?;
        let path = if health.path.starts_with('/') {
            health.path.clone()
        } else {
            format!("/{}", health.path)
        };
        Some(Self {
            deployment_id: deployment_id.to_string(),
            task_id: vertex.id.clone(),
            url: format!("http://{}:{}{path}", service.host, service.port),
            method: Method::from_bytes(health.method.to_ascii_uppercase().as_bytes())
                .unwrap_or(Method::GET),
            query: health.query.clone(),
            period: parse_duration(&health.period).unwrap_or(Duration::from_secs(30)),
            timeout: parse_duration(&health.timeout).unwrap_or(Duration::from_secs(10)),
        })
    }

    pub fn for_graph(deployment_id: &str, graph: &ProcessGraph) -> Vec<Self> {
        graph
            .probed_vertices()
            .filter_map(|v| Self::for_vertex(deployment_id, v))
            .collect()
    }

    pub fn key(&self) -> String {
        DeploymentKeys::new(&self.deployment_id).probe(&self.task_id)
    }

    /// Issue one health request. Any failure reads as DOWN.
    pub async fn check(&self) -> ProbeStatus {
        let body = self.query.clone().map(Bytes::from).unwrap_or_default();
        match request(self.method.clone(), &self.url, &HeaderMap::new(), body, self.timeout).await {
            Ok(_) => ProbeStatus::Up,
            Err(e) => {
                debug!(task = %self.task_id, url = %self.url, error = %e, "health check failed");
                ProbeStatus::Down
            }
        }
    }

    /// Write `status` unless the deployment is gone. Returns false when
    /// the probe is orphaned.
    pub fn record(&self, store: &StateStore, status: ProbeStatus) -> StateResult<bool> {
        store.put_guarded(
            &DeploymentKeys::new(&self.deployment_id).state(),
            &self.key(),
            status.as_str().as_bytes(),
        )
    }

    /// Check and record once. `None` when orphaned.
    pub async fn probe_once(&self, store: &StateStore) -> StateResult<Option<ProbeStatus>> {
        let status = self.check().await;
        if !self.record(store, status)? {
            return Ok(None);
        }
        debug!(deployment_id = %self.deployment_id, task = %self.task_id, status = status.as_str(), "probe");
        Ok(Some(status))
    }
}

/// The probe loop. A stop request lets an in-flight check finish.
pub(crate) async fn run_probe(probe: TaskProbe, store: StateStore, mut stop: watch::Receiver<bool>) {
    debug!(deployment_id = %probe.deployment_id, task = %probe.task_id, url = %probe.url, "probe starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(probe.period) => {
                match probe.probe_once(&store).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!(deployment_id = %probe.deployment_id, task = %probe.task_id, "probe orphaned");
                        break;
                    }
                    Err(e) => {
                        error!(deployment_id = %probe.deployment_id, task = %probe.task_id, error = %e, "probe write failed");
                    }
                }
            }
            _ = stop.changed() => break,
        }
    }
    if let Err(e) = store.delete(&probe.key()) {
        warn!(key = %probe.key(), error = %e, "probe key not removed");
    }
    debug!(deployment_id = %probe.deployment_id, task = %probe.task_id, "probe stopped");
}
