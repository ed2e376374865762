//! Process graph consumed by the deployment and instance managers.
//!
//! A graph is produced upstream (BPMN translation is not flowmesh's job)
//! and submitted as YAML or JSON:
//!
//! ```yaml
//! id: order
//! properties:
//!   orchestrator: kubernetes
//!   is_recoverable: true
//! vertices:
//!   - id: start
//!     type: start_event
//!     successors: [validate]
//!   - id: validate
//!     type: task
//!     service: { host: validate.order, port: 5000, path: /validate }
//!     health: { path: /health }
//!     successors: [end]
//!   - id: end
//!     type: end_event
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ProcessError;

/// Process id reserved for the daemon itself.
pub const RESERVED_PROCESS_ID: &str = "flow";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessGraph {
    pub id: String,
    #[serde(default)]
    pub properties: ProcessProperties,
    pub vertices: Vec<Vertex>,
    /// Pre-rendered deployment manifests for the target orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessProperties {
    #[serde(default)]
    pub orchestrator: OrchestratorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Failed instances pause with their payload saved instead of erroring.
    #[serde(default)]
    pub is_recoverable: bool,
    /// Default tags merged into every instance's metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorKind {
    Docker,
    #[default]
    Kubernetes,
    Istio,
}

impl OrchestratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
            Self::Istio => "istio",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vertex {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: VertexKind,
    #[serde(default)]
    pub successors: Vec<String>,
    /// Network endpoint, for vertices deployed as a service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceProperties>,
    #[serde(default)]
    pub call: CallProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthProperties>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VertexKind {
    StartEvent,
    EndEvent,
    Task,
    ExclusiveGateway,
    ParallelGateway,
    ThrowEvent { topic: String },
    CatchEvent { topic: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceProperties {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
}

impl ServiceProperties {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }
}

/// How a vertex is called by its predecessor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallProperties {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_serialization")]
    pub serialization: String,
    #[serde(default = "default_attempts")]
    pub total_attempts: u32,
}

impl Default for CallProperties {
    fn default() -> Self {
        Self {
            method: default_method(),
            serialization: default_serialization(),
            total_attempts: default_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthProperties {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

fn default_port() -> u16 {
    80
}
fn default_path() -> String {
    "/".to_string()
}
fn default_method() -> String {
    "POST".to_string()
}
fn default_serialization() -> String {
    "json".to_string()
}
fn default_attempts() -> u32 {
    2
}
fn default_health_path() -> String {
    "/".to_string()
}
fn default_health_method() -> String {
    "GET".to_string()
}
fn default_period() -> String {
    "30s".to_string()
}
fn default_timeout() -> String {
    "10s".to_string()
}

/// Body encodings a task may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    Json,
    Yaml,
}

impl Serialization {
    pub fn parse(raw: &str) -> Result<Self, ProcessError> {
        match raw.to_ascii_lowercase().as_str() {
            "json" | "application/json" => Ok(Self::Json),
            "yaml" | "application/x-yaml" | "application/yaml" => Ok(Self::Yaml),
            other => Err(ProcessError::UnsupportedSerialization(other.to_string())),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Yaml => "application/x-yaml",
        }
    }

    pub fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, ProcessError> {
        match self {
            Self::Json => {
                serde_json::to_vec(value).map_err(|e| ProcessError::Parse(e.to_string()))
            }
            Self::Yaml => serde_yaml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| ProcessError::Parse(e.to_string())),
        }
    }
}

impl ProcessGraph {
    /// Parse a YAML or JSON definition and validate it.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ProcessError> {
        let graph: ProcessGraph =
            serde_yaml::from_slice(raw).map_err(|e| ProcessError::Parse(e.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }

    /// Canonical encoding persisted at `deployments/{id}/definition`.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, ProcessError> {
        serde_json::to_vec(self).map_err(|e| ProcessError::Parse(e.to_string()))
    }

    /// `{process id}-{first 16 hex digits of sha256(canonical definition)}`.
    pub fn deployment_id(&self) -> Result<String, ProcessError> {
        let digest = Sha256::digest(self.to_canonical_bytes()?);
        let hash = hex::encode(digest);
        Ok(format!("{}-{}", self.id, &hash[..16]))
    }

    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.id.is_empty() {
            return Err(ProcessError::Invalid("process id is empty".into()));
        }
        if self.id == RESERVED_PROCESS_ID {
            return Err(ProcessError::Invalid(format!(
                "process id '{RESERVED_PROCESS_ID}' is reserved"
            )));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ProcessError::Invalid(format!(
                "process id '{}' must be lowercase alphanumeric or '-'",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for vertex in &self.vertices {
            if !seen.insert(vertex.id.as_str()) {
                return Err(ProcessError::Invalid(format!(
                    "duplicate vertex id '{}'",
                    vertex.id
                )));
            }
        }
        for vertex in &self.vertices {
            for successor in &vertex.successors {
                if !seen.contains(successor.as_str()) {
                    return Err(ProcessError::Invalid(format!(
                        "vertex '{}' points at unknown vertex '{successor}'",
                        vertex.id
                    )));
                }
            }
            if vertex.kind == VertexKind::Task && vertex.service.is_none() {
                return Err(ProcessError::Invalid(format!(
                    "task '{}' has no service endpoint",
                    vertex.id
                )));
            }
            if vertex.call.total_attempts == 0 {
                return Err(ProcessError::Invalid(format!(
                    "vertex '{}' has a zero attempt budget",
                    vertex.id
                )));
            }
        }
        if self.entry_points().next().is_none() {
            return Err(ProcessError::Invalid("process has no start event".into()));
        }
        Ok(())
    }

    pub fn vertex(&self, id: &str) -> Option<&Vertex> {
        self.vertices.iter().find(|v| v.id == id)
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices
            .iter()
            .filter(|v| v.kind == VertexKind::StartEvent)
    }

    /// Pick the start event to run. With several start events one must be
    /// named.
    pub fn resolve_entry(&self, requested: Option<&str>) -> Result<&Vertex, ProcessError> {
        if let Some(id) = requested {
            return self
                .entry_points()
                .find(|v| v.id == id)
                .ok_or_else(|| ProcessError::UnknownEntryPoint(id.to_string()));
        }
        let entries: Vec<&Vertex> = self.entry_points().collect();
        match entries.as_slice() {
            [only] => Ok(*only),
            _ => Err(ProcessError::AmbiguousEntryPoint(
                entries
                    .iter()
                    .map(|v| v.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    pub fn successors<'a>(&'a self, vertex: &'a Vertex) -> impl Iterator<Item = &'a Vertex> + 'a {
        vertex.successors.iter().filter_map(|id| self.vertex(id))
    }

    /// Successors of `vertex` reachable over HTTP.
    pub fn callable_successors<'a>(
        &'a self,
        vertex: &'a Vertex,
    ) -> impl Iterator<Item = &'a Vertex> + 'a {
        self.successors(vertex).filter(|v| v.service.is_some())
    }

    /// Topics that must exist before the process runs.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .vertices
            .iter()
            .filter_map(|v| match &v.kind {
                VertexKind::ThrowEvent { topic } | VertexKind::CatchEvent { topic } => {
                    Some(topic.clone())
                }
                _ => None,
            })
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Vertices the health reconciler probes.
    pub fn probed_vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices
            .iter()
            .filter(|v| v.service.is_some() && v.health.is_some())
    }

    /// The vertex whose service answers at `host` and `path`. The host may
    /// carry a port.
    pub fn vertex_by_endpoint(&self, host: &str, path: &str) -> Option<&Vertex> {
        let bare = host.split(':').next().unwrap_or(host);
        self.vertices.iter().find(|v| {
            v.service
                .as_ref()
                .is_some_and(|s| (s.host == host || s.host == bare) && s.path == path)
        })
    }
}
