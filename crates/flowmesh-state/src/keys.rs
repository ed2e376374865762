//! Key layout of the coordinator namespace.
//!
//! ```text
//! deployments/{id}/definition        serialized process graph
//! deployments/{id}/state             DeploymentState
//! deployments/{id}/probes/{task}     UP | DOWN
//! instances/{id}/state               InstanceState
//! instances/{id}/parent              owning deployment id
//! instances/{id}/metadata            JSON object of string tags
//! instances/{id}/result              completion body or failure record
//! instances/{id}/content_type        mime type of `result`
//! instances/{id}/headers             saved request headers (recoverable failure)
//! instances/{id}/payload             saved request body (recoverable failure)
//! instances/{id}/failed_task         vertex id of the failing task
//! instances/{id}/failed_url          address the failing call was sent to
//! ingress/{host}                     deployment id bound to a public host
//! ```

pub const DEPLOYMENTS_PREFIX: &str = "deployments/";
pub const INSTANCES_PREFIX: &str = "instances/";
pub const INGRESS_PREFIX: &str = "ingress/";

/// Keys owned by one deployment.
#[derive(Debug, Clone)]
pub struct DeploymentKeys {
    id: String,
}

impl DeploymentKeys {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Prefix covering every key of this deployment.
    pub fn root(&self) -> String {
        format!("{DEPLOYMENTS_PREFIX}{}/", self.id)
    }

    pub fn definition(&self) -> String {
        format!("{}definition", self.root())
    }

    pub fn state(&self) -> String {
        format!("{}state", self.root())
    }

    /// Prefix of the per-task health keys.
    pub fn probes(&self) -> String {
        format!("{}probes/", self.root())
    }

    pub fn probe(&self, task_id: &str) -> String {
        format!("{}{task_id}", self.probes())
    }
}

/// Keys owned by one instance.
#[derive(Debug, Clone)]
pub struct InstanceKeys {
    id: String,
}

impl InstanceKeys {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> String {
        format!("{INSTANCES_PREFIX}{}/", self.id)
    }

    pub fn state(&self) -> String {
        format!("{}state", self.root())
    }

    pub fn parent(&self) -> String {
        format!("{}parent", self.root())
    }

    pub fn metadata(&self) -> String {
        format!("{}metadata", self.root())
    }

    pub fn result(&self) -> String {
        format!("{}result", self.root())
    }

    pub fn content_type(&self) -> String {
        format!("{}content_type", self.root())
    }

    pub fn headers(&self) -> String {
        format!("{}headers", self.root())
    }

    pub fn payload(&self) -> String {
        format!("{}payload", self.root())
    }

    pub fn failed_task(&self) -> String {
        format!("{}failed_task", self.root())
    }

    pub fn failed_url(&self) -> String {
        format!("{}failed_url", self.root())
    }
}

pub fn ingress(host: &str) -> String {
    format!("{INGRESS_PREFIX}{host}")
}

/// Extract the `{id}` segment from a key under `prefix`
/// (`deployments/abc/state` → `abc`).
pub fn id_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    let id = rest.split('/').next()?;
    if id.is_empty() { None } else { Some(id) }
}

/// Extract the task id from a `deployments/{id}/probes/{task}` key.
pub fn probe_task_from_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(DEPLOYMENTS_PREFIX)?;
    let (_, tail) = rest.split_once("/probes/")?;
    if tail.is_empty() || tail.contains('/') {
        None
    } else {
        Some(tail)
    }
}
