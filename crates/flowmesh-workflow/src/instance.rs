//! Instance manager — runs, completes, fails and retries instances.
//!
//! ```text
//! STARTING ──▶ RUNNING ──▶ COMPLETED
//!    │            │
//!    ├────────────┴──▶ ERROR                 (not recoverable)
//!    └────────────┴──▶ STOPPING ──▶ STOPPED  (recoverable, payload saved)
//!                                     │ retry
//!                                     ▼
//!                                  STARTING ──▶ RUNNING | STOPPED
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowmesh_core::headers::{self, ERROR_CODE, ORIGINAL_HOST, ORIGINAL_PATH, TASK_ID};
use flowmesh_core::http::{ErrorCode, post_with_attempts};
use flowmesh_core::process::{ProcessGraph, Vertex};
use flowmesh_state::keys::INSTANCES_PREFIX;
use flowmesh_state::{
    Attached, DeploymentKeys, DeploymentState, InstanceKeys, InstanceState, Lifecycle, StateError,
    StateStore,
};

use crate::call::{call_vertex, check_callable, encode_args, task_headers};
use crate::error::{WorkflowError, WorkflowResult};
use crate::load_graph;

/// Headers never saved with a recoverable failure.
const UNSAVED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    ORIGINAL_HOST,
    ORIGINAL_PATH,
    ERROR_CODE,
];

const JSON_MIME: &[u8] = b"application/json";

/// An instance allocated by [`InstanceManager::create`]. Nothing is
/// persisted until it is started.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub deployment_id: String,
    pub graph: ProcessGraph,
}

/// JSON written to `instances/{id}/result` when an instance fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error_code: String,
    pub error_msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_task_name: Option<String>,
    pub input_data: serde_json::Value,
}

impl FailureRecord {
    fn new(code: &str, message: String, task: Option<&Vertex>, input: &[u8]) -> Self {
        let input_data = serde_json::from_slice(input).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(input).into_owned())
        });
        Self {
            error_code: code.to_string(),
            error_msg: message,
            failed_task_id: task.map(|v| v.id.clone()),
            failed_task_name: task.and_then(|v| v.name.clone()),
            input_data,
        }
    }
}

/// What the failure route did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Not recoverable: the instance is now ERROR.
    Errored,
    /// Recoverable: the payload is saved and the instance is STOPPED.
    Stopped,
    /// The instance had already left STARTING / RUNNING.
    Ignored,
}

/// Result of a retry. Retries report a status instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub status: i32,
    pub message: String,
}

#[derive(Clone)]
pub struct InstanceManager {
    store: StateStore,
    call_timeout: Duration,
}

impl InstanceManager {
    pub fn new(store: StateStore, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Start ──────────────────────────────────────────────────────

    /// Allocate a fresh instance of `deployment_id`.
    pub fn create(&self, deployment_id: &str) -> WorkflowResult<Instance> {
        let graph = load_graph(&self.store, deployment_id)?;
        Ok(Instance {
            id: format!("{deployment_id}-{}", Uuid::new_v4().simple()),
            deployment_id: deployment_id.to_string(),
            graph,
        })
    }

    /// Create and start an instance of a RUNNING deployment.
    pub async fn run(
        &self,
        deployment_id: &str,
        start_event: Option<&str>,
        args: &[String],
        metadata: &BTreeMap<String, String>,
    ) -> WorkflowResult<String> {
        self.require_running(deployment_id)?;
        let instance = self.create(deployment_id)?;
        self.start(&instance, start_event, args, metadata).await?;
        Ok(instance.id)
    }

    /// Start `instance`: encode `args` for every task after the entry
    /// point, call them, then move STARTING to RUNNING (or ERROR).
    pub async fn start(
        &self,
        instance: &Instance,
        start_event: Option<&str>,
        args: &[String],
        metadata: &BTreeMap<String, String>,
    ) -> WorkflowResult<()> {
        let entry = instance.graph.resolve_entry(start_event)?;
        let mut calls = Vec::new();
        for target in instance.graph.callable_successors(entry) {
            let serialization = check_callable(target)?;
            let body = encode_args(args, serialization)?;
            calls.push((target, Bytes::from(body), serialization.mime_type().to_string()));
        }
        self.launch(instance, calls, metadata).await
    }

    /// Start an instance of a RUNNING deployment from a raw payload, as a
    /// catch gateway in start mode does.
    pub async fn start_with_payload(
        &self,
        deployment_id: &str,
        start_event: Option<&str>,
        body: Bytes,
        content_type: Option<&str>,
    ) -> WorkflowResult<String> {
        self.require_running(deployment_id)?;
        let instance = self.create(deployment_id)?;
        let entry = instance.graph.resolve_entry(start_event)?;
        let mut calls = Vec::new();
        for target in instance.graph.callable_successors(entry) {
            let serialization = check_callable(target)?;
            let mime = content_type.unwrap_or(serialization.mime_type()).to_string();
            calls.push((target, body.clone(), mime));
        }
        self.launch(&instance, calls, &BTreeMap::new()).await?;
        Ok(instance.id)
    }

    fn require_running(&self, deployment_id: &str) -> WorkflowResult<()> {
        let state = self
            .store
            .get_state::<DeploymentState>(&DeploymentKeys::new(deployment_id).state())?;
        match state {
            Some(DeploymentState::Running) => Ok(()),
            Some(other) => Err(WorkflowError::NotRunning {
                id: deployment_id.to_string(),
                state: other.to_string(),
            }),
            None => Err(WorkflowError::NotFound(format!("deployment {deployment_id}"))),
        }
    }

    async fn launch(
        &self,
        instance: &Instance,
        calls: Vec<(&Vertex, Bytes, String)>,
        metadata: &BTreeMap<String, String>,
    ) -> WorkflowResult<()> {
        let keys = InstanceKeys::new(&instance.id);
        if !self
            .store
            .put_if_absent(&keys.state(), InstanceState::Starting.as_str().as_bytes())?
        {
            return Err(WorkflowError::AlreadyExists(instance.id.clone()));
        }
        self.store
            .put(&keys.parent(), instance.deployment_id.as_bytes())?;
        let mut tags = instance.graph.properties.user_metadata.clone();
        tags.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.store.put_json(&keys.metadata(), &tags)?;
        info!(instance_id = %instance.id, deployment_id = %instance.deployment_id, "instance starting");

        for (target, body, mime) in calls {
            let headers = task_headers(&instance.id, &instance.deployment_id, &target.id, &mime);
            if let Err(source) = call_vertex(target, &headers, body.clone(), self.call_timeout).await
            {
                error!(instance_id = %instance.id, task = %target.id, error = %source, "instance failed to start");
                let record = encode(&FailureRecord::new(
                    source.code().as_str(),
                    source.to_string(),
                    Some(target),
                    &body,
                ))?;
                let (result_key, content_type_key) = (keys.result(), keys.content_type());
                self.store.transition_with(
                    &keys.state(),
                    &[InstanceState::Starting],
                    InstanceState::Error,
                    &[
                        Attached::Put(&result_key, &record),
                        Attached::Put(&content_type_key, JSON_MIME),
                    ],
                )?;
                return Err(WorkflowError::Call {
                    instance_id: instance.id.clone(),
                    source,
                });
            }
        }

        if !self.store.transition(
            &keys.state(),
            &[InstanceState::Starting],
            InstanceState::Running,
        )? {
            // A fast chain may already have completed or failed the instance.
            debug!(instance_id = %instance.id, "instance left STARTING before promotion");
        }
        Ok(())
    }

    // ── Completion and failure ─────────────────────────────────────

    /// Completion callback. Returns whether the result was recorded. The
    /// result is committed together with COMPLETED, so a COMPLETED instance
    /// always has one.
    pub fn complete(
        &self,
        instance_id: &str,
        body: &[u8],
        content_type: Option<&str>,
    ) -> WorkflowResult<bool> {
        let keys = InstanceKeys::new(instance_id);
        let (result_key, content_type_key) = (keys.result(), keys.content_type());
        let content_type = match content_type {
            Some(mime) => Attached::Put(&content_type_key, mime.as_bytes()),
            None => Attached::Delete(&content_type_key),
        };
        if !self.store.transition_with(
            &keys.state(),
            &[InstanceState::Starting, InstanceState::Running],
            InstanceState::Completed,
            &[Attached::Put(&result_key, body), content_type],
        )? {
            error!(%instance_id, "completion dropped: instance not active");
            return Ok(false);
        }
        info!(%instance_id, "instance completed");
        Ok(true)
    }

    /// Failure callback. `body` is the payload of the call that failed.
    pub fn fail(&self, request: &HeaderMap, body: &[u8]) -> WorkflowResult<FailOutcome> {
        let (instance_id, deployment_id) =
            headers::flow_ids(request).ok_or(WorkflowError::MissingIds)?;
        let graph = load_graph(&self.store, &deployment_id)?;
        let keys = InstanceKeys::new(&instance_id);

        let task = failed_task(&graph, request);
        let code = headers::get(request, ERROR_CODE)
            .unwrap_or(ErrorCode::Task.as_str())
            .to_string();
        let target = original_url(request);
        let message = match (&task, &target) {
            (Some(task), _) => format!("Task {} failed.", task.id),
            (None, Some(url)) => format!("Call to {url} failed."),
            (None, None) => format!("Instance {instance_id} failed."),
        };
        let record = encode(&FailureRecord::new(&code, message, task, body))?;
        let saved = encode(&saved_headers(request))?;
        let url = target.or_else(|| task.and_then(|t| t.service.as_ref()).map(|s| s.url()));
        let active = [InstanceState::Starting, InstanceState::Running];
        let (result_key, content_type_key) = (keys.result(), keys.content_type());
        let (headers_key, payload_key) = (keys.headers(), keys.payload());
        let (task_key, url_key) = (keys.failed_task(), keys.failed_url());
        let mut writes = vec![
            Attached::Put(&result_key, &record),
            Attached::Put(&content_type_key, JSON_MIME),
        ];

        if !graph.properties.is_recoverable {
            if !self
                .store
                .transition_with(&keys.state(), &active, InstanceState::Error, &writes)?
            {
                warn!(%instance_id, "failure ignored: instance not active");
                return Ok(FailOutcome::Ignored);
            }
            info!(%instance_id, %code, "instance failed");
            return Ok(FailOutcome::Errored);
        }

        // Recoverable: keep what a retry needs.
        writes.push(Attached::Put(&headers_key, &saved));
        writes.push(Attached::Put(&payload_key, body));
        if let Some(task) = task {
            writes.push(Attached::Put(&task_key, task.id.as_bytes()));
        }
        if let Some(url) = &url {
            writes.push(Attached::Put(&url_key, url.as_bytes()));
        }
        if !self
            .store
            .transition_with(&keys.state(), &active, InstanceState::Stopping, &writes)?
        {
            warn!(%instance_id, "failure ignored: instance not active");
            return Ok(FailOutcome::Ignored);
        }
        if !self.store.transition(
            &keys.state(),
            &[InstanceState::Stopping],
            InstanceState::Stopped,
        )? {
            error!(%instance_id, "recoverable failure left instance STOPPING");
            return Ok(FailOutcome::Ignored);
        }
        info!(%instance_id, %code, "instance stopped with payload saved");
        Ok(FailOutcome::Stopped)
    }

    // ── Retry ──────────────────────────────────────────────────────

    /// Reissue the saved payload of a STOPPED instance to the task that
    /// failed.
    pub async fn retry(&self, instance_id: &str) -> RetryOutcome {
        match self.try_retry(instance_id).await {
            Ok(message) => RetryOutcome { status: 0, message },
            Err(e) => {
                warn!(%instance_id, error = %e, "retry failed");
                RetryOutcome {
                    status: e.status(),
                    message: e.to_string(),
                }
            }
        }
    }

    async fn try_retry(&self, instance_id: &str) -> WorkflowResult<String> {
        let keys = InstanceKeys::new(instance_id);
        let state = self
            .store
            .get_state::<InstanceState>(&keys.state())?
            .ok_or_else(|| WorkflowError::NotFound(format!("instance {instance_id}")))?;
        if state != InstanceState::Stopped {
            return Err(WorkflowError::NotRetryable {
                id: instance_id.to_string(),
                state: state.to_string(),
            });
        }

        // Everything a recoverable failure left behind. Only the caller that
        // wins STOPPED -> STARTING clears it, in the same transaction.
        let failure: Vec<(String, Option<Vec<u8>>)> = [
            keys.payload(),
            keys.headers(),
            keys.failed_task(),
            keys.failed_url(),
            keys.result(),
            keys.content_type(),
        ]
        .into_iter()
        .map(|key| -> WorkflowResult<(String, Option<Vec<u8>>)> {
            let value = self.store.get(&key)?;
            Ok((key, value))
        })
        .collect::<WorkflowResult<_>>()?;
        let field = |key: String| {
            failure
                .iter()
                .find(|(k, _)| *k == key)
                .and_then(|(_, v)| v.as_deref())
        };
        let no_payload = || WorkflowError::NotRetryable {
            id: instance_id.to_string(),
            state: "STOPPED without a saved payload".to_string(),
        };
        let payload = field(keys.payload()).ok_or_else(no_payload)?.to_vec();
        let url = field(keys.failed_url())
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .ok_or_else(no_payload)?;
        let saved: BTreeMap<String, String> = match field(keys.headers()) {
            Some(raw) => serde_json::from_slice(raw)
                .map_err(|e| StateError::Deserialize(e.to_string()))?,
            None => BTreeMap::new(),
        };
        let attempts = self.retry_attempts(&keys)?;

        let clear: Vec<Attached<'_>> = failure
            .iter()
            .map(|(key, _)| Attached::Delete(key))
            .collect();
        if !self.store.transition_with(
            &keys.state(),
            &[InstanceState::Stopped],
            InstanceState::Starting,
            &clear,
        )? {
            return Err(WorkflowError::NotRetryable {
                id: instance_id.to_string(),
                state: self
                    .store
                    .get_string(&keys.state())?
                    .unwrap_or_else(|| "ABSENT".to_string()),
            });
        }
        info!(%instance_id, %url, "retrying instance");

        let headers = restore_headers(&saved);
        match post_with_attempts(&url, &headers, Bytes::from(payload), attempts, self.call_timeout)
            .await
        {
            Ok(_) => {
                self.store.transition(
                    &keys.state(),
                    &[InstanceState::Starting],
                    InstanceState::Running,
                )?;
                Ok(format!("retried {instance_id} against {url}"))
            }
            Err(source) => {
                let restore: Vec<Attached<'_>> = failure
                    .iter()
                    .filter_map(|(key, value)| Some(Attached::Put(key, value.as_deref()?)))
                    .collect();
                self.store.transition_with(
                    &keys.state(),
                    &[InstanceState::Starting],
                    InstanceState::Stopped,
                    &restore,
                )?;
                Err(WorkflowError::Call {
                    instance_id: instance_id.to_string(),
                    source,
                })
            }
        }
    }

    fn retry_attempts(&self, keys: &InstanceKeys) -> WorkflowResult<u32> {
        let Some(task) = self.store.get_string(&keys.failed_task())? else {
            return Ok(1);
        };
        let Some(parent) = self.store.get_string(&keys.parent())? else {
            return Ok(1);
        };
        let graph = load_graph(&self.store, &parent)?;
        Ok(graph.vertex(&task).map_or(1, |v| v.call.total_attempts))
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn state(&self, instance_id: &str) -> WorkflowResult<Option<InstanceState>> {
        Ok(self
            .store
            .get_state::<InstanceState>(&InstanceKeys::new(instance_id).state())?)
    }

    pub fn list(&self) -> WorkflowResult<Vec<String>> {
        Ok(self.store.next_level(INSTANCES_PREFIX)?)
    }

    /// Every persisted field of an instance, keyed by field name.
    /// `metadata` and `headers` are decoded; a JSON `result` is decoded
    /// too.
    pub fn describe(&self, instance_id: &str) -> WorkflowResult<BTreeMap<String, serde_json::Value>> {
        let keys = InstanceKeys::new(instance_id);
        let root = keys.root();
        let entries = self.store.get_prefix(&root)?;
        if entries.is_empty() {
            return Err(WorkflowError::NotFound(format!("instance {instance_id}")));
        }
        let json_result = entries.iter().any(|(key, value)| {
            *key == keys.content_type() && value.as_slice() == b"application/json"
        });

        let mut record = BTreeMap::new();
        for (key, value) in entries {
            let field = key[root.len()..].to_string();
            let decode = matches!(field.as_str(), "metadata" | "headers")
                || (field == "result" && json_result);
            let text = String::from_utf8_lossy(&value).into_owned();
            let parsed = if decode {
                serde_json::from_slice(&value).unwrap_or(serde_json::Value::String(text))
            } else {
                serde_json::Value::String(text)
            };
            record.insert(field, parsed);
        }
        Ok(record)
    }

    /// Whether the instance's metadata carries every `filter` pair.
    pub fn matches_metadata(
        &self,
        instance_id: &str,
        filter: &BTreeMap<String, String>,
    ) -> WorkflowResult<bool> {
        if filter.is_empty() {
            return Ok(true);
        }
        let tags: BTreeMap<String, String> = self
            .store
            .get_json(&InstanceKeys::new(instance_id).metadata())?
            .unwrap_or_default();
        Ok(filter.iter().all(|(k, v)| tags.get(k) == Some(v)))
    }

    /// Delete a COMPLETED, ERROR or STOPPED instance.
    pub fn delete(&self, instance_id: &str) -> WorkflowResult<()> {
        let keys = InstanceKeys::new(instance_id);
        let Some(raw) = self.store.get_string(&keys.state())? else {
            return Err(WorkflowError::NotFound(format!("instance {instance_id}")));
        };
        if !InstanceState::parse(&raw).is_some_and(|s| s.is_terminal()) {
            return Err(WorkflowError::NotDeletable {
                id: instance_id.to_string(),
                state: raw,
            });
        }
        if !self.store.delete_prefix(&keys.root())? {
            return Err(WorkflowError::IncompleteDelete(instance_id.to_string()));
        }
        info!(%instance_id, "instance deleted");
        Ok(())
    }
}

/// Ids of the instances of `deployment_id` that are not COMPLETED or ERROR.
pub fn live_instances_of(store: &StateStore, deployment_id: &str) -> WorkflowResult<Vec<String>> {
    let prefix = format!("{INSTANCES_PREFIX}{deployment_id}-");
    let mut live = Vec::new();
    for suffix in store.next_level(&prefix)? {
        let id = format!("{deployment_id}-{suffix}");
        let keys = InstanceKeys::new(&id);
        if store.get_string(&keys.parent())?.as_deref() != Some(deployment_id) {
            continue;
        }
        let state = store.get_state::<InstanceState>(&keys.state())?;
        if state.is_none_or(|s| s.is_live()) {
            live.push(id);
        }
    }
    Ok(live)
}

fn encode<T: Serialize>(value: &T) -> WorkflowResult<Vec<u8>> {
    Ok(serde_json::to_vec(value).map_err(|e| StateError::Serialize(e.to_string()))?)
}

fn failed_task<'g>(graph: &'g ProcessGraph, request: &HeaderMap) -> Option<&'g Vertex> {
    if let Some(task) = headers::get(request, TASK_ID).and_then(|id| graph.vertex(id)) {
        return Some(task);
    }
    let host = headers::get(request, ORIGINAL_HOST)?;
    let path = headers::get(request, ORIGINAL_PATH).unwrap_or("/");
    graph.vertex_by_endpoint(host, path)
}

fn original_url(request: &HeaderMap) -> Option<String> {
    let host = headers::get(request, ORIGINAL_HOST)?;
    let path = headers::get(request, ORIGINAL_PATH).unwrap_or("/");
    Some(format!("http://{host}{path}"))
}

fn saved_headers(request: &HeaderMap) -> BTreeMap<String, String> {
    request
        .iter()
        .filter(|(name, _)| !UNSAVED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

fn restore_headers(saved: &BTreeMap<String, String>) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in saved {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.insert(name, value);
        }
    }
    if !out.contains_key(CONTENT_TYPE) {
        out.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    out
}
