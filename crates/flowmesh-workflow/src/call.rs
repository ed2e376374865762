//! Task-call protocol used when the daemon itself starts or resumes an
//! instance: argument encoding, id headers, attempt budget.

use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use http::header::CONTENT_TYPE;

use flowmesh_core::CallError;
use flowmesh_core::headers::{self, FLOW_ID, TASK_ID, WF_ID};
use flowmesh_core::http::{HttpReply, post_with_attempts};
use flowmesh_core::process::{Serialization, Vertex};

use crate::error::{WorkflowError, WorkflowResult};

/// Check that `vertex` can be called by the daemon and return its body
/// encoding. Only POST is supported.
pub fn check_callable(vertex: &Vertex) -> WorkflowResult<Serialization> {
    if !vertex.call.method.eq_ignore_ascii_case("POST") {
        return Err(WorkflowError::UnsupportedMethod(vertex.call.method.clone()));
    }
    Ok(Serialization::parse(&vertex.call.serialization)?)
}

/// Encode run arguments as an array. Each argument is taken as a JSON
/// literal when it parses as one (`42`, `{"a":1}`), else as a string.
pub fn encode_args(args: &[String], serialization: Serialization) -> WorkflowResult<Vec<u8>> {
    let values: Vec<serde_json::Value> = args
        .iter()
        .map(|arg| {
            serde_json::from_str(arg).unwrap_or_else(|_| serde_json::Value::String(arg.clone()))
        })
        .collect();
    Ok(serialization.encode(&serde_json::Value::Array(values))?)
}

/// Headers of a daemon-issued call into a task.
pub fn task_headers(
    instance_id: &str,
    deployment_id: &str,
    task_id: &str,
    content_type: &str,
) -> HeaderMap {
    let mut out = HeaderMap::new();
    headers::set(&mut out, FLOW_ID, instance_id);
    headers::set(&mut out, WF_ID, deployment_id);
    headers::set(&mut out, TASK_ID, task_id);
    if let Ok(value) = content_type.parse() {
        out.insert(CONTENT_TYPE, value);
    }
    out
}

/// POST `body` to `vertex` with its declared attempt budget.
pub async fn call_vertex(
    vertex: &Vertex,
    headers: &HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> Result<HttpReply, CallError> {
    let Some(service) = &vertex.service else {
        return Err(CallError::InvalidUrl(format!("vertex {} has no service", vertex.id)));
    };
    post_with_attempts(
        &service.url(),
        headers,
        body,
        vertex.call.total_attempts,
        timeout,
    )
    .await
}
