//! Header names relayed between task pods, gateways and the daemon.

use http::{HeaderMap, HeaderName, HeaderValue};

/// Instance id. Mandatory on every hop.
pub const FLOW_ID: &str = "x-flow-id";
/// Deployment id. Mandatory on every hop.
pub const WF_ID: &str = "x-rexflow-wf-id";
/// Vertex id of the task that failed, when the reporter knows it.
pub const TASK_ID: &str = "x-rexflow-task-id";
/// Host a failed call was addressed to.
pub const ORIGINAL_HOST: &str = "x-rexflow-original-host";
/// Path a failed call was addressed to.
pub const ORIGINAL_PATH: &str = "x-rexflow-original-path";
/// `CONNECTION_ERROR` or `TASK_ERROR`.
pub const ERROR_CODE: &str = "x-rexflow-error-code";

/// Tracing headers forwarded best-effort.
pub const TRACE_HEADERS: &[&str] = &[
    "x-request-id",
    "x-b3-traceid",
    "x-b3-spanid",
    "x-b3-parentspanid",
    "x-b3-sampled",
    "x-b3-flags",
    "x-ot-span-context",
];

/// Copy the id headers and the tracing allow-list from an inbound request.
pub fn propagate(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in [FLOW_ID, WF_ID].iter().chain(TRACE_HEADERS) {
        if let Some(value) = inbound.get(*name) {
            out.insert(HeaderName::from_static(*name), value.clone());
        }
    }
    out
}

/// Read a header as text, ignoring values that are not visible ASCII.
pub fn get<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Set a header from a string. Values that are not valid header text are
/// skipped.
pub fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// The `(instance id, deployment id)` pair carried by a request, if both
/// headers are present.
pub fn flow_ids(headers: &HeaderMap) -> Option<(String, String)> {
    let flow = get(headers, FLOW_ID)?;
    let wf = get(headers, WF_ID)?;
    Some((flow.to_string(), wf.to_string()))
}
