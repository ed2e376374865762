//! axum handlers. Command routes deserialize a request and hand it to the
//! dispatcher; callback routes serve the task pods and gateways.

use std::collections::BTreeMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use flowmesh_core::headers::{self, FLOW_ID};
use flowmesh_health::HealthError;
use flowmesh_workflow::FailOutcome;

use crate::ApiState;
use crate::commands::{ApplyRequest, BatchRequest, PsRequest, RunRequest, UpdateRequest};
use crate::envelope::Envelope;

// ── Commands ───────────────────────────────────────────────────

/// JSON command body. A body that does not deserialize is answered with a
/// `-1` envelope instead of axum's plain-text rejection.
#[derive(Debug)]
pub struct Command<T>(pub T);

impl<T, S> FromRequest<S> for Command<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = Envelope;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                let message = rejection.body_text();
                warn!(status = %rejection.status(), %message, "command body rejected");
                Err(Envelope::error(-1, message))
            }
        }
    }
}

/// POST /api/v1/apply
pub async fn apply(State(state): State<ApiState>, Command(req): Command<ApplyRequest>) -> Envelope {
    state.apply(req).await
}

/// POST /api/v1/delete
pub async fn delete(State(state): State<ApiState>, Command(req): Command<BatchRequest>) -> Envelope {
    state.delete(req).await
}

/// POST /api/v1/run
pub async fn run(State(state): State<ApiState>, Command(req): Command<RunRequest>) -> Envelope {
    state.run(req).await
}

/// POST /api/v1/start
pub async fn start(State(state): State<ApiState>, Command(req): Command<BatchRequest>) -> Envelope {
    state.start(req).await
}

/// POST /api/v1/stop
pub async fn stop(State(state): State<ApiState>, Command(req): Command<BatchRequest>) -> Envelope {
    state.stop(req).await
}

/// POST /api/v1/ps
pub async fn ps(State(state): State<ApiState>, Command(req): Command<PsRequest>) -> Envelope {
    state.ps(req).await
}

/// POST /api/v1/update
pub async fn update(State(state): State<ApiState>, Command(req): Command<UpdateRequest>) -> Envelope {
    state.update(req).await
}

#[derive(Debug, Default, Deserialize)]
pub struct StartEventQuery {
    pub start_event: Option<String>,
}

/// POST /api/v1/deployments/{id}/instances
///
/// Start an instance from a raw payload.
pub async fn start_instance(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
    Query(query): Query<StartEventQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Envelope {
    let content_type = headers::get(&headers, "content-type");
    match state
        .instances
        .start_with_payload(&deployment_id, query.start_event.as_deref(), body, content_type)
        .await
    {
        Ok(instance_id) => Envelope::ok(
            "Ok.",
            &BTreeMap::from([(deployment_id, instance_id)]),
        ),
        Err(e) => {
            warn!(%deployment_id, error = %e, "start event not relayed");
            Envelope::from_error(&e)
        }
    }
}

// ── Callbacks ──────────────────────────────────────────────────

/// POST /
///
/// Completion callback from the last task of an instance.
pub async fn complete(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Envelope {
    let Some(instance_id) = headers::get(&headers, FLOW_ID) else {
        return Envelope::error(-1, format!("{FLOW_ID} is required"));
    };
    let content_type = headers::get(&headers, "content-type");
    match state.instances.complete(instance_id, &body, content_type) {
        Ok(true) => Envelope::ok("Ok.", &serde_json::json!({})),
        Ok(false) => Envelope::error(-2, format!("{instance_id} is not active")),
        Err(e) => Envelope::from_error(&e),
    }
}

/// POST /instancefail
pub async fn instance_failed(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Envelope {
    match state.instances.fail(&headers, &body) {
        Ok(outcome) => {
            let message = match outcome {
                FailOutcome::Errored => "Instance errored.",
                FailOutcome::Stopped => "Instance stopped.",
                FailOutcome::Ignored => "Instance no longer active.",
            };
            debug!(flow_id = ?headers::get(&headers, FLOW_ID), ?outcome, "failure recorded");
            Envelope::ok(message, &serde_json::json!({}))
        }
        Err(e) => {
            warn!(error = %e, "failure report rejected");
            Envelope::from_error(&e)
        }
    }
}

// ── Daemon ─────────────────────────────────────────────────────

/// GET /health
pub async fn health(State(state): State<ApiState>) -> Envelope {
    match state.deployments.list() {
        Ok(_) => Envelope::ok("Ok.", &serde_json::json!({})),
        Err(e) => Envelope::from_error(&e),
    }
}

/// GET /wfmap
pub async fn wf_map(State(state): State<ApiState>) -> Envelope {
    match state.deployments.workflow_map() {
        Ok(map) => Envelope::ok("Ok.", &map),
        Err(e) => Envelope::from_error(&e),
    }
}

/// POST /probe/{id}
///
/// One immediate probe round for a deployment, or for every probed
/// deployment when `id` is `all`.
pub async fn probe(State(state): State<ApiState>, Path(target): Path<String>) -> Envelope {
    let Some(health) = &state.health else {
        return Envelope::error(-1, "health reconciler is not running");
    };
    match health.probe_now(&target).await {
        Ok(report) => Envelope::ok("Ok.", &report),
        Err(HealthError::NotProbed(id)) => Envelope::error(-1, format!("no probes running for {id}")),
        Err(e) => Envelope::error(-1, e.to_string()),
    }
}
