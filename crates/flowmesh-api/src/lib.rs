//! flowmesh-api — command surface of the flowmesh daemon.
//!
//! Every route answers with an [`Envelope`]: `{status, message, data}`
//! where `status` is `0` or negative and `data` is a JSON string. Batch
//! commands report per id inside `data`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/apply` | Persist a process definition and start it |
//! | POST | `/api/v1/delete` | Delete deployments or instances |
//! | POST | `/api/v1/run` | Start an instance of a RUNNING deployment |
//! | POST | `/api/v1/start` | Start deployments, retry STOPPED instances |
//! | POST | `/api/v1/stop` | Request deployments stop |
//! | POST | `/api/v1/ps` | Describe deployments or instances |
//! | POST | `/api/v1/update` | Expose or clear ingress hosts |
//! | POST | `/api/v1/deployments/{id}/instances` | Start an instance from a raw payload |
//! | POST | `/` | Completion callback (`x-flow-id`) |
//! | POST | `/instancefail` | Failure callback |
//! | GET | `/health` | Daemon health |
//! | GET | `/wfmap` | Process id → deployment id → entry URLs |
//! | POST | `/probe/{id}` | Probe one deployment now (`all` for every one) |

pub mod commands;
pub mod envelope;
pub mod handlers;

pub use commands::{
    ApplyRequest, BatchRequest, Kind, PsRequest, RunRequest, UpdateAction, UpdateRequest,
};
pub use envelope::{Batch, Envelope, ItemResult};

use axum::Router;
use axum::routing::{get, post};

use flowmesh_health::HealthReconciler;
use flowmesh_workflow::{DeploymentManager, IngressManager, InstanceManager};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub deployments: DeploymentManager,
    pub instances: InstanceManager,
    pub ingress: IngressManager,
    /// Absent when the daemon runs without a reconciler.
    pub health: Option<HealthReconciler>,
}

/// Build the complete daemon router.
pub fn build_router(state: ApiState) -> Router {
    let commands = Router::new()
        .route("/apply", post(handlers::apply))
        .route("/delete", post(handlers::delete))
        .route("/run", post(handlers::run))
        .route("/start", post(handlers::start))
        .route("/stop", post(handlers::stop))
        .route("/ps", post(handlers::ps))
        .route("/update", post(handlers::update))
        .route("/deployments/{id}/instances", post(handlers::start_instance));

    Router::new()
        .nest("/api/v1", commands)
        .route("/", post(handlers::complete))
        .route("/instancefail", post(handlers::instance_failed))
        .route("/health", get(handlers::health))
        .route("/wfmap", get(handlers::wf_map).post(handlers::wf_map))
        .route("/probe/{id}", post(handlers::probe))
        .with_state(state)
}
