//! The HTTP surface every gateway shares.
//!
//! `GET /` answers health checks and `POST /` hands the request to the
//! gateway's [`RoutingStrategy`]. Gateways differ only in the strategy.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use flowmesh_core::BoxFuture;
use flowmesh_core::headers::{self, FLOW_ID, WF_ID};

use crate::error::GatewayResult;
use crate::forward::Outcome;

/// Header echoed back to the caller so traces line up.
const TRACE_ID: &str = "x-b3-traceid";

pub trait RoutingStrategy: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether inbound calls must carry the instance and deployment ids.
    fn requires_ids(&self) -> bool {
        true
    }

    fn route<'a>(&'a self, headers: &'a HeaderMap, body: Bytes) -> BoxFuture<'a, GatewayResult<Outcome>>;
}

pub fn router(strategy: Arc<dyn RoutingStrategy>) -> Router {
    Router::new()
        .route("/", get(health).post(relay))
        .with_state(strategy)
}

/// Serve `strategy` on `listener` until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    strategy: Arc<dyn RoutingStrategy>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(strategy))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn health(State(strategy): State<Arc<dyn RoutingStrategy>>) -> Json<serde_json::Value> {
    Json(json!({ "status": 0, "message": format!("{} ok", strategy.name()) }))
}

async fn relay(
    State(strategy): State<Arc<dyn RoutingStrategy>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if strategy.requires_ids() && headers::flow_ids(&headers).is_none() {
        warn!(gateway = strategy.name(), "call without instance ids rejected");
        return reply(
            StatusCode::BAD_REQUEST,
            -1,
            format!("{FLOW_ID} and {WF_ID} are required"),
            &headers,
        );
    }

    let (status, code, message) = match strategy.route(&headers, body).await {
        Ok(Outcome::Delivered(reply)) => {
            debug!(gateway = strategy.name(), status = %reply.status, "relayed");
            (StatusCode::OK, 0, String::new())
        }
        Ok(Outcome::Published) => (StatusCode::OK, 0, String::new()),
        Ok(Outcome::Reported(e)) => (StatusCode::OK, -1, format!("{e}; failure reported")),
        Ok(Outcome::Unreported(e)) => (StatusCode::BAD_GATEWAY, -1, e.to_string()),
        Err(e) => {
            warn!(gateway = strategy.name(), error = %e, "relay failed");
            (StatusCode::BAD_GATEWAY, -1, e.to_string())
        }
    };
    reply(status, code, message, &headers)
}

fn reply(status: StatusCode, code: i32, message: String, inbound: &HeaderMap) -> Response {
    let mut response = (status, Json(json!({ "status": code, "message": message }))).into_response();
    if let Some(trace) = inbound.get(TRACE_ID) {
        response.headers_mut().insert(TRACE_ID, trace.clone());
    }
    response
}
