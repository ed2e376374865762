//! The command dispatcher: each command is routed to the manager that
//! owns it. Batch commands never fail as a whole; every id gets its own
//! result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::ApiState;
use crate::envelope::{Batch, Envelope, ItemResult};

/// What a batch command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    Deployment,
    Instance,
}

// ── Requests ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Process definition (YAML or JSON).
    pub definition: String,
    /// Persist as STOPPED instead of starting.
    #[serde(default)]
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub kind: Kind,
    pub ids: Vec<String>,
    /// `stop` only: stop a deployment even with live instances.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Deployment id, or an unambiguous part of one.
    pub deployment_id: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub start_event: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsRequest {
    pub kind: Kind,
    /// Empty lists everything.
    #[serde(default)]
    pub ids: Vec<String>,
    /// Instances only: keep those whose metadata carries every pair.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UpdateAction {
    Expose {
        deployment_id: String,
        host: String,
        #[serde(default)]
        switch_from: Option<String>,
    },
    Clear {
        deployment_id: String,
        host: String,
    },
    Subscribe {
        deployment_id: String,
        topic: String,
    },
}

impl UpdateAction {
    /// Key of this action in the update result map.
    pub fn key(&self) -> String {
        match self {
            Self::Expose { host, .. } => format!("expose {host}"),
            Self::Clear { host, .. } => format!("clear {host}"),
            Self::Subscribe { topic, .. } => format!("subscribe {topic}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub actions: Vec<UpdateAction>,
}

// ── Dispatch ───────────────────────────────────────────────────

impl ApiState {
    pub async fn apply(&self, req: ApplyRequest) -> Envelope {
        match self.deployments.apply(req.definition.as_bytes(), req.stopped).await {
            Ok(id) => Envelope::ok("Ok.", &serde_json::json!({ "deployment_id": id })),
            Err(e) => {
                warn!(error = %e, "apply failed");
                Envelope::from_error(&e)
            }
        }
    }

    pub async fn delete(&self, req: BatchRequest) -> Envelope {
        let mut batch = Batch::new();
        for id in req.ids {
            let outcome = match req.kind {
                Kind::Deployment => self.deployments.delete(&id).await,
                Kind::Instance => self.instances.delete(&id),
            };
            batch.insert(id, item(outcome, "Deleted."));
        }
        batch.into()
    }

    /// `start` on instances retries them.
    pub async fn start(&self, req: BatchRequest) -> Envelope {
        let mut batch = Batch::new();
        for id in req.ids {
            let result = match req.kind {
                Kind::Deployment => item(self.deployments.start(&id).await, "Started."),
                Kind::Instance => {
                    let retried = self.instances.retry(&id).await;
                    ItemResult {
                        status: retried.status,
                        message: retried.message,
                    }
                }
            };
            batch.insert(id, result);
        }
        batch.into()
    }

    pub async fn stop(&self, req: BatchRequest) -> Envelope {
        let mut batch = Batch::new();
        for id in req.ids {
            let result = match req.kind {
                Kind::Deployment => item(self.deployments.stop(&id, req.force), "Stopping."),
                Kind::Instance => ItemResult::error(-1, "stopping instances is not implemented"),
            };
            batch.insert(id, result);
        }
        batch.into()
    }

    pub async fn run(&self, req: RunRequest) -> Envelope {
        let deployment_id = match self.deployments.resolve_id(&req.deployment_id) {
            Ok(id) => id,
            Err(e) => return Envelope::from_error(&e),
        };
        let started = self
            .instances
            .run(
                &deployment_id,
                req.start_event.as_deref(),
                &req.args,
                &req.metadata,
            )
            .await;
        match started {
            Ok(instance_id) => {
                info!(%deployment_id, %instance_id, "instance started");
                Envelope::ok("Ok.", &BTreeMap::from([(deployment_id, instance_id)]))
            }
            Err(e) => {
                warn!(%deployment_id, error = %e, "run failed");
                Envelope::from_error(&e)
            }
        }
    }

    /// Map id → full record. A requested id that cannot be described maps
    /// to its `{status, message}` instead.
    pub async fn ps(&self, req: PsRequest) -> Envelope {
        let ids = if req.ids.is_empty() {
            let listed = match req.kind {
                Kind::Deployment => self.deployments.list(),
                Kind::Instance => self.instances.list(),
            };
            match listed {
                Ok(ids) => ids,
                Err(e) => return Envelope::from_error(&e),
            }
        } else {
            req.ids
        };

        let mut records = BTreeMap::new();
        for id in ids {
            let record = match req.kind {
                Kind::Deployment => self
                    .deployments
                    .describe(&id)
                    .map(|r| serde_json::to_value(r).unwrap_or(Value::Null)),
                Kind::Instance => match self.instances.matches_metadata(&id, &req.metadata) {
                    Ok(false) => continue,
                    Ok(true) => self
                        .instances
                        .describe(&id)
                        .map(|r| serde_json::to_value(r).unwrap_or(Value::Null)),
                    Err(e) => Err(e),
                },
            };
            let value = record.unwrap_or_else(|e| {
                serde_json::to_value(ItemResult::from(&e)).unwrap_or(Value::Null)
            });
            records.insert(id, value);
        }
        Envelope::ok("Ok.", &records)
    }

    pub async fn update(&self, req: UpdateRequest) -> Envelope {
        let mut batch = Batch::new();
        for action in req.actions {
            let key = action.key();
            let result = match action {
                UpdateAction::Expose {
                    deployment_id,
                    host,
                    switch_from,
                } => item(
                    self.ingress
                        .expose(&deployment_id, &host, switch_from.as_deref())
                        .await,
                    "Exposed.",
                ),
                UpdateAction::Clear { deployment_id, host } => {
                    item(self.ingress.clear(&deployment_id, &host).await, "Cleared.")
                }
                UpdateAction::Subscribe { .. } => {
                    ItemResult::error(-1, "topic subscription is not implemented")
                }
            };
            batch.insert(key, result);
        }
        batch.into()
    }
}

fn item(outcome: flowmesh_workflow::WorkflowResult<()>, ok: &str) -> ItemResult {
    match outcome {
        Ok(()) => ItemResult::ok(ok),
        Err(e) => ItemResult::from(&e),
    }
}
