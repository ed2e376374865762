//! The response envelope every command and callback answers with.
//!
//! `status` is `0` on success and negative on error (see
//! [`WorkflowError::status`]); `data` is itself a JSON document encoded
//! as a string.

use std::collections::BTreeMap;

use axum::Json;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::error;

use flowmesh_workflow::WorkflowError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: i32,
    pub message: String,
    pub data: String,
}

impl Envelope {
    pub fn ok(message: impl Into<String>, data: &impl Serialize) -> Self {
        match serde_json::to_string(data) {
            Ok(data) => Self {
                status: 0,
                message: message.into(),
                data,
            },
            Err(e) => {
                error!(error = %e, "response data not serializable");
                Self::error(-1, format!("response data not serializable: {e}"))
            }
        }
    }

    pub fn error(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: "{}".to_string(),
        }
    }

    pub fn from_error(e: &WorkflowError) -> Self {
        Self::error(e.status(), e.to_string())
    }

    /// Decode `data` back into a value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data)
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Result of one id (or one action) inside a batch command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub status: i32,
    pub message: String,
}

impl ItemResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            message: message.into(),
        }
    }

    pub fn error(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

impl From<&WorkflowError> for ItemResult {
    fn from(e: &WorkflowError) -> Self {
        Self::error(e.status(), e.to_string())
    }
}

/// Per-item results keyed by id or action key.
pub type Batch = BTreeMap<String, ItemResult>;

impl From<Batch> for Envelope {
    /// A batch always answers `0`; failures are reported per item.
    fn from(batch: Batch) -> Self {
        let failed = batch.values().filter(|r| !r.is_ok()).count();
        let message = if failed == 0 {
            "Ok.".to_string()
        } else {
            format!("{failed} of {} failed.", batch.len())
        };
        Self::ok(message, &batch)
    }
}
