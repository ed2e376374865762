//! Bounded-attempt relay shared by every gateway.
//!
//! A call is attempted up to the configured budget with no backoff. When
//! the budget is spent the payload is posted once to the daemon's failure
//! endpoint, tagged with the host and path the call was addressed to.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Uri};
use tracing::{error, warn};

use flowmesh_core::CallError;
use flowmesh_core::headers::{self, ERROR_CODE, ORIGINAL_HOST, ORIGINAL_PATH};
use flowmesh_core::http::{HttpReply, post, post_with_attempts};

/// What became of one relayed call.
#[derive(Debug)]
pub enum Outcome {
    Delivered(HttpReply),
    /// Published to a topic with nothing to forward.
    Published,
    /// Every attempt failed and the daemon was told.
    Reported(CallError),
    /// Every attempt failed and the failure report did not land either.
    Unreported(CallError),
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    url: String,
    attempts: u32,
    timeout: Duration,
    fail_url: Option<String>,
}

impl Forwarder {
    pub fn new(url: impl Into<String>, attempts: u32, timeout: Duration, fail_url: Option<String>) -> Self {
        Self {
            url: url.into(),
            attempts: attempts.max(1),
            timeout,
            fail_url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn forward(&self, headers: &HeaderMap, body: Bytes) -> Outcome {
        match post_with_attempts(&self.url, headers, body.clone(), self.attempts, self.timeout).await {
            Ok(reply) => Outcome::Delivered(reply),
            Err(e) => {
                if self.report(headers, body, &e).await {
                    Outcome::Reported(e)
                } else {
                    Outcome::Unreported(e)
                }
            }
        }
    }

    async fn report(&self, headers: &HeaderMap, body: Bytes, failure: &CallError) -> bool {
        let Some(fail_url) = &self.fail_url else {
            error!(url = %self.url, error = %failure, "call failed and no failure endpoint is configured");
            return false;
        };

        let (host, path) = split_target(&self.url);
        let mut report = headers.clone();
        headers::set(&mut report, ORIGINAL_HOST, &host);
        headers::set(&mut report, ORIGINAL_PATH, &path);
        headers::set(&mut report, ERROR_CODE, failure.code().as_str());

        match post(fail_url, &report, body, self.timeout).await {
            Ok(_) => {
                warn!(url = %self.url, %fail_url, code = failure.code().as_str(), "call failed, reported");
                true
            }
            Err(e) => {
                error!(url = %self.url, %fail_url, error = %e, "failure report not delivered");
                false
            }
        }
    }
}

/// `(host[:port], path)` of `url`.
fn split_target(url: &str) -> (String, String) {
    match url.parse::<Uri>() {
        Ok(uri) => (
            uri.authority().map(|a| a.to_string()).unwrap_or_default(),
            uri.path().to_string(),
        ),
        Err(_) => (String::new(), String::new()),
    }
}
