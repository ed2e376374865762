//! Catch gateway: consume a topic and relay each event to the next hop.
//!
//! In `forward` mode an event must carry the instance and deployment ids
//! and is relayed with them. In `start` mode each event starts a new
//! instance: `forward_url` points at the daemon's start-event relay
//! (`/api/v1/deployments/{id}/instances`) and no ids are needed.
//!
//! The poller stops between poll cycles. A relay in progress always
//! completes, and polls are cancel-safe.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowmesh_core::BoxFuture;
use flowmesh_core::BusError;
use flowmesh_core::config::{CatchConfig, CatchMode, parse_duration};
use flowmesh_core::events::{EventBus, EventMessage};
use flowmesh_core::headers::{self, FLOW_ID, TRACE_HEADERS, WF_ID};

use crate::error::GatewayResult;
use crate::forward::{Forwarder, Outcome};
use crate::scaffold::RoutingStrategy;

pub struct CatchGateway {
    name: String,
    topic: String,
    group: String,
    mode: CatchMode,
    bus: Arc<dyn EventBus>,
    forward: Forwarder,
    poll_timeout: Duration,
}

impl CatchGateway {
    pub fn from_config(config: &CatchConfig, bus: Arc<dyn EventBus>, fail_url: Option<String>) -> Self {
        let timeout = parse_duration(&config.timeout).unwrap_or(Duration::from_secs(30));
        // A start-mode event has no instance the daemon could mark failed.
        let fail_url = match config.mode {
            CatchMode::Forward => fail_url,
            CatchMode::Start => None,
        };
        Self {
            name: config.name.clone(),
            topic: config.topic.clone(),
            group: config.group(),
            mode: config.mode,
            bus,
            forward: Forwarder::new(&config.forward_url, config.attempts, timeout, fail_url),
            poll_timeout: parse_duration(&config.poll_timeout).unwrap_or(Duration::from_secs(1)),
        }
    }

    pub fn spawn_poller(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.poll_loop(shutdown).await {
                error!(gateway = %this.name, topic = %this.topic, error = %e, "poller stopped");
            }
        })
    }

    pub async fn poll_loop(&self, mut shutdown: watch::Receiver<bool>) -> GatewayResult<()> {
        let mut consumer = self.bus.subscribe(&self.topic, &self.group)?;
        info!(gateway = %self.name, topic = %self.topic, group = %self.group, "poller started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                polled = consumer.poll(self.poll_timeout) => match polled {
                    Ok(Some(message)) => {
                        self.deliver(message).await;
                    }
                    Ok(None) => {}
                    Err(BusError::Rebalance) => {
                        info!(gateway = %self.name, "consumer group rebalanced");
                    }
                    Err(BusError::Closed) => break,
                    Err(e) => {
                        warn!(gateway = %self.name, error = %e, "poll failed");
                        tokio::time::sleep(self.poll_timeout).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        info!(gateway = %self.name, "poller stopped");
        Ok(())
    }

    /// Relay one consumed event.
    pub async fn deliver(&self, message: EventMessage) -> Option<Outcome> {
        let mut outbound = HeaderMap::new();
        if self.mode == CatchMode::Forward {
            let (Some(flow_id), Some(wf_id)) = (message.header(FLOW_ID), message.header(WF_ID)) else {
                warn!(gateway = %self.name, topic = %self.topic, "event without instance ids dropped");
                return None;
            };
            headers::set(&mut outbound, FLOW_ID, flow_id);
            headers::set(&mut outbound, WF_ID, wf_id);
        }
        for &name in TRACE_HEADERS {
            if let Some(value) = message.header(name) {
                headers::set(&mut outbound, name, value);
            }
        }
        headers::set(
            &mut outbound,
            "content-type",
            message.header("content-type").unwrap_or("application/json"),
        );

        let outcome = self.forward.forward(&outbound, Bytes::from(message.payload)).await;
        match &outcome {
            Outcome::Delivered(_) => debug!(gateway = %self.name, url = self.forward.url(), "event relayed"),
            Outcome::Reported(e) | Outcome::Unreported(e) => {
                warn!(gateway = %self.name, url = self.forward.url(), error = %e, "event not relayed")
            }
            Outcome::Published => {}
        }
        Some(outcome)
    }
}

impl RoutingStrategy for CatchGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_ids(&self) -> bool {
        self.mode == CatchMode::Forward
    }

    fn route<'a>(&'a self, inbound: &'a HeaderMap, body: Bytes) -> BoxFuture<'a, GatewayResult<Outcome>> {
        Box::pin(async move {
            let mut outbound = headers::propagate(inbound);
            headers::set(
                &mut outbound,
                "content-type",
                headers::get(inbound, "content-type").unwrap_or("application/json"),
            );
            Ok(self.forward.forward(&outbound, body).await)
        })
    }
}
