//! Throw gateway: publish the inbound payload to a topic, then optionally
//! relay it onward.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use tracing::info;

use flowmesh_core::BoxFuture;
use flowmesh_core::config::{ThrowConfig, parse_duration};
use flowmesh_core::events::{EventBus, EventMessage};
use flowmesh_core::headers::{self, FLOW_ID, TRACE_HEADERS, WF_ID};

use crate::error::GatewayResult;
use crate::forward::{Forwarder, Outcome};
use crate::scaffold::RoutingStrategy;

pub struct ThrowGateway {
    name: String,
    topic: String,
    bus: Arc<dyn EventBus>,
    forward: Option<Forwarder>,
}

impl ThrowGateway {
    pub fn from_config(config: &ThrowConfig, bus: Arc<dyn EventBus>, fail_url: Option<String>) -> Self {
        let timeout = parse_duration(&config.timeout).unwrap_or(Duration::from_secs(30));
        Self {
            name: config.name.clone(),
            topic: config.topic.clone(),
            bus,
            forward: config
                .forward_url
                .as_ref()
                .map(|url| Forwarder::new(url, config.attempts, timeout, fail_url)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Message carrying `body` and the relayable headers of `inbound`.
pub fn event_for(inbound: &HeaderMap, body: &[u8]) -> EventMessage {
    let mut message = EventMessage::new(body.to_vec());
    for name in [FLOW_ID, WF_ID, "content-type"].iter().chain(TRACE_HEADERS) {
        if let Some(value) = headers::get(inbound, name) {
            message = message.with_header(name, value);
        }
    }
    message
}

impl RoutingStrategy for ThrowGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn route<'a>(&'a self, inbound: &'a HeaderMap, body: Bytes) -> BoxFuture<'a, GatewayResult<Outcome>> {
        Box::pin(async move {
            self.bus.publish(&self.topic, event_for(inbound, &body)).await?;
            info!(gateway = %self.name, topic = %self.topic, flow_id = ?headers::get(inbound, FLOW_ID), "event thrown");

            let Some(forward) = &self.forward else {
                return Ok(Outcome::Published);
            };
            let mut outbound = headers::propagate(inbound);
            if let Some(content_type) = headers::get(inbound, "content-type") {
                headers::set(&mut outbound, "content-type", content_type);
            }
            Ok(forward.forward(&outbound, body).await)
        })
    }
}

#[cfg(test)]
mod tests {
    use flowmesh_core::BusError;
    use flowmesh_core::events::{EventConsumer, MemoryBus};

    use super::*;
    use crate::error::GatewayError;
    use crate::test_support::Hop;

    fn config(forward_url: Option<String>) -> ThrowConfig {
        ThrowConfig {
            name: "notify".into(),
            port: 0,
            topic: "order-events".into(),
            forward_url,
            attempts: 2,
            fail_url: None,
            timeout: "2s".into(),
        }
    }

    fn ids() -> HeaderMap {
        let mut inbound = HeaderMap::new();
        headers::set(&mut inbound, FLOW_ID, "order-1-i");
        headers::set(&mut inbound, WF_ID, "order-1");
        headers::set(&mut inbound, "content-type", "application/json");
        inbound
    }

    #[tokio::test]
    async fn publishes_with_instance_ids() {
        let bus = Arc::new(MemoryBus::new());
        bus.create_topic("order-events").unwrap();
        let gateway = ThrowGateway::from_config(&config(None), bus.clone(), None);
        let mut consumer = bus.subscribe("order-events", "audit").unwrap();

        let outcome = gateway.route(&ids(), Bytes::from_static(b"{\"id\":7}")).await.unwrap();
        assert!(matches!(outcome, Outcome::Published));

        let message = consumer.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(message.payload, b"{\"id\":7}");
        assert_eq!(message.header(FLOW_ID), Some("order-1-i"));
        assert_eq!(message.header(WF_ID), Some("order-1"));
        assert_eq!(message.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn publishes_then_forwards() {
        let hop = Hop::start().await;
        let bus = Arc::new(MemoryBus::new());
        bus.create_topic("order-events").unwrap();
        let gateway = ThrowGateway::from_config(&config(Some(hop.url("/end"))), bus.clone(), None);

        let outcome = gateway.route(&ids(), Bytes::from_static(b"{}")).await.unwrap();
        assert!(matches!(outcome, Outcome::Delivered(_)));
        assert_eq!(bus.len("order-events"), 1);
        assert_eq!(hop.received("/end")[0].header(WF_ID), Some("order-1"));
    }

    #[tokio::test]
    async fn missing_topic_fails_before_forwarding() {
        let hop = Hop::start().await;
        let bus = Arc::new(MemoryBus::new());
        let gateway = ThrowGateway::from_config(&config(Some(hop.url("/end"))), bus, None);

        let err = gateway.route(&ids(), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Bus(BusError::UnknownTopic(_))));
        assert_eq!(hop.hits("/end"), 0);
    }
}
