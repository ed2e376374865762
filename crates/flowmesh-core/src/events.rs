//! Event bus used by throw and catch gateways.
//!
//! The bus is a seam: gateways only need "publish a message with headers
//! to a topic" and "poll a topic as a consumer group". [`MemoryBus`] is the
//! in-process implementation, with per-group offsets and rebalances, used
//! when all gateways of a workflow run inside one `flowd gateways` process
//! and in tests.
//!
//! A topic keeps messages only until every consumer group has read them.
//! A group joining later starts at the oldest message still kept.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::BoxFuture;
use crate::error::BusError;

/// One message on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl EventMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

pub trait EventBus: Send + Sync {
    /// Create `topic` if it does not exist.
    fn create_topic(&self, topic: &str) -> Result<(), BusError>;

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: EventMessage,
    ) -> BoxFuture<'a, Result<(), BusError>>;

    /// Join consumer group `group` on `topic`.
    fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn EventConsumer>, BusError>;
}

pub trait EventConsumer: Send {
    /// Wait up to `timeout` for the next message. `Ok(None)` is an empty
    /// poll. Cancel-safe: dropping the future never loses a message.
    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<EventMessage>, BusError>>;
}

// ── In-memory bus ──────────────────────────────────────────────────

#[derive(Default)]
struct TopicLog {
    messages: VecDeque<EventMessage>,
    /// Offset of `messages[0]`.
    base: usize,
    /// Next offset per consumer group.
    offsets: HashMap<String, usize>,
    /// Bumped on every rebalance of a group.
    generations: HashMap<String, u64>,
}

impl TopicLog {
    /// Drop messages every group has read.
    fn compact(&mut self) {
        let Some(&low) = self.offsets.values().min() else {
            return;
        };
        let read = low.saturating_sub(self.base).min(self.messages.len());
        if read > 0 {
            self.messages.drain(..read);
            self.base += read;
        }
    }
}

#[derive(Default)]
struct BusInner {
    topics: Mutex<HashMap<String, TopicLog>>,
    notify: Notify,
}

impl BusInner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        self.topics.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// In-process event bus. Clones share topics.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.topics().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of messages ever published to `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.inner
            .topics()
            .get(topic)
            .map(|log| log.base + log.messages.len())
            .unwrap_or(0)
    }

    /// Messages of `topic` some group has yet to read.
    pub fn retained(&self, topic: &str) -> usize {
        self.inner
            .topics()
            .get(topic)
            .map(|log| log.messages.len())
            .unwrap_or(0)
    }

    /// Force a rebalance of `group` on `topic`: each member's next poll
    /// reports [`BusError::Rebalance`] once.
    pub fn rebalance(&self, topic: &str, group: &str) {
        if let Some(log) = self.inner.topics().get_mut(topic) {
            *log.generations.entry(group.to_string()).or_default() += 1;
        }
        self.inner.notify.notify_waiters();
    }
}

impl EventBus for MemoryBus {
    fn create_topic(&self, topic: &str) -> Result<(), BusError> {
        self.inner.topics().entry(topic.to_string()).or_default();
        debug!(%topic, "topic ready");
        Ok(())
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: EventMessage,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            {
                let mut topics = self.inner.topics();
                let log = topics
                    .get_mut(topic)
                    .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
                log.messages.push_back(message);
            }
            self.inner.notify.notify_waiters();
            Ok(())
        })
    }

    fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn EventConsumer>, BusError> {
        let generation = {
            let mut topics = self.inner.topics();
            let log = topics.entry(topic.to_string()).or_default();
            let base = log.base;
            log.offsets.entry(group.to_string()).or_insert(base);
            log.generations.get(group).copied().unwrap_or(0)
        };
        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            generation,
        }))
    }
}

struct MemoryConsumer {
    inner: Arc<BusInner>,
    topic: String,
    group: String,
    generation: u64,
}

impl MemoryConsumer {
    fn take(&mut self) -> Result<Option<EventMessage>, BusError> {
        let mut topics = self.inner.topics();
        let log = topics
            .get_mut(&self.topic)
            .ok_or_else(|| BusError::UnknownTopic(self.topic.clone()))?;

        let current = log.generations.get(&self.group).copied().unwrap_or(0);
        if current != self.generation {
            self.generation = current;
            return Err(BusError::Rebalance);
        }

        let base = log.base;
        let offset = log.offsets.entry(self.group.clone()).or_insert(base);
        let Some(message) = log.messages.get(offset.saturating_sub(base)).cloned() else {
            return Ok(None);
        };
        *offset += 1;
        log.compact();
        Ok(Some(message))
    }
}

impl EventConsumer for MemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<EventMessage>, BusError>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let inner = self.inner.clone();
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(message) = self.take()? {
                    return Ok(Some(message));
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }
}
