//! Prefix watches over the coordinator namespace.
//!
//! Every committed write is published on one broadcast channel per store;
//! a [`WatchStream`] filters that channel down to a key prefix.

use tokio::sync::broadcast;

/// Capacity of the per-store event channel.
pub(crate) const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for PUT, `None` for DELETE.
    pub value: Option<Vec<u8>>,
}

impl WatchEvent {
    pub(crate) fn put(key: &str, value: &[u8]) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.to_string(),
            value: Some(value.to_vec()),
        }
    }

    pub(crate) fn delete(key: &str) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: None,
        }
    }
}

/// Item yielded by [`WatchStream::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watched {
    Event(WatchEvent),
    /// The watcher fell behind and missed this many events. Callers must
    /// re-read the keys they care about.
    Lagged(u64),
}

/// Stream of events whose key starts with a prefix.
pub struct WatchStream {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(prefix: &str, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.to_string(),
            rx,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next matching event. Returns `None` once the store
    /// has been dropped. Cancel-safe.
    pub async fn next(&mut self) -> Option<Watched> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => {
                    return Some(Watched::Event(event));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(Watched::Lagged(missed));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
