//! StateStore — redb-backed coordinator store for flowmesh.
//!
//! One flat `kv` table holds every key of the namespace described in
//! [`crate::keys`]. Writes publish a [`WatchEvent`] after they commit;
//! `compare_and_swap` and `put_if_absent` do their read and write inside a
//! single write transaction. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::lifecycle::Lifecycle;
use crate::tables::KV;
use crate::watch::{WATCH_CAPACITY, WatchEvent, WatchStream};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// A write committed together with a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attached<'a> {
    Put(&'a str, &'a [u8]),
    Delete(&'a str),
}

/// Thread-safe coordinator store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
    /// Held from `begin_write` until the write's events are published, so
    /// watchers see events in commit order.
    publish: Arc<Mutex<()>>,
    pub(crate) locks: Arc<KeyLocks>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
            publish: Arc::new(Mutex::new(())),
            locks: Arc::new(KeyLocks::default()),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn publish_guard(&self) -> MutexGuard<'_, ()> {
        self.publish.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No receivers is not an error.
            let _ = self.events.send(event);
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get the raw value stored at `key`.
    pub fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let value = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Get a value as UTF-8 text. Non-UTF-8 bytes are replaced lossily.
    pub fn get_string(&self, key: &str) -> StateResult<Option<String>> {
        Ok(self
            .get(key)?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Get and parse a lifecycle state. An unparseable value reads as `None`.
    pub fn get_state<S: Lifecycle>(&self, key: &str) -> StateResult<Option<S>> {
        Ok(self.get(key)?.and_then(|raw| S::from_bytes(&raw)))
    }

    /// Get a JSON-encoded value.
    pub fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        match self.get(key)? {
            Some(raw) => {
                let value = serde_json::from_slice(&raw).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    pub fn get_prefix(&self, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(results)
    }

    /// Keys starting with `prefix`, in key order.
    pub fn keys_with_prefix(&self, prefix: &str) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        collect_keys(&table, prefix)
    }

    /// Distinct path segments directly below `prefix`
    /// (`next_level("deployments/")` lists deployment ids).
    pub fn next_level(&self, prefix: &str) -> StateResult<Vec<String>> {
        let segments: BTreeSet<String> = self
            .keys_with_prefix(prefix)?
            .into_iter()
            .filter_map(|key| {
                let rest = &key[prefix.len()..];
                let segment = rest.split('/').next()?;
                (!segment.is_empty()).then(|| segment.to_string())
            })
            .collect();
        Ok(segments.into_iter().collect())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Unconditionally write `value` at `key`.
    pub fn put(&self, key: &str, value: &[u8]) -> StateResult<()> {
        let _order = self.publish_guard();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.emit(vec![WatchEvent::put(key, value)]);
        Ok(())
    }

    /// Write a JSON-encoded value.
    pub fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> StateResult<()> {
        let raw = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        self.put(key, &raw)
    }

    /// Write `value` only if `key` does not exist. Returns whether it was written.
    pub fn put_if_absent(&self, key: &str, value: &[u8]) -> StateResult<bool> {
        self.compare_and_swap(key, None, value)
    }

    /// Write `value` at `key` only while `guard` exists, in one
    /// transaction. Returns whether it was written.
    pub fn put_guarded(&self, guard: &str, key: &str, value: &[u8]) -> StateResult<bool> {
        let _order = self.publish_guard();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let present;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            present = table.get(guard).map_err(map_err!(Read))?.is_some();
            if present {
                table.insert(key, value).map_err(map_err!(Write))?;
            }
        }
        if !present {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(false);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.emit(vec![WatchEvent::put(key, value)]);
        Ok(true)
    }

    /// Replace the value at `key` with `new` iff the current value equals
    /// `expected` (`None` meaning "key absent"). Returns whether it swapped.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> StateResult<bool> {
        self.compare_and_swap_with(key, expected, new, &[])
    }

    /// `compare_and_swap` that also applies `attached` in the same write
    /// transaction. Nothing is written when the swap fails.
    pub fn compare_and_swap_with(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        attached: &[Attached<'_>],
    ) -> StateResult<bool> {
        let _order = self.publish_guard();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let swapped;
        let mut events = Vec::with_capacity(attached.len() + 1);
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            swapped = current.as_deref() == expected;
            if swapped {
                for write in attached {
                    match *write {
                        Attached::Put(k, v) => {
                            table.insert(k, v).map_err(map_err!(Write))?;
                            events.push(WatchEvent::put(k, v));
                        }
                        Attached::Delete(k) => {
                            if table.remove(k).map_err(map_err!(Write))?.is_some() {
                                events.push(WatchEvent::delete(k));
                            }
                        }
                    }
                }
                table.insert(key, new).map_err(map_err!(Write))?;
                events.push(WatchEvent::put(key, new));
            }
        }
        if !swapped {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(false);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.emit(events);
        Ok(true)
    }

    /// Delete `key`. Returns true if it existed.
    pub fn delete(&self, key: &str) -> StateResult<bool> {
        let _order = self.publish_guard();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            self.emit(vec![WatchEvent::delete(key)]);
        }
        debug!(%key, existed, "key deleted");
        Ok(existed)
    }

    /// Delete every key under `prefix` in one transaction. Returns true
    /// only if the prefix is empty afterwards; a prefix that was already
    /// empty also counts as success.
    pub fn delete_prefix(&self, prefix: &str) -> StateResult<bool> {
        let removed = {
            let _order = self.publish_guard();
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            let removed;
            {
                let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
                removed = collect_keys(&table, prefix)?;
                for key in &removed {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
            self.emit(removed.iter().map(|k| WatchEvent::delete(k)).collect());
            removed.len()
        };

        let leftover = self.keys_with_prefix(prefix)?;
        if !leftover.is_empty() {
            warn!(%prefix, remaining = leftover.len(), "prefix not empty after delete");
            return Ok(false);
        }
        debug!(%prefix, removed, "prefix deleted");
        Ok(true)
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Subscribe to PUT/DELETE events under `prefix`. Only writes committed
    /// after this call are observed.
    pub fn watch_prefix(&self, prefix: &str) -> WatchStream {
        WatchStream::new(prefix, self.events.subscribe())
    }

    /// A handle over the same database that does not share advisory locks,
    /// standing in for a second process.
    #[cfg(test)]
    pub(crate) fn with_fresh_locks(&self) -> Self {
        Self {
            locks: Arc::new(KeyLocks::default()),
            ..self.clone()
        }
    }
}

fn collect_keys<T>(table: &T, prefix: &str) -> StateResult<Vec<String>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        keys.push(key.value().to_string());
    }
    Ok(keys)
}

// ── Advisory locks ─────────────────────────────────────────────────

/// Per-key advisory locks shared by clones of one store handle.
#[derive(Default)]
pub(crate) struct KeyLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    /// Run `f` while holding the lock for `key`.
    pub(crate) fn with<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let result = {
            let _held = slot.lock().unwrap_or_else(|p| p.into_inner());
            f()
        };

        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        // Map entry plus our clone: nobody else is waiting.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{EventKind, Watched};

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    // ── Basic CRUD ─────────────────────────────────────────────────

    #[test]
    fn put_get_delete() {
        let store = store();
        assert!(store.get("a/b").unwrap().is_none());

        store.put("a/b", b"one").unwrap();
        assert_eq!(store.get("a/b").unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(store.get_string("a/b").unwrap().as_deref(), Some("one"));

        assert!(store.delete("a/b").unwrap());
        assert!(!store.delete("a/b").unwrap());
        assert!(store.get("a/b").unwrap().is_none());
    }

    #[test]
    fn put_if_absent_only_writes_once() {
        let store = store();
        assert!(store.put_if_absent("k", b"first").unwrap());
        assert!(!store.put_if_absent("k", b"second").unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn guarded_put_needs_the_guard() {
        let store = store();
        assert!(!store.put_guarded("dep/state", "dep/probes/a", b"UP").unwrap());
        assert!(store.get("dep/probes/a").unwrap().is_none());

        store.put("dep/state", b"STARTING").unwrap();
        assert!(store.put_guarded("dep/state", "dep/probes/a", b"UP").unwrap());
        assert_eq!(store.get_string("dep/probes/a").unwrap().as_deref(), Some("UP"));
    }

    #[test]
    fn compare_and_swap_checks_expected_value() {
        let store = store();
        store.put("k", b"A").unwrap();

        assert!(!store.compare_and_swap("k", Some(b"B"), b"C").unwrap());
        assert!(!store.compare_and_swap("k", None, b"C").unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"A"[..]));

        assert!(store.compare_and_swap("k", Some(b"A"), b"C").unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"C"[..]));
    }

    #[test]
    fn attached_writes_commit_with_the_swap_only() {
        let store = store();
        store.put("i/state", b"RUNNING").unwrap();
        store.put("i/payload", b"saved").unwrap();
        let attached = [Attached::Put("i/result", b"done"), Attached::Delete("i/payload")];

        assert!(
            !store
                .compare_and_swap_with("i/state", Some(b"STOPPED"), b"COMPLETED", &attached)
                .unwrap()
        );
        assert!(store.get("i/result").unwrap().is_none());
        assert!(store.get("i/payload").unwrap().is_some());

        assert!(
            store
                .compare_and_swap_with("i/state", Some(b"RUNNING"), b"COMPLETED", &attached)
                .unwrap()
        );
        assert_eq!(store.get("i/result").unwrap().as_deref(), Some(&b"done"[..]));
        assert!(store.get("i/payload").unwrap().is_none());
        assert_eq!(store.get("i/state").unwrap().as_deref(), Some(&b"COMPLETED"[..]));
    }

    #[test]
    fn json_helpers() {
        let store = store();
        let tags: HashMap<String, String> =
            [("team".to_string(), "ops".to_string())].into_iter().collect();
        store.put_json("instances/x/metadata", &tags).unwrap();
        let back: HashMap<String, String> =
            store.get_json("instances/x/metadata").unwrap().unwrap();
        assert_eq!(back, tags);
    }

    // ── Prefix operations ──────────────────────────────────────────

    #[test]
    fn prefix_scan_is_bounded() {
        let store = store();
        store.put("deployments/a/state", b"RUNNING").unwrap();
        store.put("deployments/a/definition", b"{}").unwrap();
        store.put("deployments/ab/state", b"STOPPED").unwrap();
        store.put("instances/a-1/state", b"RUNNING").unwrap();

        let a = store.get_prefix("deployments/a/").unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|(k, _)| k.starts_with("deployments/a/")));

        let ids = store.next_level("deployments/").unwrap();
        assert_eq!(ids, vec!["a".to_string(), "ab".to_string()]);
    }

    #[test]
    fn delete_prefix_removes_whole_namespace() {
        let store = store();
        store.put("deployments/a/state", b"STOPPED").unwrap();
        store.put("deployments/a/probes/t1", b"DOWN").unwrap();
        store.put("deployments/ab/state", b"RUNNING").unwrap();

        assert!(store.delete_prefix("deployments/a/").unwrap());
        assert!(store.keys_with_prefix("deployments/a/").unwrap().is_empty());
        assert!(store.get("deployments/ab/state").unwrap().is_some());

        // Already empty.
        assert!(store.delete_prefix("deployments/a/").unwrap());
    }

    // ── Watches ────────────────────────────────────────────────────

    #[tokio::test]
    async fn watch_sees_matching_writes_only() {
        let store = store();
        let mut watch = store.watch_prefix("deployments/a/");

        store.put("instances/x/state", b"RUNNING").unwrap();
        store.put("deployments/a/state", b"STARTING").unwrap();
        store.delete("deployments/a/state").unwrap();

        match watch.next().await.unwrap() {
            Watched::Event(ev) => {
                assert_eq!(ev.kind, EventKind::Put);
                assert_eq!(ev.key, "deployments/a/state");
                assert_eq!(ev.value.as_deref(), Some(&b"STARTING"[..]));
            }
            other => panic!("unexpected {other:?}"),
        }
        match watch.next().await.unwrap() {
            Watched::Event(ev) => {
                assert_eq!(ev.kind, EventKind::Delete);
                assert!(ev.value.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_cas_publishes_nothing() {
        let store = store();
        store.put("k", b"A").unwrap();
        let mut watch = store.watch_prefix("k");
        assert!(!store.compare_and_swap("k", Some(b"B"), b"C").unwrap());
        store.put("k", b"D").unwrap();

        match watch.next().await.unwrap() {
            Watched::Event(ev) => assert_eq!(ev.value.as_deref(), Some(&b"D"[..])),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn attached_writes_are_published_before_the_swapped_key() {
        let store = store();
        store.put("i/state", b"RUNNING").unwrap();
        let mut watch = store.watch_prefix("i/");
        store
            .compare_and_swap_with(
                "i/state",
                Some(b"RUNNING"),
                b"COMPLETED",
                &[Attached::Put("i/result", b"ok")],
            )
            .unwrap();

        let mut keys = Vec::new();
        for _ in 0..2 {
            match watch.next().await.unwrap() {
                Watched::Event(ev) => keys.push(ev.key),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(keys, vec!["i/result".to_string(), "i/state".to_string()]);
    }

    #[tokio::test]
    async fn lagging_watcher_is_told() {
        let store = store();
        let mut watch = store.watch_prefix("k/");
        for i in 0..(WATCH_CAPACITY + 10) {
            store.put(&format!("k/{i}"), b"x").unwrap();
        }
        assert!(matches!(watch.next().await, Some(Watched::Lagged(_))));
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowmesh.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put("deployments/a/state", b"RUNNING").unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(
            store.get_string("deployments/a/state").unwrap().as_deref(),
            Some("RUNNING")
        );
    }

    #[test]
    fn key_locks_are_released() {
        let store = store();
        let out = store.locks.with("k", || 7);
        assert_eq!(out, 7);
        assert_eq!(store.locks.len(), 0);
    }
}
