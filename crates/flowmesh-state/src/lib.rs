//! flowmesh-state — the coordinator store shared by every flowmesh daemon.
//!
//! Backed by [redb](https://docs.rs/redb), the store exposes a flat,
//! slash-delimited key namespace (`deployments/{id}/state`,
//! `instances/{id}/result`, ...) with the primitives the workflow layer
//! is built on:
//!
//! - `get` / `put` / `put_if_absent` / `delete` / `delete_prefix`
//! - prefix scans (`get_prefix`, `next_level`)
//! - `watch_prefix`, a stream of PUT/DELETE events fed after each commit
//! - `compare_and_swap`, executed inside a single write transaction, and
//!   `compare_and_swap_with`, which commits further writes alongside it
//! - `transition`, the optimistic state-change primitive every lifecycle
//!   mutation goes through
//!
//! # Architecture
//!
//! ```text
//! StateStore (Clone, Arc<Database>)
//!   ├── kv table          &str → &[u8]
//!   ├── broadcast::Sender<WatchEvent>   (one per store, fanned out to watchers)
//!   └── KeyLocks          advisory per-key locks used by `transition`
//! ```
//!
//! The advisory locks only reduce contention between callers sharing one
//! store handle. Correctness of `transition` rests on the CAS and the
//! re-read that follows a lost race.

pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod store;
pub mod tables;
mod transition;
pub mod watch;

pub use error::{StateError, StateResult};
pub use keys::{DeploymentKeys, InstanceKeys};
pub use lifecycle::{DeploymentState, InstanceState, Lifecycle};
pub use store::{Attached, StateStore};
pub use watch::{EventKind, WatchEvent, WatchStream, Watched};
