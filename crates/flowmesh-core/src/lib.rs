//! flowmesh-core — types and collaborators shared by every flowmesh process.
//!
//! - [`process`]: the process graph consumed by the managers (vertex kinds,
//!   successors, per-task call and health metadata).
//! - [`deploy`]: the compiler / orchestrator boundary that turns a graph
//!   into deployed services.
//! - [`events`]: the event bus used by throw / catch gateways.
//! - [`http`]: the task-call client.
//! - [`headers`]: header names relayed between hops.
//! - [`config`]: `flowd.toml` and `gateways.toml`.

pub mod config;
pub mod deploy;
pub mod error;
pub mod events;
pub mod headers;
pub mod http;
pub mod process;

pub use error::{BusError, CallError, CompileError, OrchestratorError, ProcessError};

/// Boxed, sendable future used at the dyn-trait seams of this crate.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
