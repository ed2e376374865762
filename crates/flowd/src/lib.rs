//! flowd — process assembly for the flowmesh binaries.
//!
//! ```text
//!   flowd daemon                         flowd gateways
//!   ┌──────────────────────────────┐     ┌──────────────────────┐
//!   │ API ─▶ Deployment / Instance │     │ exclusive  throw     │
//!   │          managers            │     │      catch ◀── bus   │
//!   │ HealthReconciler ─▶ probes   │     └──────────────────────┘
//!   │ StateStore (redb)            │
//!   └──────────────────────────────┘
//! ```
//!
//! The daemon can also host the gateways itself (`--gateways`), which
//! lets catch gateways in start mode share its event bus.

pub mod daemon;
pub mod gateways;

pub use daemon::{Daemon, OrchestratorMode};
