//! flowmesh-health — probes that move deployments between lifecycle states.
//!
//! # Architecture
//!
//! ```text
//!   watch(deployments/) ──▶ HealthReconciler
//!                              │  STARTING ─ probes UP   ─▶ RUNNING
//!                              │  STOPPING ─ probes DOWN ─▶ STOPPED
//!                              ▼
//!                 TaskProbe (one tokio task per health-checked vertex)
//!                              │
//!                              ▼
//!              deployments/{id}/probes/{task} = UP | DOWN
//! ```
//!
//! Probe writes are guarded by the deployment's state key, so a probe
//! outliving its deployment cannot recreate keys under a deleted prefix.

pub mod error;
pub mod probe;
pub mod reconciler;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{HealthError, HealthResult};
pub use probe::{ProbeStatus, TaskProbe};
pub use reconciler::{HealthReconciler, ProbeReport};
