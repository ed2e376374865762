//! flowmesh-gateway — the relays that sit between task services.
//!
//! # Architecture
//!
//! ```text
//!            POST /                      ┌────────────────────┐
//!   task ──────────────▶ scaffold ──────▶│ RoutingStrategy    │
//!                          (axum)        │  ExclusiveGateway  │── Forwarder ──▶ next hop
//!                                        │  ThrowGateway      │── EventBus::publish
//!                                        │  CatchGateway      │◀─ poller ◀── EventBus
//!                                        └────────────────────┘
//!                                                  │ budget spent
//!                                                  ▼
//!                                       daemon /instancefail
//! ```
//!
//! Every gateway relays with the same [`Forwarder`]: a fixed attempt
//! budget, then one failure report tagged with the original destination.

pub mod catch;
pub mod error;
pub mod exclusive;
pub mod forward;
pub mod runner;
pub mod scaffold;
pub mod throw;

#[cfg(test)]
pub(crate) mod test_support;

pub use catch::CatchGateway;
pub use error::{GatewayError, GatewayResult};
pub use exclusive::{ExclusiveGateway, Operator, evaluate};
pub use forward::{Forwarder, Outcome};
pub use runner::{GatewaySet, RunningGateway};
pub use scaffold::{RoutingStrategy, router, serve};
pub use throw::ThrowGateway;
