//! State machines for deployments and instances.
//!
//! Values are persisted as their upper-case name (`RUNNING`). Each enum
//! carries its own edge table; [`crate::StateStore::transition`] refuses
//! any `from -> to` pair the table does not list.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A persisted state machine.
pub trait Lifecycle: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Target of the unconditional escape hatch.
    const ERROR: Self;

    fn as_str(&self) -> &'static str;

    fn parse(raw: &str) -> Option<Self>;

    /// Whether `from -> to` is an edge of this state machine.
    fn permits(from: Self, to: Self) -> bool;

    fn from_bytes(raw: &[u8]) -> Option<Self> {
        std::str::from_utf8(raw).ok().and_then(Self::parse)
    }
}

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl DeploymentState {
    pub const ALL: [DeploymentState; 5] = [
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Error,
    ];

    /// States from which a deployment may be deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl Lifecycle for DeploymentState {
    const ERROR: Self = Self::Error;

    fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    fn permits(from: Self, to: Self) -> bool {
        use DeploymentState::*;
        matches!(
            (from, to),
            (Starting, Running)
                | (Running, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Starting | Running | Stopping | Stopped, Error)
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Instance ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Completed,
}

impl InstanceState {
    pub const ALL: [InstanceState; 6] = [
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Error,
        Self::Completed,
    ];

    /// States from which an instance may be deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    /// Whether the instance still holds deployed work in flight.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Completed | Self::Error)
    }
}

impl Lifecycle for InstanceState {
    const ERROR: Self = Self::Error;

    fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
            Self::Completed => "COMPLETED",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    fn permits(from: Self, to: Self) -> bool {
        use InstanceState::*;
        matches!(
            (from, to),
            (Starting, Running)
                | (Starting | Running, Completed)
                | (Starting | Running, Error)
                | (Starting | Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Starting, Stopped)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_parse() {
        for state in DeploymentState::ALL {
            assert_eq!(DeploymentState::parse(state.as_str()), Some(state));
        }
        for state in InstanceState::ALL {
            assert_eq!(InstanceState::from_bytes(state.as_str().as_bytes()), Some(state));
        }
        assert_eq!(DeploymentState::parse("COMPLETED"), None);
        assert_eq!(InstanceState::parse("running"), None);
    }

    #[test]
    fn deployment_edges() {
        use DeploymentState::*;
        assert!(DeploymentState::permits(Starting, Running));
        assert!(DeploymentState::permits(Error, Stopping));
        assert!(DeploymentState::permits(Stopped, Starting));
        assert!(DeploymentState::permits(Running, Error));
        assert!(!DeploymentState::permits(Error, Starting));
        assert!(!DeploymentState::permits(Running, Starting));
        assert!(!DeploymentState::permits(Stopped, Running));
        assert!(!DeploymentState::permits(Error, Error));
    }

    #[test]
    fn instance_edges() {
        use InstanceState::*;
        assert!(InstanceState::permits(Running, Completed));
        assert!(InstanceState::permits(Running, Stopping));
        assert!(InstanceState::permits(Stopping, Stopped));
        assert!(InstanceState::permits(Stopped, Starting));
        assert!(!InstanceState::permits(Completed, Running));
        assert!(!InstanceState::permits(Error, Starting));
        assert!(!InstanceState::permits(Stopped, Running));
        assert!(!InstanceState::permits(Stopping, Error));
        assert!(!InstanceState::permits(Stopped, Error));
    }

    #[test]
    fn serde_uses_persisted_names() {
        let json = serde_json::to_string(&InstanceState::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
    }
}
