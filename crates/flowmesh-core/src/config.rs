//! `flowd.toml` and `gateways.toml` configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Daemon ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// URL other processes use to reach this daemon. Gateways derive the
    /// failure endpoint from it.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Timeout for a single task call issued by the daemon.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_url: None,
            call_timeout: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSettings {
    /// When set, a deployment stuck in STARTING or STOPPING this long is
    /// moved to ERROR. Unset waits forever.
    #[serde(default)]
    pub deployment_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default = "default_docker")]
    pub docker: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            docker: default_docker(),
        }
    }
}

fn default_port() -> u16 {
    9002
}
fn default_call_timeout() -> String {
    "30s".to_string()
}
fn default_kubectl() -> String {
    "kubectl".to_string()
}
fn default_docker() -> String {
    "docker".to_string()
}

impl FlowConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlowConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn call_timeout(&self) -> Duration {
        parse_duration(&self.daemon.call_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn deployment_timeout(&self) -> Option<Duration> {
        self.health
            .deployment_timeout
            .as_deref()
            .and_then(parse_duration)
    }

    /// Failure endpoint handed to gateways.
    pub fn fail_url(&self) -> String {
        let base = self
            .daemon
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.daemon.port));
        format!("{}/instancefail", base.trim_end_matches('/'))
    }
}

// ── Gateways ───────────────────────────────────────────────────────

/// Gateways run by `flowd gateways`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayFileConfig {
    /// Default failure endpoint for every gateway below.
    #[serde(default)]
    pub fail_url: Option<String>,
    #[serde(default)]
    pub exclusive: Vec<ExclusiveConfig>,
    #[serde(default)]
    pub throw: Vec<ThrowConfig>,
    #[serde(default)]
    pub catch: Vec<CatchConfig>,
}

/// Literal an exclusive gateway compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Comparand {
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExclusiveConfig {
    pub name: String,
    pub port: u16,
    /// Dotted path into the JSON body (`order.total`).
    pub path: String,
    /// `==`, `<` or `>`.
    pub operator: String,
    pub value: Comparand,
    pub true_url: String,
    pub false_url: String,
    #[serde(default = "default_attempts")]
    pub true_attempts: u32,
    #[serde(default = "default_attempts")]
    pub false_attempts: u32,
    #[serde(default)]
    pub fail_url: Option<String>,
    #[serde(default = "default_call_timeout")]
    pub timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrowConfig {
    pub name: String,
    pub port: u16,
    pub topic: String,
    #[serde(default)]
    pub forward_url: Option<String>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub fail_url: Option<String>,
    #[serde(default = "default_call_timeout")]
    pub timeout: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchMode {
    /// Relay events of running instances to the next hop.
    #[default]
    Forward,
    /// Each event starts a new instance through the daemon.
    Start,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchConfig {
    pub name: String,
    pub port: u16,
    pub topic: String,
    #[serde(default)]
    pub group: Option<String>,
    pub forward_url: String,
    #[serde(default)]
    pub mode: CatchMode,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub fail_url: Option<String>,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: String,
    #[serde(default = "default_call_timeout")]
    pub timeout: String,
}

impl CatchConfig {
    pub fn group(&self) -> String {
        self.group.clone().unwrap_or_else(|| self.name.clone())
    }
}

fn default_attempts() -> u32 {
    2
}
fn default_poll_timeout() -> String {
    "1s".to_string()
}

impl GatewayFileConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Failure endpoint for one gateway: its own, else the file default.
    pub fn fail_url_for(&self, own: &Option<String>) -> Option<String> {
        own.clone().or_else(|| self.fail_url.clone())
    }
}

/// Parse a duration string like "5s", "500ms", "2m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
