//! Error types for the flowmesh core collaborators.

use thiserror::Error;

/// A process definition that cannot be loaded or used.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid process definition: {0}")]
    Parse(String),

    #[error("invalid process: {0}")]
    Invalid(String),

    #[error("process has multiple entry points ({0}); one must be specified")]
    AmbiguousEntryPoint(String),

    #[error("unknown entry point: {0}")]
    UnknownEntryPoint(String),

    #[error("unsupported serialization: {0}")]
    UnsupportedSerialization(String),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("template error: {0}")]
    Template(String),

    #[error("process cannot be compiled: {0}")]
    Process(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to run {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("orchestrator rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// The consumer group was rebalanced; the caller should poll again.
    #[error("consumer group rebalanced")]
    Rebalance,

    #[error("event bus closed")]
    Closed,

    #[error("event bus error: {0}")]
    Backend(String),
}

/// A task call that did not produce a 2xx reply.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid url {0}")]
    InvalidUrl(String),

    #[error("connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("call to {url} timed out")]
    Timeout { url: String },

    #[error("{url} answered {status}")]
    Status {
        url: String,
        status: u16,
        body: bytes::Bytes,
    },

    #[error("http error calling {url}: {reason}")]
    Protocol { url: String, reason: String },
}
