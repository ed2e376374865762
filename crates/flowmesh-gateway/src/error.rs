use std::net::SocketAddr;

use thiserror::Error;

use flowmesh_core::BusError;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway {name}: {reason}")]
    Config { name: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}
