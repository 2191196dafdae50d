//! Error types for discovery and the multi-server client.

use thiserror::Error;

/// Result type alias for discovery and multi-server calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for discovery and multi-server calls.
#[derive(Debug, Error)]
pub enum Error {
    /// RPC framework error.
    #[error("RPC error: {0}")]
    Rpc(#[from] tern_rpc::Error),

    /// The server list is empty.
    #[error("rpc discovery: no available servers")]
    NoAvailableServers,

    /// The external server source could not be read.
    #[error("rpc discovery: refresh failed: {0}")]
    Refresh(String),
}
