//! Error types for the RPC engine.

use crate::protocol::FrameType;

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix of the error text a server sends when a handler outlives the
/// negotiated handle timeout.
pub const HANDLE_TIMEOUT_MESSAGE: &str = "rpc server: request handle timeout";

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-related errors.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol-level errors (framing and handshake).
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec errors during serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Errors raised while resolving or running a request on the server.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// The peer answered the call with an error.
    #[error("Server error: {0}")]
    Server(String),

    /// The peer gave up waiting for its handler.
    #[error("{0}")]
    HandleTimeout(String),

    /// The caller's deadline expired before the reply arrived.
    #[error("rpc client: call failed: deadline exceeded after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the call before the reply arrived.
    #[error("rpc client: call failed: context canceled")]
    Cancelled,

    /// The client was closed or its connection failed earlier.
    #[error("connection has been shutdown")]
    Shutdown,

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify the error text carried in a response header.
    ///
    /// Only the text travels on the wire, so the handle timeout is recognized
    /// by its [`HANDLE_TIMEOUT_MESSAGE`] prefix. A handler error whose own
    /// text starts with that prefix is reported as [`Error::HandleTimeout`]
    /// too.
    #[must_use]
    pub fn from_remote(message: String) -> Self {
        if message.starts_with(HANDLE_TIMEOUT_MESSAGE) {
            Self::HandleTimeout(message)
        } else {
            Self::Server(message)
        }
    }

    /// Whether this is a connect timeout, a client deadline or a server
    /// handle timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::HandleTimeout(_)
                | Self::Connection(ConnectionError::ConnectTimeout(_))
        )
    }
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to establish connection.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Connecting plus handshake did not finish within the connect timeout.
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// Connection closed by the peer.
    #[error("Connection closed unexpectedly")]
    Closed,

    /// The connection failed while calls were pending on it.
    #[error("Connection lost: {0}")]
    Lost(String),
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Invalid frame received.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A frame arrived out of the header/body order.
    #[error("Unexpected frame type: expected {expected:?}, got {actual:?}")]
    UnexpectedFrame {
        /// Expected frame type.
        expected: FrameType,
        /// Actual frame type received.
        actual: FrameType,
    },

    /// Checksum mismatch.
    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// The handshake did not carry this protocol's magic number.
    #[error("Magic number mismatch: {0:#x}")]
    MagicMismatch(u32),

    /// The handshake message could not be parsed.
    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// Unsupported codec type.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
}

/// Errors from server-side resolution and dispatch.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The service-method string has no `.` separator.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormed(String),

    /// No service registered under this name.
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    /// The service has no such method.
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    /// Service names must be exported identifiers.
    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    /// A service with this name is already registered.
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    /// The request argument did not decode into the method's argument type.
    #[error("rpc server: read argv err: {0}")]
    InvalidArgument(String),

    /// The handler outlived the handle timeout.
    #[error("{HANDLE_TIMEOUT_MESSAGE}: expect within {0:?}")]
    HandleTimeout(Duration),

    /// Handler panicked.
    #[error("rpc server: handler panicked")]
    Panicked,

    /// The method returned an error; carries its text verbatim.
    #[error("{0}")]
    Method(String),

    /// Internal dispatch failure.
    #[error("rpc server: {0}")]
    Internal(String),
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
