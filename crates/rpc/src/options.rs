//! Connection options negotiated by the handshake.

use crate::codec::CodecType;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Marks a connection as speaking this protocol.
pub const MAGIC_NUMBER: u32 = 0x003b_ef5b;

/// Default bound on connecting and completing the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options a client sends as the first message on a new connection.
///
/// The server applies `codec_type` and `handle_timeout` to that connection
/// only. `connect_timeout` is used by the dialling side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Protocol identity tag.
    pub magic_number: u32,
    /// Codec used for every header and body after the handshake.
    pub codec_type: CodecType,
    /// Bound on connecting plus handshake. Zero waits indefinitely.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Per-call bound on server-side handling. Zero waits indefinitely.
    #[serde(with = "duration_ms")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Set the codec.
    #[must_use]
    pub const fn with_codec(mut self, codec_type: CodecType) -> Self {
        self.codec_type = codec_type;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the server-side handle timeout.
    #[must_use]
    pub const fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }
}

/// Durations as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
