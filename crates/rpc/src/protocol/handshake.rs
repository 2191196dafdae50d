//! Option negotiation preceding frame traffic.
//!
//! The handshake is always JSON so the server can read it before it knows
//! which codec the rest of the connection uses.

use crate::codec::CodecType;
use crate::error::{ConnectionError, Error, ProtocolError, Result};
use crate::options::{MAGIC_NUMBER, Options, duration_ms};
use crate::protocol::{Frame, FrameReader, FrameType, FrameWriter};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire form of [`Options`]; the codec travels as its tag string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol identity tag.
    pub magic_number: u32,
    /// Codec type tag.
    pub codec_type: String,
    /// Connect timeout in milliseconds.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Handle timeout in milliseconds.
    #[serde(with = "duration_ms")]
    pub handle_timeout: Duration,
}

impl From<&Options> for Handshake {
    fn from(options: &Options) -> Self {
        Self {
            magic_number: options.magic_number,
            codec_type: options.codec_type.content_type().to_string(),
            connect_timeout: options.connect_timeout,
            handle_timeout: options.handle_timeout,
        }
    }
}

impl Handshake {
    /// Validate the magic number and resolve the codec tag.
    ///
    /// # Errors
    ///
    /// Returns an error on a foreign magic number or an unregistered codec.
    pub fn negotiate(self) -> Result<Options> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(ProtocolError::MagicMismatch(self.magic_number).into());
        }
        let codec_type: CodecType = self.codec_type.parse()?;

        Ok(Options {
            magic_number: self.magic_number,
            codec_type,
            connect_timeout: self.connect_timeout,
            handle_timeout: self.handle_timeout,
        })
    }

    /// Send the handshake as the first frame of a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be written.
    pub async fn send(&self, frames: &mut FrameWriter) -> Result<()> {
        let payload = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))?;
        frames
            .send(Frame::new(FrameType::Handshake, Bytes::from(payload)))
            .await
    }

    /// Read the first frame of a connection as a handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream ends, the first frame is not a
    /// handshake, or its payload does not parse.
    pub async fn receive(frames: &mut FrameReader) -> Result<Self> {
        let frame = frames.next().await.ok_or(ConnectionError::Closed)??;
        if frame.frame_type != FrameType::Handshake {
            return Err(ProtocolError::UnexpectedFrame {
                expected: FrameType::Handshake,
                actual: frame.frame_type,
            }
            .into());
        }
        serde_json::from_slice(&frame.payload)
            .map_err(|e| Error::from(ProtocolError::MalformedHandshake(e.to_string())))
    }
}
