//! Pluggable body codecs and the header/body stream built on them.
//!
//! A [`CodecType`] is chosen by the client's handshake. After that, every
//! request and response is a [`Header`] frame followed by exactly one body
//! frame, both encoded with the negotiated codec. [`CodecReader`] and
//! [`CodecWriter`] are the two halves of one such stream.

pub mod cbor;
pub mod json;

use crate::error::{CodecError, ConnectionError, Error, ProtocolError, Result};
use crate::protocol::{Frame, FrameReader, FrameType, FrameWriter, Header};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::str::FromStr;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Registered codec type tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecType {
    /// Binary CBOR.
    #[default]
    #[serde(rename = "application/cbor")]
    Cbor,
    /// Self-describing JSON.
    #[serde(rename = "application/json")]
    Json,
}

impl CodecType {
    /// Every registered codec.
    pub const ALL: [Self; 2] = [Self::Cbor, Self::Json];

    /// The tag this codec is negotiated under.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Cbor => "application/cbor",
            Self::Json => "application/json",
        }
    }

    /// Encode a value with this codec.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        match self {
            Self::Cbor => cbor::encode(value),
            Self::Json => json::encode(value),
        }
    }

    /// Decode a value with this codec.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not decode into `T`.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            Self::Cbor => cbor::decode(data),
            Self::Json => json::decode(data),
        }
    }
}

impl FromStr for CodecType {
    type Err = CodecError;

    fn from_str(tag: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|codec| codec.content_type() == tag)
            .ok_or_else(|| CodecError::UnsupportedCodec(tag.to_string()))
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_type())
    }
}

/// Reading half of a header/body stream.
pub struct CodecReader {
    frames: FrameReader,
    codec: CodecType,
}

impl CodecReader {
    /// Wrap a frame reader whose handshake has already been consumed.
    #[must_use]
    pub const fn new(frames: FrameReader, codec: CodecType) -> Self {
        Self { frames, codec }
    }

    /// The negotiated codec.
    #[must_use]
    pub const fn codec_type(&self) -> CodecType {
        self.codec
    }

    async fn next_frame(&mut self, expected: FrameType) -> Result<Frame> {
        let frame = self.frames.next().await.ok_or(ConnectionError::Closed)??;
        if frame.frame_type != expected {
            return Err(ProtocolError::UnexpectedFrame {
                expected,
                actual: frame.frame_type,
            }
            .into());
        }
        Ok(frame)
    }

    /// Read and decode the next header.
    ///
    /// # Errors
    ///
    /// Returns an error on end of stream, a framing error or an undecodable
    /// header. The stream is unusable afterwards.
    pub async fn read_header(&mut self) -> Result<Header> {
        let frame = self.next_frame(FrameType::Header).await?;
        self.codec.decode(&frame.payload)
    }

    /// Read the encoded body that follows a header.
    ///
    /// # Errors
    ///
    /// Returns an error on end of stream or a framing error.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        Ok(self.next_frame(FrameType::Body).await?.payload)
    }

    /// Consume and drop the body that follows a header.
    ///
    /// # Errors
    ///
    /// Returns an error on end of stream or a framing error.
    pub async fn discard_body(&mut self) -> Result<()> {
        self.read_body().await.map(drop)
    }
}

/// Writing half of a header/body stream.
pub struct CodecWriter {
    frames: FrameWriter,
    codec: CodecType,
    closed: bool,
}

impl CodecWriter {
    /// Wrap a frame writer whose handshake has already been sent.
    #[must_use]
    pub const fn new(frames: FrameWriter, codec: CodecType) -> Self {
        Self {
            frames,
            codec,
            closed: false,
        }
    }

    /// The negotiated codec.
    #[must_use]
    pub const fn codec_type(&self) -> CodecType {
        self.codec
    }

    /// Encode and write one header and body.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails; the stream is closed in
    /// that case.
    pub async fn write<T: Serialize + ?Sized>(&mut self, header: &Header, body: &T) -> Result<()> {
        match self.codec.encode(body) {
            Ok(body) => self.write_encoded(header, body).await,
            Err(e) => {
                warn!("encoding body error: {}", e);
                self.close().await?;
                Err(e)
            }
        }
    }

    /// Write one header and an already encoded body.
    ///
    /// The header frame always precedes the body frame and both are flushed
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding the header or writing fails; the stream
    /// is closed in that case.
    pub async fn write_encoded(&mut self, header: &Header, body: Bytes) -> Result<()> {
        if self.closed {
            return Err(ConnectionError::Closed.into());
        }

        let result = self.try_write(header, body).await;
        if let Err(e) = &result {
            warn!("writing frame error: {}", e);
            let _ = self.close().await;
        }
        result
    }

    async fn try_write(&mut self, header: &Header, body: Bytes) -> Result<()> {
        let header = self.codec.encode(header)?;
        self.frames.feed(Frame::new(FrameType::Header, header)).await?;
        self.frames.feed(Frame::new(FrameType::Body, body)).await?;
        self.frames.flush().await
    }

    /// Shut the write direction down. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to shut down.
    pub async fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.frames.get_mut().shutdown().await.map_err(Error::Io)
    }
}
