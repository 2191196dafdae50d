//! Message framing for the wire protocol.
//!
//! Every unit on the wire is a frame: a 9-byte prefix (payload length, frame
//! type, CRC32 of the payload) followed by the payload. A connection carries
//! one `Handshake` frame, then `Header`/`Body` pairs until it closes.

use crate::error::{Error, ProtocolError};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame prefix size (4 bytes length + 1 byte type + 4 bytes checksum).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Read half of a connection, boxed so clients and servers stay non-generic.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Frame stream over the read half of a connection.
pub type FrameReader = FramedRead<BoxedReader, FrameCodec>;

/// Frame sink over the write half of a connection.
pub type FrameWriter = FramedWrite<BoxedWriter, FrameCodec>;

/// Type of frame being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Option negotiation, first frame on a connection.
    Handshake = 0x01,
    /// Encoded request/response header.
    Header = 0x02,
    /// Encoded body following a header.
    Body = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::Header),
            0x03 => Ok(Self::Body),
            _ => Err(ProtocolError::InvalidFrame(format!(
                "Unknown frame type: {value:#x}"
            ))),
        }
    }
}

/// A frame in the wire protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Type of this frame.
    pub frame_type: FrameType,
    /// Frame payload.
    pub payload: Bytes,
    /// Optional checksum for integrity.
    pub checksum: Option<u32>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        let checksum = Some(crc32fast::hash(&payload));
        Self {
            frame_type,
            payload,
            checksum,
        }
    }

    /// Verify the checksum if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the checksum is invalid.
    pub fn verify_checksum(&self) -> Result<(), ProtocolError> {
        if let Some(expected) = self.checksum {
            let actual = crc32fast::hash(&self.payload);
            if expected != actual {
                return Err(ProtocolError::ChecksumMismatch { expected, actual });
            }
        }
        Ok(())
    }
}

/// Codec for encoding/decoding frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek the prefix without consuming
        let mut prefix = &buf[..FRAME_HEADER_SIZE];
        let payload_len = prefix.get_u32() as usize;
        let frame_type_byte = prefix.get_u8();
        let checksum = prefix.get_u32();

        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            }
            .into());
        }

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let frame_type = FrameType::try_from(frame_type_byte)?;

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let frame = Frame {
            frame_type,
            payload,
            checksum: if checksum != 0 { Some(checksum) } else { None },
        };
        frame.verify_checksum()?;

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();

        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            }
            .into());
        }

        buf.reserve(FRAME_HEADER_SIZE + payload_len);

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload_len as u32);
        buf.put_u8(frame.frame_type as u8);
        buf.put_u32(frame.checksum.unwrap_or(0));
        buf.put(frame.payload);

        Ok(())
    }
}

/// Split a duplex stream into a frame reader and a frame writer.
pub fn split<S>(stream: S) -> (FrameReader, FrameWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    let reader: BoxedReader = Box::new(read_half);
    let writer: BoxedWriter = Box::new(write_half);

    (
        FramedRead::new(reader, FrameCodec::new()),
        FramedWrite::new(writer, FrameCodec::new()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::new(FrameType::Header, Bytes::from("Foo.Sum"));

        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.frame_type, frame.frame_type);
        assert_eq!(decoded.payload, frame.payload);
        assert_eq!(decoded.checksum, frame.checksum);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.put_u32(100);
        buf.put_u8(FrameType::Body as u8);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_checksum_verification() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let payload = b"Hello, World!";
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload.len() as u32);
        buf.put_u8(FrameType::Body as u8);
        buf.put_u32(12345);
        buf.put_slice(payload);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.put_u32(0);
        buf.put_u8(0x7f);
        buf.put_u32(0);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::InvalidFrame(_)))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(4);
        let mut buf = BytesMut::new();

        let result = codec.encode(Frame::new(FrameType::Body, Bytes::from("too long")), &mut buf);

        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::FrameTooLarge { size: 8, max: 4 }))
        ));
    }
}
