//! Protocol layer for the RPC engine.
//!
//! A connection looks like this on the wire:
//!
//! ```text
//! | Handshake (JSON) | Header, Body | Header, Body | ...
//! |<- any codec    ->|<-    negotiated codec     ->|
//! ```

pub mod framing;
pub mod handshake;
pub mod header;

pub use framing::{Frame, FrameCodec, FrameReader, FrameType, FrameWriter};
pub use handshake::Handshake;
pub use header::Header;
