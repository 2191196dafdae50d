//! Multiplexed request/response RPC over a framed stream.
//!
//! A client opens a connection, sends a handshake naming the body codec, and
//! then issues any number of concurrent calls addressed as
//! `"Service.Method"`. The server resolves each call against its registered
//! services, runs the handler on its own task and writes exactly one
//! response.
//!
//! # Features
//!
//! - **Pluggable Codecs**: CBOR (default) or JSON, negotiated per connection
//! - **Multiplexing**: Many in-flight calls share one connection
//! - **Timeouts**: Connect, per-call and server-side handle timeouts
//! - **Typed Services**: Handlers are plain async functions over serde types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use tern_rpc::{Options, Server, Service, dial};
//! use tokio::net::TcpListener;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! struct Foo;
//!
//! async fn sum(_foo: Arc<Foo>, args: Args) -> Result<i64, String> {
//!     Ok(args.num1 + args.num2)
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new();
//!     server.register(Service::from_receiver(Foo).method("Sum", sum))?;
//!
//!     let listener = TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?.to_string();
//!     tokio::spawn(async move { server.accept(listener).await });
//!
//!     let client = dial(&addr, Options::default()).await?;
//!     let reply: i64 = client.call("Foo.Sum", &Args { num1: 1, num2: 2 }).await?;
//!     assert_eq!(reply, 3);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod codec;
pub mod error;
pub mod options;
pub mod protocol;
pub mod server;
pub mod service;

// Re-export commonly used types
pub use client::{AsyncCall, Call, Client, dial};
pub use codec::{CodecReader, CodecType, CodecWriter};
pub use error::{ConnectionError, Error, HandlerError, Result};
pub use options::{MAGIC_NUMBER, Options};
pub use protocol::Header;
pub use server::Server;
pub use service::{MethodType, Service, ServiceBuilder};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
