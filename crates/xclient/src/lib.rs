//! Service discovery and a multi-server client for `tern-rpc`.
//!
//! A [`Discovery`] holds the candidate server addresses and picks one per
//! call, either at random or round-robin. [`XClient`] dials the picked
//! address through `tern-rpc`, caches one client per address, and can also
//! broadcast a call to every server at once.
//!
//! # Example
//!
//! ```no_run
//! use tern_rpc::Options;
//! use tern_xclient::{MultiServersDiscovery, SelectMode, XClient};
//!
//! async fn example() -> tern_xclient::Result<()> {
//!     let discovery = MultiServersDiscovery::new(vec![
//!         "127.0.0.1:9001".to_string(),
//!         "127.0.0.1:9002".to_string(),
//!     ]);
//!     let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());
//!
//!     let reply: i64 = xclient.call("Foo.Sum", &(1, 2)).await?;
//!     println!("reply: {reply}");
//!
//!     xclient.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod discovery;
pub mod error;
pub mod xclient;

pub use discovery::{
    DEFAULT_REFRESH_INTERVAL, Discovery, MultiServersDiscovery, RefreshingDiscovery, SelectMode,
    ServerSource,
};
pub use error::{Error, Result};
pub use xclient::XClient;
