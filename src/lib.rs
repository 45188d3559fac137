//! # peerlink
//!
//! Authenticated, framed messaging between independent server processes over TCP.
//!
//! Servers that share pre-shared keys link up through a key-digest handshake and
//! then exchange [`Message`]s: ordered maps of typed values with a compact text
//! encoding. Requests and responses are correlated by id, and any frame may be
//! encrypted with the shared network key.
//!
//! All socket I/O happens on one reactor thread. Any thread may send, and request
//! results can be awaited synchronously from caller threads.
//!
//! ```no_run
//! use peerlink::config::NetworkConfig;
//! use peerlink::peer::{BasicPeer, Peer, StaticRegistry};
//! use peerlink::transport::Reactor;
//! use std::sync::Arc;
//!
//! # fn main() -> peerlink::Result<()> {
//! let config = NetworkConfig::default_with_overrides(|c| {
//!     c.server.network_key = "survival-net".into();
//! });
//! let lobby = Arc::new(BasicPeer::new("lobby", "10.0.0.2:25555".parse().unwrap(), "lobby-net"));
//! let peers: Vec<Arc<dyn Peer>> = vec![lobby.clone()];
//! let reactor = Reactor::start(&config, Arc::new(StaticRegistry::new(peers)))?;
//! lobby.connect(&reactor);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::core::message::{Message, Value};
pub use error::{ProtocolError, Result};
