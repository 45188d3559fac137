//! # Protocol Layer
//!
//! Everything above framing: the per-connection state machine, the key-based
//! handshake, request/response correlation and type-routed dispatch.
//!
//! ## Components
//! - **Connection**: state machine, outbound queue and pending request table
//! - **Handshake**: version gate and SHA-1 key digests
//! - **Request**: blocking single-assignment result for a pending request
//! - **Dispatcher**: handlers keyed by a message's `type` field
//!
//! ## Handshake
//! ```text
//! dialler                               acceptor
//!   │── {protocolVersion, pluginVersion, key} ──►│  version gate, key lookup
//!   │◄──────── {protocolVersion, pluginVersion} ──│  or {error} then close
//! ```

pub mod connection;
pub mod dispatcher;
pub mod handshake;
pub mod request;

pub use connection::{Connection, ConnectionState, Direction, LinkContext};
pub use dispatcher::Dispatcher;
pub use request::{RequestResult, RequestState};

#[cfg(test)]
mod tests;
