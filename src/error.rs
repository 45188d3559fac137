//! # Error Types
//!
//! Error handling for the peer link protocol.
//!
//! This module defines all error variants that can occur during protocol operations,
//! from low-level socket failures to handshake rejections and request resolution.
//!
//! ## Error Categories
//! - **Configuration Errors**: bad listen address, missing network key
//! - **Protocol Errors**: invalid frames, decode failures, version mismatches, unknown keys
//! - **Transport Errors**: refused connects, read/write failures, peer EOF
//! - **Request Errors**: a pending request that timed out or was cancelled
//!
//! Protocol and transport errors always close the offending connection and never
//! escape the reactor. Request errors are returned to the blocked caller only.
//!
//! ## Example Usage
//! ```rust
//! use peerlink::error::{ProtocolError, Result};
//! use peerlink::core::message::Message;
//!
//! fn parse(bytes: &[u8]) -> Result<Message> {
//!     Message::decode(bytes)
//! }
//!
//! match parse(b"m:1:") {
//!     Err(ProtocolError::DecodeError(reason)) => println!("rejected: {reason}"),
//!     other => println!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Handshake rejection reasons, sent back to the remote in the `error` field
    pub const ERR_UNKNOWN_KEY: &str = "unknown key";
    pub const ERR_PEER_DISABLED: &str = "server disabled";
    pub const ERR_MISSING_VERSION: &str = "missing protocol version";
    pub const ERR_ALREADY_CONNECTED: &str = "peer already connected";

    /// Frame and codec errors
    pub const ERR_TRUNCATED: &str = "unexpected end of input";
    pub const ERR_TRAILING_BYTES: &str = "trailing bytes after root value";
    pub const ERR_KEY_NOT_STRING: &str = "message key is not a string";
    pub const ERR_ROOT_NOT_MESSAGE: &str = "root value is not a message";

    /// Connection errors
    pub const ERR_HANDSHAKE_TIMEOUT: &str = "handshake timed out";
    pub const ERR_NOT_ESTABLISHED: &str = "message received before handshake completed";
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";

    /// Configuration errors
    pub const ERR_MISSING_NETWORK_KEY: &str = "network key is not set";
    pub const ERR_MISSING_LISTEN_ADDRESS: &str = "listen address is not set";
    pub const ERR_REACTOR_SPAWN: &str = "failed to spawn reactor thread";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(i64),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timed out")]
    RequestTimedOut,

    #[error("Request cancelled")]
    RequestCancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error is a violation by the remote end rather than a local or transport failure
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::DecodeError(_)
                | ProtocolError::InvalidFrame(_)
                | ProtocolError::OversizedFrame(_)
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::HandshakeError(_)
                | ProtocolError::DecryptionFailure
                | ProtocolError::UnexpectedMessage
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
