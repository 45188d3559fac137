//! Key-based handshake identifying which known peer a connection belongs to.
//!
//! The handshake travels in the clear; authentication comes from proving
//! knowledge of the pre-shared keys. The digest inputs are deliberately
//! asymmetric and must stay exactly as they are for interoperability:
//!
//! ```text
//! client (dialling side)        key = hex(SHA1("<localNetworkKey>:<remotePeerKey>"))
//! server (accepting side)   expected = hex(SHA1("<peerKey>:<localNetworkKey>"))
//! ```
//!
//! The dialling server stores the remote's network key as its peer key, and the
//! accepting server stores the dialler's network key as its peer key, so both
//! sides hash `"<dialler network key>:<acceptor network key>"`.

use sha1::{Digest, Sha1};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::{PLUGIN_VERSION, PROTOCOL_VERSION};
use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::peer::Peer;

pub const FIELD_PROTOCOL_VERSION: &str = "protocolVersion";
pub const FIELD_PLUGIN_VERSION: &str = "pluginVersion";
pub const FIELD_KEY: &str = "key";
pub const FIELD_ERROR: &str = "error";

/// Lowercase hex SHA-1 of `"<first>:<second>"`
pub fn key_digest(first: &str, second: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(first.as_bytes());
    hasher.update(b":");
    hasher.update(second.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest the dialling side presents for `remote_peer_key`
pub fn client_digest(local_network_key: &str, remote_peer_key: &str) -> String {
    key_digest(local_network_key, remote_peer_key)
}

/// Digest the accepting side expects from the peer stored under `peer_key`
pub fn server_digest(peer_key: &str, local_network_key: &str) -> String {
    key_digest(peer_key, local_network_key)
}

/// Opening message sent by the dialling side once the transport is up
pub fn client_hello(local_network_key: &str, remote_peer_key: &str) -> Message {
    Message::new()
        .with(FIELD_PROTOCOL_VERSION, PROTOCOL_VERSION)
        .with(FIELD_PLUGIN_VERSION, PLUGIN_VERSION)
        .with(FIELD_KEY, client_digest(local_network_key, remote_peer_key))
}

/// Reply sent by the accepting side when the key matched an enabled peer
pub fn server_hello() -> Message {
    Message::new()
        .with(FIELD_PROTOCOL_VERSION, PROTOCOL_VERSION)
        .with(FIELD_PLUGIN_VERSION, PLUGIN_VERSION)
}

/// Rejection sent before closing
pub fn rejection(reason: &str) -> Message {
    Message::new().with(FIELD_ERROR, reason)
}

/// Check the protocol version gate and return the remote plugin version.
///
/// A missing or different `protocolVersion`, or a missing `pluginVersion`, is fatal.
pub fn check_version(hello: &Message) -> Result<String> {
    let version = hello.get_i64(FIELD_PROTOCOL_VERSION).ok_or_else(|| {
        ProtocolError::HandshakeError(constants::ERR_MISSING_VERSION.into())
    })?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    hello
        .get_str(FIELD_PLUGIN_VERSION)
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_MISSING_VERSION.into()))
}

/// First peer whose server-side digest equals `presented_key`
#[instrument(skip_all)]
pub fn match_peer(
    presented_key: &str,
    local_network_key: &str,
    peers: &[Arc<dyn Peer>],
) -> Option<Arc<dyn Peer>> {
    let found = peers
        .iter()
        .find(|peer| server_digest(peer.key(), local_network_key) == presented_key)
        .cloned();
    debug!(matched = found.as_ref().map(|p| p.name()), "Handshake key lookup");
    found
}
