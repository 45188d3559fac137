//! Known remote servers.
//!
//! The link layer only needs two things from the application: the list of
//! peers it may authenticate ([`PeerRegistry`]) and per-peer callbacks for
//! connection lifecycle and inbound messages ([`Peer`]). [`BasicPeer`] and
//! [`StaticRegistry`] are ready-made implementations covering keep-alive,
//! request helpers and type-routed handlers.

use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, REQUEST_ID};
use crate::protocol::dispatcher::{message_type, Dispatcher};
use crate::transport::reactor::Reactor;

/// Message type sent to keep an idle link alive
pub const KEEP_ALIVE_TYPE: &str = "keepAlive";

/// Send a keep-alive after this much outbound silence
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Drop the link after this much inbound silence
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// A remote server this process may link with
pub trait Peer: Send + Sync {
    fn name(&self) -> &str;

    /// Pre-shared key identifying the remote's network
    fn key(&self) -> &str;

    /// Address dialled for outgoing connections
    fn address(&self) -> SocketAddr;

    fn is_enabled(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// An outgoing attempt exists that has not completed its handshake
    fn is_connecting(&self) -> bool;

    /// Handshake completed on `connection`
    fn on_connected(&self, connection: Arc<Connection>, remote_version: &str);

    /// `connection` was torn down
    fn on_disconnected(&self, connection: &Connection);

    /// Application message received on an established connection
    fn on_message(&self, connection: &Arc<Connection>, message: Message);

    /// Called once per reactor tick while connected
    fn send_keep_alive(&self);

    /// Called once per reactor tick while connected
    fn check_keep_alive_timeout(&self);

    /// Close the current connection, if any
    fn disconnect(&self);
}

/// Source of the peers known to this process
pub trait PeerRegistry: Send + Sync {
    fn peers(&self) -> Vec<Arc<dyn Peer>>;

    fn find(&self, name: &str) -> Option<Arc<dyn Peer>> {
        self.peers().into_iter().find(|peer| peer.name() == name)
    }
}

/// Fixed list of peers
#[derive(Default)]
pub struct StaticRegistry {
    peers: Vec<Arc<dyn Peer>>,
}

impl StaticRegistry {
    pub fn new(peers: Vec<Arc<dyn Peer>>) -> Self {
        Self { peers }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerRegistry for StaticRegistry {
    fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.clone()
    }
}

impl fmt::Debug for StaticRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.peers.iter().map(|p| p.name()))
            .finish()
    }
}

/// General-purpose [`Peer`] with keep-alive and a [`Dispatcher`] for inbound messages.
///
/// Inbound requests whose handler returns a reply are answered through
/// [`Connection::reply`]. Keep-alive messages are consumed here.
pub struct BasicPeer {
    name: String,
    address: SocketAddr,
    key: String,
    enabled: AtomicBool,
    connection: Mutex<Option<Arc<Connection>>>,
    remote_version: Mutex<Option<String>>,
    dispatcher: Dispatcher,
    keep_alive_interval: Duration,
    keep_alive_timeout: Duration,
}

impl BasicPeer {
    pub fn new(name: impl Into<String>, address: SocketAddr, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address,
            key: key.into(),
            enabled: AtomicBool::new(true),
            connection: Mutex::new(None),
            remote_version: Mutex::new(None),
            dispatcher: Dispatcher::new(),
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: KEEP_ALIVE_TIMEOUT,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive_interval = interval;
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }

    /// Plugin version the remote advertised during the last handshake
    pub fn remote_version(&self) -> Option<String> {
        self.remote_version.lock().clone()
    }

    /// Dial this peer through `reactor` unless a link or attempt already exists
    pub fn connect(self: &Arc<Self>, reactor: &Reactor) -> Arc<Connection> {
        let mut current = self.connection.lock();
        if let Some(existing) = current.as_ref() {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        let peer: Arc<dyn Peer> = self.clone();
        let connection = Connection::outgoing(reactor.context().clone(), peer, self.address);
        *current = Some(connection.clone());
        drop(current);

        info!(peer = %self.name, address = %self.address, "Connecting");
        reactor.request_open(&connection);
        connection
    }

    fn established(&self) -> Result<Arc<Connection>> {
        self.connection()
            .filter(|c| c.is_established())
            .ok_or(ProtocolError::ConnectionClosed)
    }

    /// Send on the current link using the link's default encryption
    pub fn send(&self, message: &Message) -> Result<()> {
        let connection = self.established()?;
        connection.send_message(message, connection.encrypt_by_default())
    }

    /// Send a request and block for its response.
    ///
    /// A zero `timeout` waits without bound.
    pub fn request(&self, message: Message, timeout: Duration) -> Result<Message> {
        let connection = self.established()?;
        let pending = connection.send_request(message, connection.encrypt_by_default())?;
        pending.get_timeout(timeout)
    }
}

impl Peer for BasicPeer {
    fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.is_established())
    }

    fn is_connecting(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| !c.is_established() && !c.is_closed())
    }

    fn on_connected(&self, connection: Arc<Connection>, remote_version: &str) {
        info!(peer = %self.name, remote_version, "Peer linked");
        *self.remote_version.lock() = Some(remote_version.to_owned());
        *self.connection.lock() = Some(connection);
    }

    fn on_disconnected(&self, connection: &Connection) {
        let mut current = self.connection.lock();
        if current.as_ref().is_some_and(|c| c.id() == connection.id()) {
            *current = None;
            info!(peer = %self.name, "Peer unlinked");
        }
    }

    fn on_message(&self, connection: &Arc<Connection>, message: Message) {
        if message_type(&message) == Some(KEEP_ALIVE_TYPE) {
            return;
        }

        match self.dispatcher.dispatch(connection, &message) {
            Ok(Some(reply)) if message.contains_key(REQUEST_ID) => {
                if let Err(e) = connection.reply(&message, reply, connection.encrypt_by_default()) {
                    warn!(peer = %self.name, error = %e, "Failed to send reply");
                }
            }
            Ok(_) => {}
            Err(ProtocolError::UnexpectedMessage) => {
                debug!(peer = %self.name, kind = ?message_type(&message), "No handler for message");
            }
            Err(e) => warn!(peer = %self.name, error = %e, "Message handler failed"),
        }
    }

    fn send_keep_alive(&self) {
        let Ok(connection) = self.established() else {
            return;
        };
        if connection.last_send().elapsed() >= self.keep_alive_interval {
            let ping = Message::new().with("type", KEEP_ALIVE_TYPE);
            if let Err(e) = connection.send_message(&ping, false) {
                warn!(peer = %self.name, error = %e, "Keep-alive failed");
            }
        }
    }

    fn check_keep_alive_timeout(&self) {
        let Ok(connection) = self.established() else {
            return;
        };
        let silent = connection.last_receive().elapsed();
        if silent > self.keep_alive_timeout {
            warn!(peer = %self.name, silent_ms = silent.as_millis() as u64, "Keep-alive timed out");
            connection.close();
        }
    }

    fn disconnect(&self) {
        let current = self.connection.lock().take();
        if let Some(connection) = current {
            debug!(peer = %self.name, connection = %connection, "Disconnecting");
            connection.close();
        }
    }
}

impl fmt::Debug for BasicPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicPeer")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("enabled", &self.is_enabled())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn peer(name: &str) -> Arc<BasicPeer> {
        Arc::new(BasicPeer::new(name, "127.0.0.1:25555".parse().unwrap(), "key"))
    }

    #[test]
    fn test_registry_lookup() {
        let a: Arc<dyn Peer> = peer("a");
        let b: Arc<dyn Peer> = peer("b");
        let registry = StaticRegistry::new(vec![a, b]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find("b").map(|p| p.name().to_owned()), Some("b".into()));
        assert!(registry.find("c").is_none());
    }

    #[test]
    fn test_fresh_peer_is_idle() {
        let p = peer("idle");
        assert!(p.is_enabled());
        assert!(!p.is_connected());
        assert!(!p.is_connecting());
        assert!(matches!(
            p.send(&Message::new()),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(matches!(
            p.request(Message::new(), Duration::from_millis(1)),
            Err(ProtocolError::ConnectionClosed)
        ));
        p.set_enabled(false);
        assert!(!p.is_enabled());
    }
}
