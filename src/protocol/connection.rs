//! Per-peer protocol state machine.
//!
//! A [`Connection`] owns the inbound reassembly buffer, the outbound frame
//! queue and the table of pending requests for one TCP peer. It never touches
//! a socket: the reactor feeds it bytes through [`Connection::receive`] and
//! drains its queue through [`Connection::write_pending`]. Any thread may send
//! on it; sends only enqueue and then ask the reactor to arm write readiness.
//!
//! ```text
//! None ──► Handshake ──► Established
//!   │          │              │
//!   └──────────┴──────────────┴──► Closed (terminal)
//! ```

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::core::codec::{Frame, FrameCodec, HEADER_SIZE};
use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::peer::{Peer, PeerRegistry};
use crate::protocol::handshake;
use crate::protocol::request::RequestResult;
use crate::transport::reactor::ReactorHandle;
use crate::utils::crypto::{ChaChaCipher, FrameCipher};
use crate::utils::metrics::global_metrics;

/// Reserved key carrying the id of an outgoing request
pub const REQUEST_ID: &str = "requestId";

/// Reserved key carrying the id of the request being answered
pub const RESPONSE_ID: &str = "responseId";

/// Process-unique connection identifier
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Handshake,
    Established,
    Closed,
}

/// Result of draining the outbound queue into a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Every queued frame was written
    Drained,
    /// The socket stopped accepting bytes; the remainder is queued at the front
    Blocked,
}

/// State shared by every connection of one reactor
pub struct LinkContext {
    network_key: String,
    registry: Arc<dyn PeerRegistry>,
    cipher: Arc<dyn FrameCipher>,
    max_frame_size: usize,
    handshake_timeout: Duration,
    encrypt_by_default: bool,
}

impl LinkContext {
    pub fn new(network_key: impl Into<String>, registry: Arc<dyn PeerRegistry>) -> Self {
        Self {
            network_key: network_key.into(),
            registry,
            cipher: Arc::new(ChaChaCipher),
            max_frame_size: crate::config::MAX_PAYLOAD_SIZE,
            handshake_timeout: crate::config::HANDSHAKE_TIMEOUT,
            encrypt_by_default: false,
        }
    }

    /// Context for a reactor started from `config`
    pub fn from_config(config: &NetworkConfig, registry: Arc<dyn PeerRegistry>) -> Self {
        Self::new(config.server.network_key.clone(), registry)
            .with_max_frame_size(config.transport.max_frame_size)
            .with_handshake_timeout(config.server.handshake_timeout)
            .with_encrypt_by_default(config.transport.encrypt_by_default)
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn FrameCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_encrypt_by_default(mut self, encrypt: bool) -> Self {
        self.encrypt_by_default = encrypt;
        self
    }

    pub fn network_key(&self) -> &str {
        &self.network_key
    }

    pub fn registry(&self) -> &Arc<dyn PeerRegistry> {
        &self.registry
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn encrypt_by_default(&self) -> bool {
        self.encrypt_by_default
    }
}

impl fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkContext")
            .field("max_frame_size", &self.max_frame_size)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("encrypt_by_default", &self.encrypt_by_default)
            .finish_non_exhaustive()
    }
}

/// One TCP peer, from accept/dial until close
pub struct Connection {
    id: ConnectionId,
    direction: Direction,
    remote_addr: SocketAddr,
    context: Arc<LinkContext>,
    state: Mutex<ConnectionState>,
    name: Mutex<String>,
    peer: Mutex<Option<Arc<dyn Peer>>>,
    reactor: Mutex<Option<ReactorHandle>>,
    inbound: Mutex<BytesMut>,
    codec: FrameCodec,
    outbound: Mutex<VecDeque<Bytes>>,
    next_request_id: AtomicI64,
    requests: Mutex<HashMap<i64, RequestResult>>,
    last_send: Mutex<Instant>,
    last_receive: Mutex<Instant>,
    handshake_deadline: Mutex<Option<Instant>>,
    link_key: Mutex<Option<String>>,
    torn_down: AtomicBool,
}

impl Connection {
    fn new(
        context: Arc<LinkContext>,
        direction: Direction,
        remote_addr: SocketAddr,
        peer: Option<Arc<dyn Peer>>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let name = match &peer {
            Some(peer) => peer.name().to_owned(),
            None => remote_addr.to_string(),
        };
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            remote_addr,
            codec: FrameCodec::with_max_length(context.max_frame_size),
            context,
            state: Mutex::new(ConnectionState::None),
            name: Mutex::new(name),
            peer: Mutex::new(peer),
            reactor: Mutex::new(None),
            inbound: Mutex::new(BytesMut::new()),
            outbound: Mutex::new(VecDeque::new()),
            next_request_id: AtomicI64::new(1),
            requests: Mutex::new(HashMap::new()),
            last_send: Mutex::new(now),
            last_receive: Mutex::new(now),
            handshake_deadline: Mutex::new(None),
            link_key: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Connection accepted from `remote_addr`; the peer is unknown until the handshake
    pub fn incoming(context: Arc<LinkContext>, remote_addr: SocketAddr) -> Arc<Self> {
        Self::new(context, Direction::Incoming, remote_addr, None)
    }

    /// Connection to be dialled to `peer` at `remote_addr`
    pub fn outgoing(
        context: Arc<LinkContext>,
        peer: Arc<dyn Peer>,
        remote_addr: SocketAddr,
    ) -> Arc<Self> {
        Self::new(context, Direction::Outgoing, remote_addr, Some(peer))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Display name: the bound peer's name, or the remote address before binding
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn peer(&self) -> Option<Arc<dyn Peer>> {
        self.peer.lock().clone()
    }

    /// Whether application sends on this connection should be encrypted
    pub fn encrypt_by_default(&self) -> bool {
        self.context.encrypt_by_default
    }

    pub fn last_send(&self) -> Instant {
        *self.last_send.lock()
    }

    pub fn last_receive(&self) -> Instant {
        *self.last_receive.lock()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.lock().is_empty()
    }

    /// Deadline by which the handshake must complete, armed while in `Handshake`
    pub fn handshake_deadline(&self) -> Option<Instant> {
        *self.handshake_deadline.lock()
    }

    /// Moves to `to` unless already closed. Returns whether the transition happened.
    fn transition(&self, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return false;
        }
        debug!(connection = %self, from = ?*state, to = ?to, "State transition");
        *state = to;
        true
    }

    pub(crate) fn attach(&self, reactor: ReactorHandle) {
        *self.reactor.lock() = Some(reactor);
    }

    fn reactor(&self) -> Option<ReactorHandle> {
        self.reactor.lock().clone()
    }

    /// Inbound socket accepted: wait for the remote's handshake
    pub fn on_accepted(&self) {
        if self.transition(ConnectionState::Handshake) {
            self.arm_handshake_deadline();
            info!(connection = %self, "Accepted connection, awaiting handshake");
        }
    }

    /// Outbound transport connected: present our key to the remote
    pub fn on_transport_connected(&self) -> Result<()> {
        let peer = self
            .peer()
            .ok_or_else(|| ProtocolError::HandshakeError("outgoing connection without a peer".into()))?;
        let hello = handshake::client_hello(&self.context.network_key, peer.key());
        *self.link_key.lock() = hello.get_str(handshake::FIELD_KEY).map(str::to_owned);
        self.send_message(&hello, false)?;
        if self.transition(ConnectionState::Handshake) {
            self.arm_handshake_deadline();
        }
        info!(connection = %self, "Connected, handshake sent");
        Ok(())
    }

    /// A zero handshake timeout leaves the deadline unarmed
    fn arm_handshake_deadline(&self) {
        let timeout = self.context.handshake_timeout;
        *self.handshake_deadline.lock() = (!timeout.is_zero()).then(|| Instant::now() + timeout);
    }

    /// Handshake deadline passed before the handshake completed
    pub fn on_handshake_timeout(&self) {
        if self.state() == ConnectionState::Handshake {
            warn!(connection = %self, "{}", constants::ERR_HANDSHAKE_TIMEOUT);
            global_metrics().handshake_failed();
            self.close();
        }
    }

    /// Feed bytes read from the socket.
    ///
    /// Complete frames are decrypted, decoded and dispatched in order. Any protocol
    /// violation closes the connection; remaining buffered input is discarded.
    pub fn receive(self: &Arc<Self>, data: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.inbound.lock().extend_from_slice(data);

        loop {
            if self.is_closed() {
                self.inbound.lock().clear();
                return;
            }

            let next = {
                let mut inbound = self.inbound.lock();
                let mut codec = self.codec;
                codec.decode(&mut inbound)
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };

            if let Err(e) = self.handle_frame(frame) {
                self.fail(e);
                return;
            }
        }
    }

    /// Close after a protocol violation
    fn fail(&self, error: ProtocolError) {
        if error.is_protocol_violation() {
            global_metrics().protocol_error();
        }
        if self.state() == ConnectionState::Handshake {
            global_metrics().handshake_failed();
        }
        warn!(connection = %self, error = %error, "Closing connection");
        self.close();
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        global_metrics().frame_received();
        let message = if frame.is_encrypted() {
            let key = self.link_key().ok_or(ProtocolError::DecryptionFailure)?;
            let plain = self.context.cipher.decrypt(key.as_bytes(), &frame.payload)?;
            Message::decode(&plain)?
        } else {
            Message::decode(&frame.payload)?
        };
        *self.last_receive.lock() = Instant::now();
        debug!(connection = %self, fields = message.len(), encrypted = frame.is_encrypted(), "Frame received");

        match self.state() {
            ConnectionState::Handshake => match self.direction {
                Direction::Incoming => self.accept_handshake(&message),
                Direction::Outgoing => self.complete_handshake(&message),
            },
            ConnectionState::Established => {
                self.dispatch(message);
                Ok(())
            }
            ConnectionState::None => Err(ProtocolError::HandshakeError(
                constants::ERR_NOT_ESTABLISHED.into(),
            )),
            ConnectionState::Closed => Ok(()),
        }
    }

    /// Accepting side: authenticate the remote against the known peers
    fn accept_handshake(self: &Arc<Self>, hello: &Message) -> Result<()> {
        let remote_version = handshake::check_version(hello)?;
        let key = hello
            .get_str(handshake::FIELD_KEY)
            .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_UNKNOWN_KEY.into()))?;

        let peers = self.context.registry.peers();
        let Some(peer) = handshake::match_peer(key, &self.context.network_key, &peers) else {
            self.send_message(&handshake::rejection(constants::ERR_UNKNOWN_KEY), false)?;
            return Err(ProtocolError::HandshakeError(
                constants::ERR_UNKNOWN_KEY.into(),
            ));
        };

        if !peer.is_enabled() {
            self.send_message(&handshake::rejection(constants::ERR_PEER_DISABLED), false)?;
            return Err(ProtocolError::HandshakeError(format!(
                "{}: {}",
                constants::ERR_PEER_DISABLED,
                peer.name()
            )));
        }

        if peer.is_connected() {
            return Err(ProtocolError::HandshakeError(format!(
                "{}: {}",
                constants::ERR_ALREADY_CONNECTED,
                peer.name()
            )));
        }

        if peer.is_connecting() {
            info!(peer = peer.name(), "Dropping stale outgoing attempt in favour of inbound");
            peer.disconnect();
        }

        *self.name.lock() = peer.name().to_owned();
        *self.peer.lock() = Some(peer.clone());
        *self.link_key.lock() = Some(key.to_owned());
        self.send_message(&handshake::server_hello(), false)?;
        if !self.transition(ConnectionState::Established) {
            return Ok(());
        }
        *self.handshake_deadline.lock() = None;
        global_metrics().handshake_success();
        info!(connection = %self, remote_version = %remote_version, "Handshake accepted");
        peer.on_connected(self.clone(), &remote_version);
        Ok(())
    }

    /// Dialling side: the remote's reply completes the handshake
    fn complete_handshake(self: &Arc<Self>, reply: &Message) -> Result<()> {
        if let Some(reason) = reply.get_str(handshake::FIELD_ERROR) {
            return Err(ProtocolError::HandshakeError(format!(
                "rejected by remote: {reason}"
            )));
        }
        let remote_version = reply
            .get_str(handshake::FIELD_PLUGIN_VERSION)
            .unwrap_or_default()
            .to_owned();

        if !self.transition(ConnectionState::Established) {
            return Ok(());
        }
        *self.handshake_deadline.lock() = None;
        global_metrics().handshake_success();
        info!(connection = %self, remote_version = %remote_version, "Handshake completed");
        if let Some(peer) = self.peer() {
            peer.on_connected(self.clone(), &remote_version);
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        if let Some(id) = message.get_i64(RESPONSE_ID) {
            let pending = self.requests.lock().remove(&id);
            match pending {
                Some(result) => {
                    if result.set_result(message) {
                        global_metrics().request_completed();
                    }
                }
                None => {
                    global_metrics().response_unmatched();
                    debug!(connection = %self, response_id = id, "Dropping response with no pending request");
                }
            }
            return;
        }

        match self.peer() {
            Some(peer) => peer.on_message(self, message),
            None => debug!(connection = %self, "Dropping message for unbound connection"),
        }
    }

    /// Frame and queue a message. A no-op once the connection is closed.
    pub fn send_message(&self, message: &Message, encrypt: bool) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let encoded = message.encode();
        let payload = if encrypt {
            let key = self.link_key().ok_or(ProtocolError::EncryptionFailure)?;
            self.context.cipher.encrypt(key.as_bytes(), &encoded)?
        } else {
            encoded
        };

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        let mut codec = self.codec;
        codec.encode(Frame::new(payload, encrypt), &mut frame)?;

        self.outbound.lock().push_back(frame.freeze());
        *self.last_send.lock() = Instant::now();
        global_metrics().frame_sent(encrypt);

        if let Some(reactor) = self.reactor() {
            reactor.request_write(self);
        }
        Ok(())
    }

    /// Send a request and return its pending result without blocking.
    ///
    /// The message is stamped with a fresh `requestId`; the result completes when a
    /// message carrying the same value as `responseId` arrives.
    pub fn send_request(&self, mut message: Message, encrypt: bool) -> Result<RequestResult> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        message.insert(REQUEST_ID, id);
        let result = RequestResult::new(id);
        self.requests.lock().insert(id, result.clone());

        if let Err(e) = self.send_message(&message, encrypt) {
            self.requests.lock().remove(&id);
            return Err(e);
        }
        Ok(result)
    }

    /// Answer `request` with `response`, copying its `requestId` into `responseId`
    pub fn reply(&self, request: &Message, mut response: Message, encrypt: bool) -> Result<()> {
        let id = request
            .get_i64(REQUEST_ID)
            .ok_or_else(|| ProtocolError::Custom("message is not a request".into()))?;
        response.insert(RESPONSE_ID, id);
        self.send_message(&response, encrypt)
    }

    /// Write queued frames through `write` until the queue drains or the socket blocks.
    ///
    /// A partially written frame has its unwritten tail requeued at the front, so
    /// bytes already written are never sent twice.
    pub fn write_pending<F>(&self, mut write: F) -> io::Result<WriteProgress>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        loop {
            let Some(frame) = self.outbound.lock().pop_front() else {
                return Ok(WriteProgress::Drained);
            };

            match write(&frame) {
                Ok(n) if n >= frame.len() => {
                    global_metrics().bytes_written(frame.len() as u64);
                }
                Ok(n) => {
                    global_metrics().bytes_written(n as u64);
                    self.outbound.lock().push_front(frame.slice(n..));
                    return Ok(WriteProgress::Blocked);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.outbound.lock().push_front(frame);
                    return Ok(WriteProgress::Blocked);
                }
                Err(e) => {
                    self.outbound.lock().push_front(frame);
                    return Err(e);
                }
            }
        }
    }

    /// Time out pending requests older than `ttl`. Returns how many were swept.
    pub fn expire_requests(&self, ttl: Duration) -> usize {
        let expired: Vec<RequestResult> = {
            let mut requests = self.requests.lock();
            let stale: Vec<i64> = requests
                .iter()
                .filter(|(_, r)| r.is_done() || r.age() > ttl)
                .map(|(id, _)| *id)
                .collect();
            stale.iter().filter_map(|id| requests.remove(id)).collect()
        };

        let mut swept = 0;
        for result in expired {
            if result.time_out() {
                swept += 1;
                global_metrics().request_abandoned();
            }
        }
        if swept > 0 {
            debug!(connection = %self, swept, "Expired stale requests");
        }
        swept
    }

    /// Graceful close: queued output is flushed by the reactor before teardown.
    ///
    /// Idempotent. Without a reactor the connection is torn down immediately.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        debug!(connection = %self, "Close requested");

        let scheduled = match self.reactor() {
            Some(reactor) => reactor.request_close(self),
            None => false,
        };
        if !scheduled {
            self.teardown();
        }
    }

    /// Hard close after a transport failure: queued output is dropped
    pub(crate) fn abort(&self) {
        *self.state.lock() = ConnectionState::Closed;
        self.outbound.lock().clear();
    }

    /// Final cleanup, performed at most once.
    ///
    /// Waiting requests are cancelled and the bound peer is told the connection is gone.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = ConnectionState::Closed;
        self.inbound.lock().clear();

        let pending: Vec<RequestResult> = self.requests.lock().drain().map(|(_, r)| r).collect();
        for result in pending {
            if result.cancel() {
                global_metrics().request_abandoned();
            }
        }

        match self.peer() {
            Some(peer) => {
                info!(connection = %self, "Connection closed");
                peer.on_disconnected(self);
            }
            None => info!(connection = %self, "Connection closed before a peer was bound"),
        }
    }

    /// Secret both ends derived from the handshake; keys encrypted frames
    fn link_key(&self) -> Option<String> {
        self.link_key.lock().clone()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Incoming => "<-",
            Direction::Outgoing => "->",
        };
        write!(f, "#{} {} {}", self.id, arrow, self.name.lock())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::codec::encode_header;
    use crate::peer::StaticRegistry;

    fn context() -> Arc<LinkContext> {
        Arc::new(LinkContext::new("net", Arc::new(StaticRegistry::new(Vec::new()))))
    }

    fn incoming() -> Arc<Connection> {
        Connection::incoming(context(), "127.0.0.1:40000".parse().unwrap())
    }

    fn drain(conn: &Connection) -> Vec<u8> {
        let mut out = Vec::new();
        conn.write_pending(|chunk| {
            out.extend_from_slice(chunk);
            Ok(chunk.len())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_send_frames_with_header() {
        let conn = incoming();
        let msg = Message::new().with("a", 1i64);
        conn.send_message(&msg, false).unwrap();

        let bytes = drain(&conn);
        let body = msg.encode();
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..4], &(body.len() as u32).to_be_bytes()[1..]);
        assert_eq!(&bytes[4..], &body[..]);
    }

    #[test]
    fn test_encrypted_send_needs_handshake_secret() {
        let conn = incoming();
        assert!(matches!(
            conn.send_message(&Message::new().with("secret", "x"), true),
            Err(ProtocolError::EncryptionFailure)
        ));
        assert!(!conn.has_pending_output());
    }

    #[test]
    fn test_partial_write_requeues_tail() {
        let conn = incoming();
        conn.send_message(&Message::new().with("first", "aaaaaaaa"), false)
            .unwrap();
        conn.send_message(&Message::new().with("second", "bbbbbbbb"), false)
            .unwrap();
        let mut expected = Vec::new();
        {
            // Snapshot of what a perfect writer would see
            let probe = incoming();
            probe
                .send_message(&Message::new().with("first", "aaaaaaaa"), false)
                .unwrap();
            probe
                .send_message(&Message::new().with("second", "bbbbbbbb"), false)
                .unwrap();
            expected.extend(drain(&probe));
        }

        let mut wire = Vec::new();
        let mut budget = 7usize;
        loop {
            let progress = conn
                .write_pending(|chunk| {
                    if budget == 0 {
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                    let n = chunk.len().min(budget);
                    budget -= n;
                    wire.extend_from_slice(&chunk[..n]);
                    Ok(n)
                })
                .unwrap();
            if progress == WriteProgress::Drained {
                break;
            }
            budget = 7;
        }
        assert_eq!(wire, expected);
        assert!(!conn.has_pending_output());
    }

    #[test]
    fn test_write_error_keeps_frame_queued() {
        let conn = incoming();
        conn.send_message(&Message::new(), false).unwrap();
        let err = conn
            .write_pending(|_| Err(io::ErrorKind::BrokenPipe.into()))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(conn.has_pending_output());
    }

    #[test]
    fn test_send_after_close_is_noop() {
        let conn = incoming();
        conn.close();
        conn.send_message(&Message::new().with("late", true), false)
            .unwrap();
        assert!(!conn.has_pending_output());
        assert!(matches!(
            conn.send_request(Message::new(), false),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_request_ids_increase_from_one() {
        let conn = incoming();
        let first = conn.send_request(Message::new(), false).unwrap();
        let second = conn.send_request(Message::new(), false).unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(conn.pending_requests(), 2);
    }

    #[test]
    fn test_expire_requests_times_out_stale_entries() {
        let conn = incoming();
        let result = conn.send_request(Message::new(), false).unwrap();
        assert_eq!(conn.expire_requests(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(conn.expire_requests(Duration::from_millis(1)), 1);
        assert_eq!(conn.pending_requests(), 0);
        assert!(matches!(
            result.try_get(),
            Some(Err(ProtocolError::RequestTimedOut))
        ));
    }

    #[test]
    fn test_teardown_cancels_waiting_requests() {
        let conn = incoming();
        let result = conn.send_request(Message::new(), false).unwrap();
        conn.close();
        assert!(conn.is_torn_down());
        assert!(matches!(
            result.try_get(),
            Some(Err(ProtocolError::RequestCancelled))
        ));
    }

    #[test]
    fn test_garbage_before_handshake_closes() {
        let conn = incoming();
        conn.on_accepted();
        assert!(conn.handshake_deadline().is_some());
        let mut frame = encode_header(0, 3).unwrap().to_vec();
        frame.extend_from_slice(b"zzz");
        conn.receive(&frame);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_zero_handshake_timeout_never_expires() {
        let ctx = Arc::new(
            LinkContext::new("net", Arc::new(StaticRegistry::new(Vec::new())))
                .with_handshake_timeout(Duration::ZERO),
        );
        let conn = Connection::incoming(ctx, "127.0.0.1:40001".parse().unwrap());
        conn.on_accepted();
        assert_eq!(conn.state(), ConnectionState::Handshake);
        assert!(conn.handshake_deadline().is_none());
    }

    #[test]
    fn test_frame_before_accept_is_rejected() {
        let conn = incoming();
        let msg = Message::new().with("hello", true);
        let mut frame = encode_header(0, msg.encode().len()).unwrap().to_vec();
        frame.extend_from_slice(&msg.encode());
        conn.receive(&frame);
        assert!(conn.is_closed());
    }
}
