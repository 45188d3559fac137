// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PLUGIN_VERSION, PROTOCOL_VERSION};
use crate::core::codec::{encode_header, FLAG_ENCRYPTED};
use crate::core::message::Message;
use crate::error::{constants, ProtocolError};
use crate::peer::{BasicPeer, Peer, StaticRegistry};
use crate::protocol::connection::{Connection, ConnectionState, LinkContext, RESPONSE_ID};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::{self, client_hello};

const ALPHA_KEY: &str = "alpha-net";
const BETA_KEY: &str = "beta-net";

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Everything written so far, as it would appear on the socket
fn drain(conn: &Connection) -> Vec<u8> {
    let mut out = Vec::new();
    conn.write_pending(|chunk| {
        out.extend_from_slice(chunk);
        Ok(chunk.len())
    })
    .unwrap();
    out
}

fn frame(message: &Message) -> Vec<u8> {
    let body = message.encode();
    let mut out = encode_header(0, body.len()).unwrap().to_vec();
    out.extend_from_slice(&body);
    out
}

/// Split a byte stream into decoded messages
fn messages(mut bytes: &[u8]) -> Vec<Message> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let len = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]) as usize;
        out.push(Message::decode(&bytes[4..4 + len]).unwrap());
        bytes = &bytes[4 + len..];
    }
    out
}

/// Two servers: "alpha" dials "beta"
struct Pair {
    client: Arc<Connection>,
    server: Arc<Connection>,
    beta_on_alpha: Arc<BasicPeer>,
    alpha_on_beta: Arc<BasicPeer>,
}

fn pair_with(server_dispatcher: Dispatcher) -> Pair {
    let beta_on_alpha = Arc::new(BasicPeer::new("beta", addr(2), BETA_KEY));
    let alpha_on_beta =
        Arc::new(BasicPeer::new("alpha", addr(1), ALPHA_KEY).with_dispatcher(server_dispatcher));

    let alpha_peers: Vec<Arc<dyn Peer>> = vec![beta_on_alpha.clone()];
    let beta_peers: Vec<Arc<dyn Peer>> = vec![alpha_on_beta.clone()];
    let alpha_ctx = Arc::new(LinkContext::new(
        ALPHA_KEY,
        Arc::new(StaticRegistry::new(alpha_peers)),
    ));
    let beta_ctx = Arc::new(LinkContext::new(
        BETA_KEY,
        Arc::new(StaticRegistry::new(beta_peers)),
    ));

    let client = Connection::outgoing(alpha_ctx, beta_on_alpha.clone(), addr(2));
    let server = Connection::incoming(beta_ctx, addr(1));
    Pair {
        client,
        server,
        beta_on_alpha,
        alpha_on_beta,
    }
}

fn pair() -> Pair {
    pair_with(Dispatcher::new())
}

impl Pair {
    fn start(&self) {
        self.server.on_accepted();
        self.client.on_transport_connected().unwrap();
    }

    /// Move bytes both ways until neither side has output left
    fn pump(&self) {
        for _ in 0..8 {
            let up = drain(&self.client);
            if !up.is_empty() {
                self.server.receive(&up);
            }
            let down = drain(&self.server);
            if !down.is_empty() {
                self.client.receive(&down);
            }
            if up.is_empty() && down.is_empty() {
                break;
            }
        }
    }

    fn establish(&self) {
        self.start();
        self.pump();
        assert!(self.client.is_established());
        assert!(self.server.is_established());
    }
}

#[test]
fn test_handshake_establishes_both_sides() {
    let p = pair();
    p.establish();

    assert!(p.beta_on_alpha.is_connected());
    assert!(p.alpha_on_beta.is_connected());
    assert_eq!(p.server.name(), "alpha");
    assert_eq!(p.alpha_on_beta.remote_version().as_deref(), Some(PLUGIN_VERSION));
    assert_eq!(p.beta_on_alpha.remote_version().as_deref(), Some(PLUGIN_VERSION));
    assert!(p.server.handshake_deadline().is_none());
}

#[test]
fn test_client_hello_carries_digest_of_dialler_then_acceptor() {
    let p = pair();
    p.start();
    let sent = messages(&drain(&p.client));
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].get_str(handshake::FIELD_KEY),
        Some(handshake::key_digest(ALPHA_KEY, BETA_KEY).as_str())
    );
    assert_eq!(p.client.state(), ConnectionState::Handshake);
}

#[test]
fn test_version_mismatch_closes_without_reply() {
    let p = pair();
    p.server.on_accepted();
    let hello = client_hello(ALPHA_KEY, BETA_KEY)
        .with(handshake::FIELD_PROTOCOL_VERSION, PROTOCOL_VERSION + 1);
    p.server.receive(&frame(&hello));

    assert!(p.server.is_closed());
    assert!(drain(&p.server).is_empty());
    assert!(!p.alpha_on_beta.is_connected());
}

#[test]
fn test_missing_version_closes() {
    let p = pair();
    p.server.on_accepted();
    let mut hello = client_hello(ALPHA_KEY, BETA_KEY);
    hello.remove(handshake::FIELD_PROTOCOL_VERSION);
    p.server.receive(&frame(&hello));
    assert!(p.server.is_closed());
}

#[test]
fn test_unknown_key_is_rejected_with_reason() {
    let p = pair();
    p.server.on_accepted();
    p.server.receive(&frame(&client_hello("stranger-net", BETA_KEY)));

    assert!(p.server.is_closed());
    let replies = messages(&drain(&p.server));
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].get_str(handshake::FIELD_ERROR),
        Some(constants::ERR_UNKNOWN_KEY)
    );
}

#[test]
fn test_reversed_digest_is_unknown() {
    let p = pair();
    p.server.on_accepted();
    // Same two keys hashed acceptor-first must not authenticate
    let mut hello = client_hello(ALPHA_KEY, BETA_KEY);
    hello.insert(handshake::FIELD_KEY, handshake::key_digest(BETA_KEY, ALPHA_KEY));
    p.server.receive(&frame(&hello));
    assert!(p.server.is_closed());
    assert!(!p.alpha_on_beta.is_connected());
}

#[test]
fn test_disabled_peer_is_rejected() {
    let p = pair();
    p.alpha_on_beta.set_enabled(false);
    p.start();
    p.pump();

    assert!(p.server.is_closed());
    assert!(p.client.is_closed());
    assert!(!p.beta_on_alpha.is_connected());
}

#[test]
fn test_disabled_peer_reply_reason() {
    let p = pair();
    p.alpha_on_beta.set_enabled(false);
    p.server.on_accepted();
    p.server.receive(&frame(&client_hello(ALPHA_KEY, BETA_KEY)));
    let replies = messages(&drain(&p.server));
    assert_eq!(
        replies[0].get_str(handshake::FIELD_ERROR),
        Some(constants::ERR_PEER_DISABLED)
    );
}

#[test]
fn test_second_link_for_connected_peer_is_dropped() {
    let p = pair();
    p.establish();

    let beta_ctx = Arc::new(LinkContext::new(
        BETA_KEY,
        Arc::new(StaticRegistry::new(vec![p.alpha_on_beta.clone() as Arc<dyn Peer>])),
    ));
    let duplicate = Connection::incoming(beta_ctx, addr(3));
    duplicate.on_accepted();
    duplicate.receive(&frame(&client_hello(ALPHA_KEY, BETA_KEY)));

    assert!(duplicate.is_closed());
    assert!(drain(&duplicate).is_empty());
    assert!(p.server.is_established());
    assert!(p.alpha_on_beta.is_connected());
}

#[test]
fn test_inbound_replaces_stale_outgoing_attempt() {
    let p = pair();
    // beta is itself mid-dial towards alpha
    let beta_ctx = Arc::new(LinkContext::new(
        BETA_KEY,
        Arc::new(StaticRegistry::new(Vec::new())),
    ));
    let stale = Connection::outgoing(beta_ctx, p.alpha_on_beta.clone(), addr(1));
    // Registered as current but never handshaken, so the peer reads as connecting
    p.alpha_on_beta.on_connected(stale.clone(), PLUGIN_VERSION);
    assert!(!stale.is_established());
    assert!(p.alpha_on_beta.is_connecting());

    p.establish();
    assert!(stale.is_closed());
    assert!(p.alpha_on_beta.is_connected());
    assert_eq!(
        p.alpha_on_beta.connection().map(|c| c.id()),
        Some(p.server.id())
    );
}

#[test]
fn test_remote_rejection_closes_client() {
    let p = pair();
    p.client.on_transport_connected().unwrap();
    drain(&p.client);
    p.client
        .receive(&frame(&handshake::rejection(constants::ERR_UNKNOWN_KEY)));
    assert!(p.client.is_closed());
    assert!(!p.beta_on_alpha.is_connected());
}

#[test]
fn test_application_message_during_handshake_closes() {
    let p = pair();
    p.server.on_accepted();
    p.server
        .receive(&frame(&Message::new().with("type", "teleport")));
    assert!(p.server.is_closed());
}

#[test]
fn test_request_response_roundtrip() {
    let dispatcher = Dispatcher::new();
    dispatcher.register("ping", |_, msg| {
        Ok(Some(
            Message::new().with("pong", msg.get_i64("n").unwrap_or_default() + 1),
        ))
    });
    let p = pair_with(dispatcher);
    p.establish();

    let pending = p
        .client
        .send_request(Message::new().with("type", "ping").with("n", 41i64), false)
        .unwrap();
    assert_eq!(p.client.pending_requests(), 1);
    p.pump();

    let reply = pending.get_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(reply.get_i64("pong"), Some(42));
    assert_eq!(reply.get_i64(RESPONSE_ID), Some(pending.id()));
    assert_eq!(p.client.pending_requests(), 0);
}

#[test]
fn test_encrypted_request_is_answered() {
    let seen_secret = Arc::new(AtomicUsize::new(0));
    let counter = seen_secret.clone();
    let dispatcher = Dispatcher::new();
    dispatcher.register("whisper", move |_, msg| {
        if msg.get_str("secret") == Some("coords") {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Some(Message::new().with("ok", true)))
    });
    let p = pair_with(dispatcher);
    p.establish();

    let pending = p
        .client
        .send_request(
            Message::new().with("type", "whisper").with("secret", "coords"),
            true,
        )
        .unwrap();

    let wire = drain(&p.client);
    assert_eq!(wire[0] & FLAG_ENCRYPTED, FLAG_ENCRYPTED);
    assert!(!wire.windows(6).any(|w| w == b"coords"));
    p.server.receive(&wire);
    p.pump();

    assert_eq!(seen_secret.load(Ordering::SeqCst), 1);
    assert_eq!(pending.get().unwrap().get_bool("ok"), Some(true));
}

#[test]
fn test_unknown_response_id_is_dropped() {
    let p = pair();
    p.establish();

    p.client
        .receive(&frame(&Message::new().with(RESPONSE_ID, 999i64)));
    assert!(p.client.is_established());
    assert_eq!(p.client.pending_requests(), 0);
}

#[test]
fn test_unanswered_request_times_out() {
    let p = pair();
    p.establish();

    let pending = p
        .client
        .send_request(Message::new().with("type", "unrouted"), false)
        .unwrap();
    p.pump();
    assert!(matches!(
        pending.get_timeout(Duration::from_millis(30)),
        Err(ProtocolError::RequestTimedOut)
    ));
}

#[test]
fn test_arbitrary_read_splits_yield_same_messages() {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let dispatcher = Dispatcher::new();
    dispatcher.register("tick", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    });
    let p = pair_with(dispatcher);
    p.establish();

    for i in 0..5i64 {
        p.client
            .send_message(&Message::new().with("type", "tick").with("i", i), false)
            .unwrap();
    }
    let wire = drain(&p.client);
    for byte in wire.chunks(1) {
        p.server.receive(byte);
    }
    assert_eq!(received.load(Ordering::SeqCst), 5);
    assert!(p.server.is_established());
}

/// Counts lifecycle callbacks
#[derive(Default)]
struct RecordingPeer {
    disconnects: AtomicUsize,
    connection: parking_lot::Mutex<Option<Arc<Connection>>>,
}

impl Peer for RecordingPeer {
    fn name(&self) -> &str {
        "recorder"
    }
    fn key(&self) -> &str {
        ALPHA_KEY
    }
    fn address(&self) -> SocketAddr {
        addr(9)
    }
    fn is_enabled(&self) -> bool {
        true
    }
    fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }
    fn is_connecting(&self) -> bool {
        false
    }
    fn on_connected(&self, connection: Arc<Connection>, _remote_version: &str) {
        *self.connection.lock() = Some(connection);
    }
    fn on_disconnected(&self, _connection: &Connection) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connection.lock().take();
    }
    fn on_message(&self, _connection: &Arc<Connection>, _message: Message) {}
    fn send_keep_alive(&self) {}
    fn check_keep_alive_timeout(&self) {}
    fn disconnect(&self) {}
}

#[test]
fn test_close_is_idempotent_and_notifies_once() {
    let recorder = Arc::new(RecordingPeer::default());
    let peers: Vec<Arc<dyn Peer>> = vec![recorder.clone()];
    let ctx = Arc::new(LinkContext::new(
        BETA_KEY,
        Arc::new(StaticRegistry::new(peers)),
    ));
    let server = Connection::incoming(ctx, addr(1));
    server.on_accepted();
    server.receive(&frame(&client_hello(ALPHA_KEY, BETA_KEY)));
    assert!(server.is_established());
    assert!(recorder.is_connected());

    let pending = server.send_request(Message::new(), false).unwrap();
    server.close();
    server.close();
    server.teardown();

    assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
    assert!(!recorder.is_connected());
    assert!(matches!(
        pending.try_get(),
        Some(Err(ProtocolError::RequestCancelled))
    ));
    assert!(server.is_closed());
}

#[test]
fn test_handshake_timeout_closes_waiting_connection() {
    let p = pair();
    p.server.on_accepted();
    p.server.on_handshake_timeout();
    assert!(p.server.is_closed());

    // No effect once established
    let q = pair();
    q.establish();
    q.server.on_handshake_timeout();
    assert!(q.server.is_established());
}
