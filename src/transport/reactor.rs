//! # Reactor
//!
//! Owns every socket and performs all network I/O on one dedicated thread.
//!
//! The thread runs a current-thread tokio runtime. The event loop multiplexes
//! the listener, a control channel fed by other threads, exit events from the
//! per-connection tasks and a periodic tick. Connection tasks are spawned on the
//! same runtime, so no socket is ever touched from two threads.
//!
//! ## Control plane
//! Other threads never touch sockets. They mutate lock-guarded connection state
//! and post a [`Command`] through a [`ReactorHandle`]:
//! - `Open`: dial an outgoing connection
//! - `Close`: graceful close, queued output is flushed first
//! - `Write`: output was queued, arm write readiness
//! - `Stop`: stop accepting, close everything, exit once all connections are gone
//!
//! ## Tick
//! Once per tick interval connected peers get their keep-alive hooks and stale
//! pending requests are swept.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Level};

use crate::config::NetworkConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::peer::{Peer, PeerRegistry};
use crate::protocol::connection::{Connection, ConnectionId, LinkContext};
use crate::transport::ban_list::BanList;
use crate::utils::crypto::FrameCipher;
use crate::utils::metrics::global_metrics;

const THREAD_NAME: &str = "peerlink-reactor";

#[derive(Debug)]
enum Command {
    Open(Arc<Connection>),
    Close(ConnectionId),
    Write(ConnectionId),
    Stop,
}

/// Reactor to connection task
#[derive(Debug, Clone, Copy)]
enum Signal {
    Wake,
    Close,
}

/// Connection task to reactor
#[derive(Debug)]
enum IoEvent {
    Exited(ConnectionId),
}

/// Cloneable, thread-safe sender of reactor commands
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    commands: UnboundedSender<Command>,
}

impl ReactorHandle {
    /// Ask the reactor to dial `connection`. Repeated calls for the same instance are ignored.
    pub fn request_open(&self, connection: &Arc<Connection>) {
        connection.attach(self.clone());
        if self.commands.send(Command::Open(connection.clone())).is_err() {
            debug!(connection = %connection, "Reactor gone, dropping open request");
            connection.close();
        }
    }

    /// Ask for a graceful close. Returns `false` if the reactor is no longer running.
    pub fn request_close(&self, connection: &Connection) -> bool {
        self.commands.send(Command::Close(connection.id())).is_ok()
    }

    /// Wake the connection's task so queued output gets written
    pub fn request_write(&self, connection: &Connection) {
        let _ = self.commands.send(Command::Write(connection.id()));
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

/// Running reactor. Stopped on [`stop`](Reactor::stop) or drop.
pub struct Reactor {
    handle: ReactorHandle,
    context: Arc<LinkContext>,
    ban_list: Arc<BanList>,
    local_addr: SocketAddr,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Bind the listener and start the reactor thread
    pub fn start(config: &NetworkConfig, registry: Arc<dyn PeerRegistry>) -> Result<Self> {
        Self::start_with_context(config, LinkContext::from_config(config, registry))
    }

    /// Like [`start`](Self::start) with a custom frame cipher
    pub fn start_with_cipher(
        config: &NetworkConfig,
        registry: Arc<dyn PeerRegistry>,
        cipher: Arc<dyn FrameCipher>,
    ) -> Result<Self> {
        Self::start_with_context(
            config,
            LinkContext::from_config(config, registry).with_cipher(cipher),
        )
    }

    pub fn start_with_context(config: &NetworkConfig, context: LinkContext) -> Result<Self> {
        let server = &config.server;
        if server.listen_address.is_empty() {
            return Err(ProtocolError::ConfigError(
                constants::ERR_MISSING_LISTEN_ADDRESS.into(),
            ));
        }
        let addr: SocketAddr = server.listen_address.parse().map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Invalid listen address '{}': {e}",
                server.listen_address
            ))
        })?;
        if context.network_key().is_empty() {
            return Err(ProtocolError::ConfigError(
                constants::ERR_MISSING_NETWORK_KEY.into(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        let context = Arc::new(context);
        let ban_list = Arc::new(BanList::new(&server.ban_patterns));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = ReactorHandle {
            commands: commands_tx,
        };

        let event_loop = EventLoop::new(
            context.clone(),
            handle.clone(),
            listener,
            ban_list.clone(),
            commands_rx,
            config,
        );

        let thread = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || runtime.block_on(event_loop.run()))
            .map_err(|e| ProtocolError::Custom(format!("{}: {e}", constants::ERR_REACTOR_SPAWN)))?;

        info!(address = %local_addr, "Reactor listening");
        Ok(Self {
            handle,
            context,
            ban_list,
            local_addr,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &Arc<LinkContext> {
        &self.context
    }

    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.ban_list
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Create an outgoing connection to `peer` and ask the reactor to dial it
    pub fn connect(&self, peer: Arc<dyn Peer>) -> Arc<Connection> {
        let address = peer.address();
        let connection = Connection::outgoing(self.context.clone(), peer, address);
        self.request_open(&connection);
        connection
    }

    pub fn request_open(&self, connection: &Arc<Connection>) {
        self.handle.request_open(connection);
    }

    pub fn request_close(&self, connection: &Connection) -> bool {
        self.handle.request_close(connection)
    }

    pub fn request_write(&self, connection: &Connection) {
        self.handle.request_write(connection);
    }

    /// Stop the reactor and block until its thread exits.
    ///
    /// Live connections flush their queued output before being torn down.
    /// Idempotent. Called from the reactor thread itself it only signals the stop.
    pub fn stop(&self) {
        self.handle.stop();

        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("Reactor thread panicked");
        }
        info!(address = %self.local_addr, "Reactor stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Entry {
    connection: Arc<Connection>,
    signals: UnboundedSender<Signal>,
}

struct EventLoop {
    context: Arc<LinkContext>,
    handle: ReactorHandle,
    listener: Option<TcpListener>,
    ban_list: Arc<BanList>,
    commands: UnboundedReceiver<Command>,
    events_tx: UnboundedSender<IoEvent>,
    events_rx: UnboundedReceiver<IoEvent>,
    entries: HashMap<ConnectionId, Entry>,
    tick_interval: Duration,
    request_ttl: Duration,
    read_buffer_size: usize,
    stopping: bool,
}

impl EventLoop {
    fn new(
        context: Arc<LinkContext>,
        handle: ReactorHandle,
        listener: TcpListener,
        ban_list: Arc<BanList>,
        commands: UnboundedReceiver<Command>,
        config: &NetworkConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            context,
            handle,
            listener: Some(listener),
            ban_list,
            commands,
            events_tx,
            events_rx,
            entries: HashMap::new(),
            tick_interval: config.server.tick_interval.max(Duration::from_millis(1)),
            request_ttl: config.server.request_ttl,
            read_buffer_size: config.transport.read_buffer_size.max(1),
            stopping: false,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.stopping && self.entries.is_empty() {
                break;
            }

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => self.begin_stop(),
                },
                Some(event) = self.events_rx.recv() => self.on_event(event),
                accepted = accept(self.listener.as_ref()) => self.on_accept(accepted),
                _ = tick.tick() => self.on_tick(),
            }
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Open(connection) = command {
                connection.abort();
                connection.teardown();
            }
        }
        debug!("Reactor event loop exited");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open(connection) => self.open(connection),
            Command::Close(id) => self.signal(id, Signal::Close),
            Command::Write(id) => self.signal(id, Signal::Wake),
            Command::Stop => self.begin_stop(),
        }
    }

    fn signal(&self, id: ConnectionId, signal: Signal) {
        if let Some(entry) = self.entries.get(&id) {
            let _ = entry.signals.send(signal);
        }
    }

    fn open(&mut self, connection: Arc<Connection>) {
        if self.entries.contains_key(&connection.id()) {
            return;
        }
        if self.stopping || connection.is_closed() {
            connection.abort();
            connection.teardown();
            return;
        }
        debug!(connection = %connection, "Dialling");
        self.register(connection, None);
    }

    fn on_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Accept failed");
                return;
            }
        };

        if self.ban_list.is_banned(&addr.ip()) {
            global_metrics().connection_banned();
            info!(remote = %addr, "Rejected banned address");
            return;
        }

        let _ = stream.set_nodelay(true);
        let connection = Connection::incoming(self.context.clone(), addr);
        connection.attach(self.handle.clone());
        connection.on_accepted();
        self.register(connection, Some(stream));
    }

    /// Track `connection` and spawn its task; without a stream the task dials first
    fn register(&mut self, connection: Arc<Connection>, stream: Option<TcpStream>) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let id = connection.id();
        self.entries.insert(
            id,
            Entry {
                connection: connection.clone(),
                signals: signals_tx,
            },
        );
        global_metrics().connection_opened();

        let events = self.events_tx.clone();
        let read_buffer_size = self.read_buffer_size;
        tokio::spawn(async move {
            match stream {
                Some(stream) => serve(&connection, stream, signals_rx, read_buffer_size).await,
                None => dial(&connection, signals_rx, read_buffer_size).await,
            }
            let _ = events.send(IoEvent::Exited(id));
        });
    }

    fn on_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Exited(id) => {
                if let Some(entry) = self.entries.remove(&id) {
                    entry.connection.teardown();
                    global_metrics().connection_closed();
                }
            }
        }
    }

    fn on_tick(&mut self) {
        if self.stopping {
            return;
        }

        for peer in self.context.registry().peers() {
            if peer.is_connected() {
                peer.send_keep_alive();
                peer.check_keep_alive_timeout();
            }
        }

        for entry in self.entries.values() {
            entry.connection.expire_requests(self.request_ttl);
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.listener = None;
        info!(connections = self.entries.len(), "Reactor stopping");

        for entry in self.entries.values() {
            entry.connection.close();
            let _ = entry.signals.send(Signal::Close);
        }
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn until_closed(signals: &mut UnboundedReceiver<Signal>) {
    while let Some(Signal::Wake) = signals.recv().await {}
}

async fn handshake_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Dial an outgoing connection, then serve it
async fn dial(
    connection: &Arc<Connection>,
    mut signals: UnboundedReceiver<Signal>,
    read_buffer_size: usize,
) {
    let connected = tokio::select! {
        connected = TcpStream::connect(connection.remote_addr()) => connected,
        _ = until_closed(&mut signals) => {
            debug!(connection = %connection, "Dial abandoned");
            connection.abort();
            return;
        }
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            global_metrics().connection_error();
            log_transport_failure(connection, "Connect failed", &e);
            connection.abort();
            return;
        }
    };

    if connection.is_closed() {
        return;
    }
    let _ = stream.set_nodelay(true);
    if let Err(e) = connection.on_transport_connected() {
        warn!(connection = %connection, error = %e, "Could not start handshake");
        connection.abort();
        return;
    }
    serve(connection, stream, signals, read_buffer_size).await;
}

/// Refused connects are routine while a peer is down; every other I/O failure is severe
fn failure_level(e: &io::Error) -> Level {
    if e.kind() == io::ErrorKind::ConnectionRefused {
        Level::WARN
    } else {
        Level::ERROR
    }
}

fn log_transport_failure(connection: &Connection, what: &str, e: &io::Error) {
    if failure_level(e) == Level::WARN {
        warn!(connection = %connection, error = %e, "{what}");
    } else {
        error!(connection = %connection, error = %e, "{what}");
    }
}

enum ReadOutcome {
    Open,
    Eof,
}

fn read_available(
    connection: &Arc<Connection>,
    stream: &TcpStream,
    buf: &mut [u8],
) -> io::Result<ReadOutcome> {
    loop {
        match stream.try_read(buf) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => {
                global_metrics().bytes_read(n as u64);
                connection.receive(&buf[..n]);
                if connection.is_closed() {
                    return Ok(ReadOutcome::Open);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
            Err(e) => return Err(e),
        }
    }
}

/// Pump one established socket until it closes
async fn serve(
    connection: &Arc<Connection>,
    mut stream: TcpStream,
    mut signals: UnboundedReceiver<Signal>,
    read_buffer_size: usize,
) {
    let mut buf = vec![0u8; read_buffer_size];
    let mut closing = false;

    loop {
        if connection.is_closed() {
            closing = true;
        }
        let pending = connection.has_pending_output();
        if closing && !pending {
            break;
        }

        let interest = match (closing, pending) {
            (true, _) => Interest::WRITABLE,
            (false, true) => Interest::READABLE | Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        };
        let deadline = connection.handshake_deadline();

        tokio::select! {
            ready = stream.ready(interest) => {
                let ready = match ready {
                    Ok(ready) => ready,
                    Err(e) => {
                        log_transport_failure(connection, "Socket error", &e);
                        connection.abort();
                        return;
                    }
                };

                if ready.is_readable() && !closing {
                    match read_available(connection, &stream, &mut buf) {
                        Ok(ReadOutcome::Open) => {}
                        Ok(ReadOutcome::Eof) => {
                            debug!(connection = %connection, "Remote closed the connection");
                            connection.abort();
                            return;
                        }
                        Err(e) => {
                            log_transport_failure(connection, "Read failed", &e);
                            global_metrics().connection_error();
                            connection.abort();
                            return;
                        }
                    }
                }

                if ready.is_writable() {
                    if let Err(e) = connection.write_pending(|chunk| stream.try_write(chunk)) {
                        log_transport_failure(connection, "Write failed", &e);
                        global_metrics().connection_error();
                        connection.abort();
                        return;
                    }
                }
            }
            signal = signals.recv() => match signal {
                Some(Signal::Wake) => {}
                Some(Signal::Close) | None => closing = true,
            },
            _ = handshake_expiry(deadline), if !closing => connection.on_handshake_timeout(),
        }
    }

    if let Err(e) = stream.shutdown().await {
        debug!(connection = %connection, error = %e, "Shutdown after close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_refused_connects_are_warnings() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(failure_level(&refused), Level::WARN);

        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut,
            io::ErrorKind::Other,
        ] {
            assert_eq!(failure_level(&io::Error::from(kind)), Level::ERROR, "{kind:?}");
        }
    }
}
