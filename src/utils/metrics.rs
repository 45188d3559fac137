//! Observability and Metrics
//!
//! Counters for connection lifecycle, handshakes, frame traffic and request
//! resolution. Uses atomic counters for thread-safe collection from the reactor
//! thread and caller threads alike.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for protocol operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections opened (accepted or dialled)
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Inbound connections dropped by the ban list
    pub connections_banned: AtomicU64,
    /// Handshakes reaching the established state
    pub handshakes_success: AtomicU64,
    /// Handshakes rejected or timed out
    pub handshakes_failed: AtomicU64,
    /// Frames queued for sending
    pub frames_sent: AtomicU64,
    /// Frames decoded from the wire
    pub frames_received: AtomicU64,
    /// Bytes written to sockets
    pub bytes_sent: AtomicU64,
    /// Bytes read from sockets
    pub bytes_received: AtomicU64,
    /// Frames sent encrypted
    pub frames_encrypted: AtomicU64,
    /// Requests resolved by a response
    pub requests_completed: AtomicU64,
    /// Requests that timed out or were cancelled
    pub requests_abandoned: AtomicU64,
    /// Responses whose id matched no pending request
    pub responses_unmatched: AtomicU64,
    /// Connection-level transport errors
    pub connection_errors: AtomicU64,
    /// Protocol violations
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_banned: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_encrypted: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_abandoned: AtomicU64::new(0),
            responses_unmatched: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: teardown of a connection that never opened a socket must not wrap
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn connection_banned(&self) {
        self.connections_banned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, encrypted: bool) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        if encrypted {
            self.frames_encrypted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_abandoned(&self) {
        self.requests_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_unmatched(&self) {
        self.responses_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_banned: self.connections_banned.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_encrypted: self.frames_encrypted.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_abandoned: self.requests_abandoned.load(Ordering::Relaxed),
            responses_unmatched: self.responses_unmatched.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            connections_banned = s.connections_banned,
            handshakes_success = s.handshakes_success,
            handshakes_failed = s.handshakes_failed,
            frames_sent = s.frames_sent,
            frames_received = s.frames_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            frames_encrypted = s.frames_encrypted,
            requests_completed = s.requests_completed,
            requests_abandoned = s.requests_abandoned,
            responses_unmatched = s.responses_unmatched,
            connection_errors = s.connection_errors,
            protocol_errors = s.protocol_errors,
            uptime_seconds = s.uptime_seconds,
            "Peer link metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_banned: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_encrypted: u64,
    pub requests_completed: u64,
    pub requests_abandoned: u64,
    pub responses_unmatched: u64,
    pub connection_errors: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
