//! Single-assignment result for an outstanding request.
//!
//! A [`RequestResult`] is handed to the caller of
//! [`Connection::send_request`](crate::protocol::connection::Connection::send_request)
//! immediately and completed later on the reactor thread when the matching
//! response frame arrives. Callers block on it from their own thread; the
//! reactor never waits on it.
//!
//! ```text
//! Waiting ──set_result──► Completed
//!    │
//!    ├──────cancel──────► Cancelled
//!    └──────timeout─────► TimedOut
//! ```
//!
//! Once resolved the state never changes again.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::message::Message;
use crate::error::{ProtocolError, Result};

/// Lifecycle of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Waiting,
    Completed,
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
struct Slot {
    state: RequestState,
    value: Option<Message>,
}

#[derive(Debug)]
struct Inner {
    id: i64,
    created: Instant,
    slot: Mutex<Slot>,
    changed: Condvar,
}

/// Shared handle to a pending request; clones observe the same state
#[derive(Debug, Clone)]
pub struct RequestResult {
    inner: Arc<Inner>,
}

impl RequestResult {
    pub fn new(id: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                created: Instant::now(),
                slot: Mutex::new(Slot {
                    state: RequestState::Waiting,
                    value: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Request id this result is registered under
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    pub fn state(&self) -> RequestState {
        self.inner.slot.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state() != RequestState::Waiting
    }

    /// Time since the request was registered
    pub fn age(&self) -> Duration {
        self.inner.created.elapsed()
    }

    /// Complete with a response. Returns `false` if already resolved.
    pub fn set_result(&self, message: Message) -> bool {
        self.resolve(RequestState::Completed, Some(message))
    }

    /// Cancel locally; the remote peer is not informed. Returns `false` if already resolved.
    pub fn cancel(&self) -> bool {
        self.resolve(RequestState::Cancelled, None)
    }

    /// Mark as timed out. Returns `false` if already resolved.
    pub fn time_out(&self) -> bool {
        self.resolve(RequestState::TimedOut, None)
    }

    fn resolve(&self, state: RequestState, value: Option<Message>) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.state != RequestState::Waiting {
            return false;
        }
        slot.state = state;
        slot.value = value;
        drop(slot);
        self.inner.changed.notify_all();
        true
    }

    /// Block until resolved, without bound
    pub fn get(&self) -> Result<Message> {
        let mut slot = self.inner.slot.lock();
        while slot.state == RequestState::Waiting {
            self.inner.changed.wait(&mut slot);
        }
        outcome(&slot)
    }

    /// Block until resolved or `timeout` elapses, after which the request is timed out.
    ///
    /// A zero timeout waits without bound, like [`get`](Self::get).
    pub fn get_timeout(&self, timeout: Duration) -> Result<Message> {
        if timeout.is_zero() {
            return self.get();
        }

        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        while slot.state == RequestState::Waiting {
            if self
                .inner
                .changed
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                if slot.state == RequestState::Waiting {
                    slot.state = RequestState::TimedOut;
                    drop(slot);
                    self.inner.changed.notify_all();
                    return Err(ProtocolError::RequestTimedOut);
                }
                break;
            }
        }
        outcome(&slot)
    }

    /// Non-blocking check; `None` while still waiting
    pub fn try_get(&self) -> Option<Result<Message>> {
        let slot = self.inner.slot.lock();
        match slot.state {
            RequestState::Waiting => None,
            _ => Some(outcome(&slot)),
        }
    }
}

fn outcome(slot: &Slot) -> Result<Message> {
    match slot.state {
        RequestState::Completed => slot
            .value
            .clone()
            .ok_or_else(|| ProtocolError::Custom("completed request without a value".into())),
        RequestState::Cancelled => Err(ProtocolError::RequestCancelled),
        RequestState::TimedOut | RequestState::Waiting => Err(ProtocolError::RequestTimedOut),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_completed_value_is_returned() {
        let result = RequestResult::new(1);
        assert!(result.set_result(Message::new().with("ok", true)));
        assert_eq!(result.state(), RequestState::Completed);
        let reply = result.get_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(reply.get_bool("ok"), Some(true));
    }

    #[test]
    fn test_resolution_is_single_assignment() {
        let result = RequestResult::new(1);
        assert!(result.set_result(Message::new().with("n", 1i64)));
        assert!(!result.set_result(Message::new().with("n", 2i64)));
        assert!(!result.cancel());
        assert!(!result.time_out());
        assert_eq!(result.get().unwrap().get_i64("n"), Some(1));
    }

    #[test]
    fn test_cancel_fails_waiters_immediately() {
        let result = RequestResult::new(3);
        assert!(result.cancel());
        assert!(matches!(
            result.get_timeout(Duration::from_secs(5)),
            Err(ProtocolError::RequestCancelled)
        ));
    }

    #[test]
    fn test_wait_elapses_into_timeout() {
        let result = RequestResult::new(4);
        let started = Instant::now();
        assert!(matches!(
            result.get_timeout(Duration::from_millis(50)),
            Err(ProtocolError::RequestTimedOut)
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(result.state(), RequestState::TimedOut);
        // A late response no longer lands
        assert!(!result.set_result(Message::new()));
    }

    #[test]
    fn test_completion_from_another_thread_wakes_waiter() {
        let result = RequestResult::new(5);
        let completer = result.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.set_result(Message::new().with("from", "reactor"));
        });
        let reply = result.get_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply.get_str("from"), Some("reactor"));
        handle.join().unwrap();
    }

    #[test]
    fn test_try_get_does_not_block_or_resolve() {
        let result = RequestResult::new(6);
        assert!(result.try_get().is_none());
        assert_eq!(result.state(), RequestState::Waiting);
        result.cancel();
        assert!(matches!(
            result.try_get(),
            Some(Err(ProtocolError::RequestCancelled))
        ));
    }
}
