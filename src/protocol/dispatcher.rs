use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::Connection;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Field naming the handler a message is routed to
pub const TYPE_FIELD: &str = "type";

type HandlerFn =
    dyn Fn(&Arc<Connection>, &Message) -> Result<Option<Message>> + Send + Sync + 'static;

/// Routes inbound messages to handlers by their `type` field.
///
/// A handler returning `Some(reply)` for a request message has the reply sent
/// back with the request's id copied into `responseId`.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<String, Arc<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `handler` for messages whose type is `kind`, replacing any previous one
    pub fn register<F>(&self, kind: &str, handler: F)
    where
        F: Fn(&Arc<Connection>, &Message) -> Result<Option<Message>> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(kind.to_owned(), Arc::new(handler));
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.handlers.write().remove(kind).is_some()
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    /// Run the handler for `message`.
    ///
    /// Fails with [`ProtocolError::UnexpectedMessage`] when the message has no
    /// type or no handler is registered for it.
    pub fn dispatch(&self, conn: &Arc<Connection>, message: &Message) -> Result<Option<Message>> {
        let kind = message_type(message).ok_or(ProtocolError::UnexpectedMessage)?;

        // Handler runs outside the lock so it may register further handlers
        let handler = self
            .handlers
            .read()
            .get(kind)
            .cloned()
            .ok_or(ProtocolError::UnexpectedMessage)?;

        handler(conn, message)
    }
}

/// Routing key of a message
#[inline]
pub fn message_type(message: &Message) -> Option<&str> {
    message.get_str(TYPE_FIELD)
}
