//! # Message Dispatcher
//!
//! Fans one decoded inbound message out to every interested handler.
//!
//! ## Ordering contract:
//! 1. All type-agnostic handlers, in registration order
//! 2. Then, if the message has a non-empty type, every handler registered for exactly
//!    that type, in registration order
//!
//! ## Failure isolation:
//! A handler that returns an error or panics is logged and counted; the remaining
//! handlers still run and nothing is propagated to the socket reader.
//!
//! ## Registry semantics:
//! Duplicates are allowed. `off` removes by `Arc` identity and only the first match,
//! so a handler registered twice still fires once after a single `off`.

use crate::protocol::Message;
use crate::state::SessionMetrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// A message handler. Handlers must not block: they run on the socket reader task.
pub type MessageHandler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// Observer for opaque binary frames.
pub type BinaryHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Wrap a closure as a `MessageHandler`. Keep the returned value to `off` it later.
pub fn handler<F>(f: F) -> MessageHandler
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Default)]
struct HandlerRegistry {
    typed: HashMap<String, Vec<MessageHandler>>,
    any: Vec<MessageHandler>,
}

/// Result of one `dispatch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub invoked: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct Dispatcher {
    registry: RwLock<HandlerRegistry>,
    binary: RwLock<Option<BinaryHandler>>,
    metrics: Option<SessionMetrics>,
}

impl Dispatcher {
    pub fn new(metrics: SessionMetrics) -> Self {
        Self {
            registry: RwLock::new(HandlerRegistry::default()),
            binary: RwLock::new(None),
            metrics: Some(metrics),
        }
    }

    /// Register a handler for one exact message type.
    pub fn on(&self, kind: impl Into<String>, handler: MessageHandler) {
        self.registry
            .write()
            .typed
            .entry(kind.into())
            .or_default()
            .push(handler);
    }

    /// Remove the first registration of `handler` for `kind`. Returns whether one was found.
    pub fn off(&self, kind: &str, handler: &MessageHandler) -> bool {
        let mut registry = self.registry.write();
        let Some(handlers) = registry.typed.get_mut(kind) else {
            return false;
        };
        let removed = remove_first(handlers, handler);
        if handlers.is_empty() {
            registry.typed.remove(kind);
        }
        removed
    }

    /// Register a handler that sees every message, typed or not.
    pub fn on_any(&self, handler: MessageHandler) {
        self.registry.write().any.push(handler);
    }

    pub fn off_any(&self, handler: &MessageHandler) -> bool {
        remove_first(&mut self.registry.write().any, handler)
    }

    /// Install (or clear) the single raw binary observer.
    pub fn set_binary_observer(&self, observer: Option<BinaryHandler>) {
        *self.binary.write() = observer;
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        self.registry.read().typed.get(kind).map_or(0, Vec::len)
    }

    pub fn any_handler_count(&self) -> usize {
        self.registry.read().any.len()
    }

    /// Deliver `message` to every matching handler.
    ///
    /// The handler lists are snapshotted first, so a handler may register or remove
    /// handlers (including itself) without deadlocking; changes apply to the next dispatch.
    pub fn dispatch(&self, message: &Message) -> DispatchOutcome {
        let (any, typed) = {
            let registry = self.registry.read();
            let typed = if message.has_type() {
                registry.typed.get(message.kind()).cloned().unwrap_or_default()
            } else {
                Vec::new()
            };
            (registry.any.clone(), typed)
        };

        let mut outcome = DispatchOutcome::default();
        for handler in any.iter().chain(typed.iter()) {
            outcome.invoked += 1;
            if !self.invoke(handler, message) {
                outcome.failed += 1;
            }
        }
        outcome
    }

    /// Hand a binary frame to the raw observer. Returns false when none is installed.
    pub fn dispatch_binary(&self, bytes: &[u8]) -> bool {
        let observer = self.binary.read().clone();
        match observer {
            Some(observer) => {
                if catch_unwind(AssertUnwindSafe(|| observer(bytes))).is_err() {
                    error!(len = bytes.len(), "Binary observer panicked");
                    self.record_failure();
                }
                true
            }
            None => {
                warn!(len = bytes.len(), "Binary frame received with no observer installed");
                false
            }
        }
    }

    fn invoke(&self, handler: &MessageHandler, message: &Message) -> bool {
        match catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                error!(message_type = %message.kind(), error = %err, "Message handler failed");
                self.record_failure();
                false
            }
            Err(_) => {
                error!(message_type = %message.kind(), "Message handler panicked");
                self.record_failure();
                false
            }
        }
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_handler_failure();
        }
    }
}

fn remove_first(handlers: &mut Vec<MessageHandler>, target: &MessageHandler) -> bool {
    match handlers.iter().position(|h| Arc::ptr_eq(h, target)) {
        Some(index) => {
            handlers.remove(index);
            true
        }
        None => false,
    }
}

/// Ordered list of notification callbacks, used for error/close/transcript/presence
/// subscriptions. Panics in one observer do not stop the others.
pub struct ObserverList<T: ?Sized> {
    observers: RwLock<Vec<Arc<dyn Fn(&T) + Send + Sync>>>,
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> ObserverList<T> {
    pub fn add<F>(&self, observer: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, value: &T) {
        let observers = self.observers.read().clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(value))).is_err() {
                error!("Observer panicked during notification");
            }
        }
    }
}
