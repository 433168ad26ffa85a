//! Token-keyed handler tables
//!
//! Registry-wide notifications (connection state, subscription errors,
//! resync) fan out to any number of handlers. Each registration returns a
//! [`HandlerToken`] that removes it again. Dispatch copies the table and
//! invokes the copies after the table lock is released, so a handler may
//! add or remove handlers while it runs.

use crate::connection::ConnectionState;
use crate::error::SubscriptionErrorKind;
use crate::subscription::Subscription;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies one registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerToken(u64);

impl HandlerToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Payload of the subscription-error notification
#[derive(Debug, Clone)]
pub struct SubscriptionErrorEvent {
    /// The rejected subscription, already closed
    pub subscription: Arc<Subscription>,
    pub error: SubscriptionErrorKind,
    /// Provider message, or the raw frame when the provider sent none
    pub message: String,
}

pub type ConnectionStateHandler = dyn Fn(ConnectionState) + Send + Sync;
pub type SubscriptionErrorHandler = dyn Fn(&SubscriptionErrorEvent) + Send + Sync;
pub type ResyncHandler = dyn Fn() + Send + Sync;

/// Handlers in registration order
pub struct HandlerTable<F: ?Sized> {
    next_token: AtomicU64,
    handlers: Mutex<BTreeMap<u64, Arc<F>>>,
}

impl<F: ?Sized> HandlerTable<F> {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            handlers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a handler
    pub fn add(&self, handler: Arc<F>) -> HandlerToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(token, handler);
        HandlerToken(token)
    }

    /// Unregister a handler; returns `false` for an unknown token
    pub fn remove(&self, token: HandlerToken) -> bool {
        self.handlers.lock().remove(&token.0).is_some()
    }

    /// Copy of the current handlers, in registration order
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.handlers.lock().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}

impl<F: ?Sized> Default for HandlerTable<F> {
    fn default() -> Self {
        Self::new()
    }
}
