//! Subscription registry and protocol engine
//!
//! [`RealTimeActivityService`] turns subscription intents into wire frames
//! and inbound frames back into subscription lifecycle events. Every
//! subscription it holds sits in exactly one of four maps:
//!
//! - `pending_submission`: waiting for a connection
//! - `pending_subscribe`: subscribe sent, keyed by sequence number
//! - `active`: acknowledged, keyed by provider id
//! - `pending_unsubscribe`: unsubscribe sent, keyed by sequence number
//!
//! The maps live behind one re-entrant lock. User callbacks are collected
//! while the lock is held and run after it is released.

use crate::connection::{ConnectionState, ConnectionSupervisor};
use crate::error::{Result, RtaError, SubscriptionErrorKind};
use crate::handlers::{
    ConnectionStateHandler, HandlerTable, HandlerToken, ResyncHandler, SubscriptionErrorEvent,
    SubscriptionErrorHandler,
};
use crate::protocol::{self, InboundFrame, STATUS_SUCCESS};
use crate::subscription::{Subscription, SubscriptionInfo, SubscriptionState};
use crate::transport::Principal;
use parking_lot::ReentrantMutex;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

struct ServiceState {
    connection: Option<ConnectionSupervisor>,
    /// Connection state as last observed through the supervisor's handler
    state: ConnectionState,
    pending_submission: Vec<Arc<Subscription>>,
    pending_subscribe: BTreeMap<u32, Arc<Subscription>>,
    active: HashMap<u32, Arc<Subscription>>,
    pending_unsubscribe: BTreeMap<u32, Arc<Subscription>>,
}

impl ServiceState {
    fn len(&self) -> usize {
        self.pending_submission.len()
            + self.pending_subscribe.len()
            + self.active.len()
            + self.pending_unsubscribe.len()
    }

    fn send(&self, frame: String) {
        match &self.connection {
            Some(connection) => {
                debug!(frame = %frame, "Sending frame");
                if let Err(e) = connection.send(frame) {
                    // The request stays in its map and is replayed on reconnect
                    debug!(error = %e, "Frame not sent");
                }
            }
            None => debug!(frame = %frame, "No connection, frame dropped"),
        }
    }
}

/// A user callback to run once the registry lock is released
enum Deferred {
    SubscriptionState(Arc<Subscription>, SubscriptionState),
    Created(Arc<Subscription>, u32, Value),
    Event(Arc<Subscription>, Value),
    Error(SubscriptionErrorEvent),
    Resync,
    ConnectionState(ConnectionState),
}

struct ServiceInner {
    principal: Principal,
    state: ReentrantMutex<RefCell<ServiceState>>,
    connection_state_handlers: HandlerTable<ConnectionStateHandler>,
    subscription_error_handlers: HandlerTable<SubscriptionErrorHandler>,
    resync_handlers: HandlerTable<ResyncHandler>,
}

/// Per-principal subscription registry.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct RealTimeActivityService {
    inner: Arc<ServiceInner>,
}

impl RealTimeActivityService {
    /// Create a registry with no connection
    pub fn new(principal: Principal) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                principal,
                state: ReentrantMutex::new(RefCell::new(ServiceState {
                    connection: None,
                    state: ConnectionState::Disconnected,
                    pending_submission: Vec::new(),
                    pending_subscribe: BTreeMap::new(),
                    active: HashMap::new(),
                    pending_unsubscribe: BTreeMap::new(),
                })),
                connection_state_handlers: HandlerTable::new(),
                subscription_error_handlers: HandlerTable::new(),
                resync_handlers: HandlerTable::new(),
            }),
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.inner.principal
    }

    /// Attach `connection` and start connecting.
    ///
    /// Any previously attached connection is closed first.
    pub fn activate_connection(&self, connection: ConnectionSupervisor) {
        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        connection.set_state_changed_handler(Some(Arc::new(move |old, new| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_state_changed(old, new);
            }
        })));

        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        connection.set_received_handler(Some(Arc::new(move |text| {
            if let Some(inner) = weak.upgrade() {
                inner.on_frame(&text);
            }
        })));

        let previous = {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();
            state.connection.replace(connection.clone())
        };
        if let Some(previous) = previous {
            detach(&previous);
            previous.close();
        }

        info!(principal = %self.inner.principal, "Activating connection");
        connection.ensure_connected();
    }

    /// Ask the attached connection to connect if it is idle.
    ///
    /// Does nothing while connected or already retrying, or when no
    /// connection is attached.
    pub fn ensure_connected(&self) {
        let connection = {
            let guard = self.inner.state.lock();
            let state = guard.borrow();
            state.connection.clone()
        };
        if let Some(connection) = connection {
            connection.ensure_connected();
        }
    }

    /// Check whether a connection is attached
    pub fn is_activated(&self) -> bool {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.connection.is_some()
    }

    /// Connection state as seen by the registry
    pub fn connection_state(&self) -> ConnectionState {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.state
    }

    /// Number of subscriptions held across all four maps
    pub fn subscription_count(&self) -> usize {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.len()
    }

    /// Snapshot of every held subscription
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state
            .pending_submission
            .iter()
            .chain(state.pending_subscribe.values())
            .chain(state.active.values())
            .chain(state.pending_unsubscribe.values())
            .map(|sub| sub.info())
            .collect()
    }

    /// Register a subscription.
    ///
    /// The outcome arrives later through the subscription's handler or the
    /// subscription-error notification.
    pub fn add_subscription(&self, subscription: &Arc<Subscription>) -> Result<()> {
        match subscription.state() {
            SubscriptionState::Closed => {
                return Err(RtaError::InvalidArgument(
                    "subscription is closed and cannot be reused".to_string(),
                ))
            }
            state if state.is_live() => {
                return Err(RtaError::InvalidArgument(format!(
                    "subscription {} is already registered ({})",
                    subscription.guid(),
                    state
                )))
            }
            _ => {}
        }

        let mut deferred = Vec::new();
        {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();

            let connection_state = state.connection.as_ref().map(|c| c.state());
            let retrying = state.connection.as_ref().map_or(false, |c| c.is_connecting());
            let deactivated = matches!(connection_state, None | Some(ConnectionState::Disconnected));
            if deactivated && !retrying {
                return Err(RtaError::NotActivated);
            }

            debug!(
                principal = %self.inner.principal,
                guid = %subscription.guid(),
                uri = %subscription.resource_uri(),
                "Adding subscription"
            );

            if subscription.set_state(SubscriptionState::PendingSubscribe) {
                deferred.push(Deferred::SubscriptionState(
                    subscription.clone(),
                    SubscriptionState::PendingSubscribe,
                ));
            }
            state.pending_submission.push(subscription.clone());

            if connection_state == Some(ConnectionState::Connected) {
                flush_pending(&mut state);
            }
        }

        self.inner.dispatch(deferred);
        Ok(())
    }

    /// Unregister a subscription.
    ///
    /// Subscribed subscriptions send an unsubscribe request; ones the
    /// provider has not acknowledged yet are closed without a frame.
    pub fn remove_subscription(&self, subscription: &Arc<Subscription>) -> Result<()> {
        let mut deferred = Vec::new();
        {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();

            match subscription.state() {
                SubscriptionState::Subscribed => {
                    let id = subscription.subscription_id();
                    if let Some(id) = id {
                        state.active.remove(&id);
                    }

                    match id {
                        Some(id) if state.connection.is_some() => {
                            let seq = protocol::next_sequence_number();
                            state.pending_unsubscribe.insert(seq, subscription.clone());
                            subscription.set_state(SubscriptionState::PendingUnsubscribe);
                            deferred.push(Deferred::SubscriptionState(
                                subscription.clone(),
                                SubscriptionState::PendingUnsubscribe,
                            ));
                            debug!(seq, subscription_id = id, "Unsubscribing");
                            state.send(protocol::encode_unsubscribe(seq, id));
                        }
                        _ => {
                            close_subscription(subscription, &mut deferred);
                        }
                    }
                }
                SubscriptionState::PendingSubscribe => {
                    let guid = subscription.guid();
                    state.pending_submission.retain(|sub| sub.guid() != guid);
                    let seq = state
                        .pending_subscribe
                        .iter()
                        .find(|(_, sub)| sub.guid() == guid)
                        .map(|(seq, _)| *seq);
                    if let Some(seq) = seq {
                        state.pending_subscribe.remove(&seq);
                    }
                    debug!(guid = %guid, "Closing unacknowledged subscription");
                    close_subscription(subscription, &mut deferred);
                }
                SubscriptionState::PendingUnsubscribe
                | SubscriptionState::Closed
                | SubscriptionState::Unknown => {}
            }
        }

        self.inner.dispatch(deferred);
        Ok(())
    }

    /// Register a connection-state handler.
    ///
    /// The handler is told the current state right away unless it is
    /// `Disconnected`.
    pub fn add_connection_state_change_handler<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let handler: Arc<ConnectionStateHandler> = Arc::new(handler);
        let token = self.inner.connection_state_handlers.add(handler.clone());

        let current = self.connection_state();
        if current != ConnectionState::Disconnected {
            handler(current);
        }
        token
    }

    pub fn remove_connection_state_change_handler(&self, token: HandlerToken) -> bool {
        self.inner.connection_state_handlers.remove(token)
    }

    pub fn add_subscription_error_handler<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(&SubscriptionErrorEvent) + Send + Sync + 'static,
    {
        self.inner.subscription_error_handlers.add(Arc::new(handler))
    }

    pub fn remove_subscription_error_handler(&self, token: HandlerToken) -> bool {
        self.inner.subscription_error_handlers.remove(token)
    }

    pub fn add_resync_handler<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.resync_handlers.add(Arc::new(handler))
    }

    pub fn remove_resync_handler(&self, token: HandlerToken) -> bool {
        self.inner.resync_handlers.remove(token)
    }

    /// Tear the registry down: close every subscription, detach and close
    /// the connection.
    ///
    /// Connection-state and subscription-error handlers are dropped; resync
    /// handlers stay registered.
    pub fn close(&self) {
        let mut deferred = Vec::new();
        let connection = {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();
            clear_all(&mut state, &mut deferred);
            if state.state != ConnectionState::Disconnected {
                state.state = ConnectionState::Disconnected;
                deferred.push(Deferred::ConnectionState(ConnectionState::Disconnected));
            }
            state.connection.take()
        };

        if let Some(connection) = connection {
            info!(principal = %self.inner.principal, "Closing connection");
            detach(&connection);
            connection.close();
        }

        self.inner.dispatch(deferred);
        self.inner.connection_state_handlers.clear();
        self.inner.subscription_error_handlers.clear();
    }
}

impl fmt::Debug for RealTimeActivityService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealTimeActivityService")
            .field("principal", &self.inner.principal)
            .field("state", &self.connection_state())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl ServiceInner {
    fn on_connection_state_changed(&self, old: ConnectionState, new: ConnectionState) {
        if new == ConnectionState::Activated {
            return;
        }

        let mut deferred = Vec::new();
        {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            state.state = new;

            match new {
                ConnectionState::Disconnected => {
                    if state.len() > 0 {
                        info!(
                            principal = %self.principal,
                            count = state.len(),
                            "Connection lost, closing subscriptions"
                        );
                    }
                    clear_all(&mut state, &mut deferred);
                }
                ConnectionState::Connecting => demote_for_reconnect(&mut state, &mut deferred),
                ConnectionState::Connected => flush_pending(&mut state),
                ConnectionState::Activated => {}
            }
        }

        debug!(principal = %self.principal, from = %old, to = %new, "Registry saw connection change");
        deferred.push(Deferred::ConnectionState(new));
        self.dispatch(deferred);
    }

    fn on_frame(&self, text: &str) {
        debug!(principal = %self.principal, frame = %text, "Received frame");

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(principal = %self.principal, error = %e, "Dropping malformed frame");
                return;
            }
        };

        let mut deferred = Vec::new();
        {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();

            match frame {
                InboundFrame::SubscribeResponse {
                    seq,
                    status,
                    subscription_id,
                    data,
                    message,
                } => {
                    let Some(subscription) = state.pending_subscribe.remove(&seq) else {
                        debug!(seq, "Subscribe response for unknown sequence number");
                        return;
                    };

                    match subscription_id {
                        Some(id) if status == STATUS_SUCCESS => {
                            if subscription.mark_subscribed(id) {
                                deferred.push(Deferred::SubscriptionState(
                                    subscription.clone(),
                                    SubscriptionState::Subscribed,
                                ));
                            }
                            if let Some(replaced) = state.active.insert(id, subscription.clone()) {
                                warn!(subscription_id = id, "Provider reused a live subscription id");
                                close_subscription(&replaced, &mut deferred);
                            }
                            debug!(seq, subscription_id = id, "Subscribed");
                            deferred.push(Deferred::Created(subscription, id, data));
                        }
                        _ => {
                            let error = SubscriptionErrorKind::from_status(status);
                            warn!(
                                seq,
                                status,
                                error = %error,
                                uri = %subscription.resource_uri(),
                                "Subscription rejected"
                            );
                            close_subscription(&subscription, &mut deferred);
                            deferred.push(Deferred::Error(SubscriptionErrorEvent {
                                subscription,
                                error,
                                message: message.unwrap_or_else(|| text.to_string()),
                            }));
                        }
                    }
                }
                InboundFrame::UnsubscribeResponse { seq, status } => {
                    let Some(subscription) = state.pending_unsubscribe.remove(&seq) else {
                        debug!(seq, "Unsubscribe response for unknown sequence number");
                        return;
                    };
                    if status != STATUS_SUCCESS {
                        debug!(seq, status, "Unsubscribe failed, closing anyway");
                    }
                    close_subscription(&subscription, &mut deferred);
                }
                InboundFrame::ChangeEvent {
                    subscription_id,
                    data,
                } => match state.active.get(&subscription_id) {
                    Some(subscription) => {
                        deferred.push(Deferred::Event(subscription.clone(), data));
                    }
                    None => {
                        debug!(subscription_id, "Change event for unknown subscription id");
                        return;
                    }
                },
                InboundFrame::Resync => {
                    info!(principal = %self.principal, "Resync requested");
                    deferred.push(Deferred::Resync);
                }
            }
        }

        self.dispatch(deferred);
    }

    fn dispatch(&self, deferred: Vec<Deferred>) {
        for notification in deferred {
            match notification {
                Deferred::SubscriptionState(subscription, state) => {
                    subscription.handler().on_state_changed(state);
                }
                Deferred::Created(subscription, id, data) => {
                    subscription.handler().on_created(id, &data);
                }
                Deferred::Event(subscription, data) => {
                    subscription.handler().on_event(&data);
                }
                Deferred::Error(event) => {
                    event
                        .subscription
                        .handler()
                        .on_error(event.error, &event.message);
                    for handler in self.subscription_error_handlers.snapshot() {
                        handler(&event);
                    }
                }
                Deferred::Resync => {
                    for handler in self.resync_handlers.snapshot() {
                        handler();
                    }
                }
                Deferred::ConnectionState(state) => {
                    for handler in self.connection_state_handlers.snapshot() {
                        handler(state);
                    }
                }
            }
        }
    }
}

fn detach(connection: &ConnectionSupervisor) {
    connection.set_state_changed_handler(None);
    connection.set_received_handler(None);
}

fn close_subscription(subscription: &Arc<Subscription>, deferred: &mut Vec<Deferred>) {
    if subscription.set_state(SubscriptionState::Closed) {
        deferred.push(Deferred::SubscriptionState(
            subscription.clone(),
            SubscriptionState::Closed,
        ));
    }
}

/// Send a subscribe request for everything waiting in `pending_submission`
fn flush_pending(state: &mut ServiceState) {
    while let Some(subscription) = state.pending_submission.pop() {
        let seq = protocol::next_sequence_number();
        debug!(seq, uri = %subscription.resource_uri(), "Subscribing");
        let frame = protocol::encode_subscribe(seq, subscription.resource_uri());
        state.pending_subscribe.insert(seq, subscription);
        state.send(frame);
    }
}

/// Queue subscribed and in-flight subscriptions for resubmission and close
/// those waiting on an unsubscribe
fn demote_for_reconnect(state: &mut ServiceState, deferred: &mut Vec<Deferred>) {
    let active: Vec<_> = state.active.drain().map(|(_, sub)| sub).collect();
    let in_flight: Vec<_> = std::mem::take(&mut state.pending_subscribe)
        .into_values()
        .collect();

    for subscription in active.into_iter().chain(in_flight) {
        if subscription.set_state(SubscriptionState::PendingSubscribe) {
            deferred.push(Deferred::SubscriptionState(
                subscription.clone(),
                SubscriptionState::PendingSubscribe,
            ));
        }
        state.pending_submission.push(subscription);
    }

    for (_, subscription) in std::mem::take(&mut state.pending_unsubscribe) {
        close_subscription(&subscription, deferred);
    }
}

fn clear_all(state: &mut ServiceState, deferred: &mut Vec<Deferred>) {
    let subscriptions: Vec<_> = std::mem::take(&mut state.pending_submission)
        .into_iter()
        .chain(std::mem::take(&mut state.pending_subscribe).into_values())
        .chain(state.active.drain().map(|(_, sub)| sub))
        .chain(std::mem::take(&mut state.pending_unsubscribe).into_values())
        .collect();

    for subscription in subscriptions {
        close_subscription(&subscription, deferred);
    }
}
