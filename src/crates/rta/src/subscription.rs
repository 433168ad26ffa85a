//! Subscriptions
//!
//! A [`Subscription`] is one logical topic observed over the shared socket.
//! The registry only ever looks at its state, resource URI and provider id;
//! payload handling is left to the [`SubscriptionHandler`] it carries.

use crate::error::SubscriptionErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Never handed to a registry
    Unknown,
    /// Queued or sent, waiting for the provider to acknowledge
    PendingSubscribe,
    /// Acknowledged and receiving events
    Subscribed,
    /// Unsubscribe sent, waiting for the acknowledgement
    PendingUnsubscribe,
    /// Terminal
    Closed,
}

impl SubscriptionState {
    /// Check if the subscription is held by a registry
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionState::PendingSubscribe
                | SubscriptionState::Subscribed
                | SubscriptionState::PendingUnsubscribe
        )
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Unknown => "unknown",
            SubscriptionState::PendingSubscribe => "pending_subscribe",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::PendingUnsubscribe => "pending_unsubscribe",
            SubscriptionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Callbacks a subscription exposes to the registry.
///
/// All methods run outside the registry lock, so they may call back into
/// the registry (to unsubscribe, for instance).
pub trait SubscriptionHandler: Send + Sync {
    /// The provider acknowledged the subscription
    fn on_created(&self, subscription_id: u32, data: &Value);

    /// A change event arrived
    fn on_event(&self, data: &Value);

    fn on_state_changed(&self, _state: SubscriptionState) {}

    /// The provider rejected the subscription
    fn on_error(&self, _error: SubscriptionErrorKind, _message: &str) {}
}

#[derive(Debug)]
struct Lifecycle {
    state: SubscriptionState,
    subscription_id: Option<u32>,
    state_changed_at: DateTime<Utc>,
}

/// One logical topic
pub struct Subscription {
    guid: Uuid,
    resource_uri: String,
    handler: Arc<dyn SubscriptionHandler>,
    lifecycle: Mutex<Lifecycle>,
}

impl Subscription {
    /// Create a subscription in the `Unknown` state
    pub fn new(resource_uri: impl Into<String>, handler: Arc<dyn SubscriptionHandler>) -> Arc<Self> {
        Arc::new(Self {
            guid: Uuid::new_v4(),
            resource_uri: resource_uri.into(),
            handler,
            lifecycle: Mutex::new(Lifecycle {
                state: SubscriptionState::Unknown,
                subscription_id: None,
                state_changed_at: Utc::now(),
            }),
        })
    }

    /// Client-side correlation token
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    /// Provider-assigned id, valid while subscribed or unsubscribing
    pub fn subscription_id(&self) -> Option<u32> {
        self.lifecycle.lock().subscription_id
    }

    pub fn state(&self) -> SubscriptionState {
        self.lifecycle.lock().state
    }

    pub fn handler(&self) -> &Arc<dyn SubscriptionHandler> {
        &self.handler
    }

    /// Point-in-time view of this subscription
    pub fn info(&self) -> SubscriptionInfo {
        let lifecycle = self.lifecycle.lock();
        SubscriptionInfo {
            guid: self.guid,
            resource_uri: self.resource_uri.clone(),
            subscription_id: lifecycle.subscription_id,
            state: lifecycle.state,
            state_changed_at: lifecycle.state_changed_at,
        }
    }

    /// Move to `state`; returns `false` if it was already there.
    ///
    /// Leaving the subscribed states drops the provider id.
    pub(crate) fn set_state(&self, state: SubscriptionState) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == state {
            return false;
        }
        lifecycle.state = state;
        lifecycle.state_changed_at = Utc::now();
        if !matches!(
            state,
            SubscriptionState::Subscribed | SubscriptionState::PendingUnsubscribe
        ) {
            lifecycle.subscription_id = None;
        }
        true
    }

    pub(crate) fn mark_subscribed(&self, subscription_id: u32) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.subscription_id = Some(subscription_id);
        let changed = lifecycle.state != SubscriptionState::Subscribed;
        if changed {
            lifecycle.state = SubscriptionState::Subscribed;
            lifecycle.state_changed_at = Utc::now();
        }
        changed
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.lifecycle.lock();
        f.debug_struct("Subscription")
            .field("guid", &self.guid)
            .field("resource_uri", &self.resource_uri)
            .field("subscription_id", &lifecycle.subscription_id)
            .field("state", &lifecycle.state)
            .finish()
    }
}

/// Snapshot of a subscription, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub guid: Uuid,
    pub resource_uri: String,
    pub subscription_id: Option<u32>,
    pub state: SubscriptionState,
    /// When `state` was entered
    pub state_changed_at: DateTime<Utc>,
}
