//! Resource topics
//!
//! Builders for the resource URIs the service publishes on, and a
//! channel-backed [`SubscriptionHandler`] for consumers that would rather
//! await events than implement callbacks. Payloads stay raw JSON; use
//! [`SubscriptionEvent::decode`] to turn one into your own type.

use crate::error::{Result, SubscriptionErrorKind};
use crate::subscription::{Subscription, SubscriptionHandler, SubscriptionState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A resource that can be subscribed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topic {
    /// Which devices a user is signed in on
    DevicePresence { xuid: u64 },
    /// A user's presence in one title
    TitlePresence { xuid: u64, title_id: u32 },
    /// Changes to a user's social graph
    SocialRelationship { xuid: u64 },
    /// One statistic of a user in a service configuration
    Statistic { xuid: u64, scid: String, name: String },
    /// Achievement progress of a user in a service configuration
    AchievementProgress { xuid: u64, scid: String },
    /// Multiplayer session change notifications for the connection
    MultiplayerSession,
    Tournament {
        organizer_id: String,
        tournament_id: String,
    },
    Team {
        organizer_id: String,
        tournament_id: String,
        team_id: String,
    },
    /// Any other resource URI
    Custom { uri: String },
}

impl Topic {
    /// The resource URI sent in the subscribe request
    pub fn uri(&self) -> String {
        match self {
            Topic::DevicePresence { xuid } => {
                format!("https://userpresence.xboxlive.com/users/xuid({})/devices", xuid)
            }
            Topic::TitlePresence { xuid, title_id } => format!(
                "https://userpresence.xboxlive.com/users/xuid({})/titles/{}",
                xuid, title_id
            ),
            Topic::SocialRelationship { xuid } => {
                format!("http://social.xboxlive.com/users/xuid({})/friends", xuid)
            }
            Topic::Statistic { xuid, scid, name } => format!(
                "https://userstats.xboxlive.com/users/xuid({})/scids/{}/stats/{}",
                xuid, scid, name
            ),
            Topic::AchievementProgress { xuid, scid } => format!(
                "https://achievements.xboxlive.com/users/xuid({})/achievements/{}",
                xuid,
                scid.to_lowercase()
            ),
            Topic::MultiplayerSession => "https://sessiondirectory.xboxlive.com/connections/".to_string(),
            Topic::Tournament {
                organizer_id,
                tournament_id,
            } => format!(
                "https://tournamentshub.xboxlive.com/tournaments/{}/{}",
                organizer_id, tournament_id
            ),
            Topic::Team {
                organizer_id,
                tournament_id,
                team_id,
            } => format!(
                "https://tournamentshub.xboxlive.com/tournaments/{}/{}/teams/{}",
                organizer_id, tournament_id, team_id
            ),
            Topic::Custom { uri } => uri.clone(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Lifecycle event delivered by a [`ChannelSubscriber`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    Created { subscription_id: u32, data: Value },
    Changed { data: Value },
    StateChanged { state: SubscriptionState },
    Error {
        error: SubscriptionErrorKind,
        message: String,
    },
}

impl SubscriptionEvent {
    /// Decode the payload of a `Created` or `Changed` event
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self {
            SubscriptionEvent::Created { data, .. } | SubscriptionEvent::Changed { data } => {
                Ok(Some(serde_json::from_value(data.clone())?))
            }
            _ => Ok(None),
        }
    }
}

/// Forwards every callback into an unbounded channel
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl ChannelSubscriber {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    /// Subscription for `topic` whose events arrive on the returned receiver
    pub fn subscribe(
        topic: &Topic,
    ) -> (Arc<Subscription>, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (handler, rx) = Self::new();
        (Subscription::new(topic.uri(), handler), rx)
    }

    fn forward(&self, event: SubscriptionEvent) {
        // The receiver going away just means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl SubscriptionHandler for ChannelSubscriber {
    fn on_created(&self, subscription_id: u32, data: &Value) {
        self.forward(SubscriptionEvent::Created {
            subscription_id,
            data: data.clone(),
        });
    }

    fn on_event(&self, data: &Value) {
        self.forward(SubscriptionEvent::Changed { data: data.clone() });
    }

    fn on_state_changed(&self, state: SubscriptionState) {
        self.forward(SubscriptionEvent::StateChanged { state });
    }

    fn on_error(&self, error: SubscriptionErrorKind, message: &str) {
        self.forward(SubscriptionEvent::Error {
            error,
            message: message.to_string(),
        });
    }
}
