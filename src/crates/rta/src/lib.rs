//! Real-time activity client
//!
//! Multiplexes many logical subscriptions (presence, social graph,
//! multiplayer sessions, tournaments, statistics) over one WebSocket per
//! authenticated principal, with automatic reconnection, request/response
//! correlation and fan-out event dispatch.
//!
//! # Example
//!
//! ```rust,no_run
//! use rta::{
//!     ActivationManager, ChannelSubscriber, ConsumerKind, Principal, RtaConfig,
//!     StaticTokenProvider, Topic, Transport, TransportFactory, WebSocketTransport,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> rta::Result<()> {
//! let tokens = Arc::new(StaticTokenProvider::new("XBL3.0 x=...;..."));
//! let factory: TransportFactory = Arc::new(move || -> Arc<dyn Transport> {
//!     Arc::new(WebSocketTransport::new(tokens.clone()))
//! });
//!
//! let manager = ActivationManager::new(RtaConfig::default(), factory);
//! let principal = Principal::new("2533274790395904");
//! let service = manager.activate(&principal, ConsumerKind::Title)?;
//!
//! let (subscription, mut events) =
//!     ChannelSubscriber::subscribe(&Topic::DevicePresence { xuid: 2533274790395904 });
//! service.add_subscription(&subscription)?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod protocol;
pub mod service;
pub mod subscription;
pub mod topics;
pub mod transport;

pub use activation::{ActivationManager, ConsumerKind};
pub use backoff::BackoffPolicy;
pub use config::RtaConfig;
pub use connection::{ConnectionState, ConnectionSupervisor};
pub use error::{Result, RtaError, SubscriptionErrorKind, TransportError};
pub use handlers::{HandlerToken, SubscriptionErrorEvent};
pub use service::RealTimeActivityService;
pub use subscription::{Subscription, SubscriptionHandler, SubscriptionInfo, SubscriptionState};
pub use topics::{ChannelSubscriber, SubscriptionEvent, Topic};
pub use transport::{
    Principal, StaticTokenProvider, TokenProvider, Transport, TransportFactory, WebSocketTransport,
};
