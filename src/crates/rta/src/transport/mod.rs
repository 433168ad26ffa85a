//! Transport layer
//!
//! A [`Transport`] owns one physical socket. It knows nothing about the
//! frames it carries: it connects, queues text frames, and reports inbound
//! text and close codes through callbacks. Retrying is the connection
//! supervisor's job.

mod websocket;

pub use websocket::WebSocketTransport;

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Close code for a normal, client-initiated close
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the socket dies without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Invoked with each inbound text frame, in arrival order
pub type ReceivedHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Invoked once with the close code when the socket goes away
pub type ClosedHandler = Arc<dyn Fn(u16) + Send + Sync>;

/// Builds a fresh transport, one per principal
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

/// The authenticated identity a socket belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    /// Create a principal from its identifier (an xuid, for example)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Supplies bearer tokens for the connect handshake
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current bearer token for `principal`, scoped to `uri`
    async fn bearer_token(&self, principal: &Principal, uri: &str)
        -> Result<String, TransportError>;
}

/// Token provider that hands out one fixed token
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &crate::logging::redact_token(&self.token))
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(
        &self,
        _principal: &Principal,
        _uri: &str,
    ) -> Result<String, TransportError> {
        if self.token.is_empty() {
            return Err(TransportError::Auth("no token configured".to_string()));
        }
        Ok(self.token.clone())
    }
}

/// A single physical socket.
///
/// Implementations report failure only through returned errors and the
/// closed handler; they never panic and never retry.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the socket, authenticating as `principal`. One attempt only.
    async fn connect(
        &self,
        principal: &Principal,
        uri: &str,
        sub_protocol: &str,
    ) -> Result<(), TransportError>;

    /// Queue one text frame. Frames go out in the order they were queued.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Send a normal close and tear the socket down.
    ///
    /// A close requested here does not invoke the closed handler.
    fn close(&self);

    fn set_received_handler(&self, handler: Option<ReceivedHandler>);

    fn set_closed_handler(&self, handler: Option<ClosedHandler>);
}
