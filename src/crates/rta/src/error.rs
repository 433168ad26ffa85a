//! Error types for the real-time activity client

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned synchronously by the real-time activity API.
///
/// Transport failures during connect are recovered by the connection
/// supervisor and only show up as connection state changes; they reach
/// this type when a caller drives the transport directly.
#[derive(Debug, Error)]
pub enum RtaError {
    /// The registry has no live connection and is not trying to get one
    #[error("The websocket is not connected and not reconnecting. Call activate to reconnect.")]
    NotActivated,

    /// Caller handed in something the registry cannot use
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or unexpected wire frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No tokio runtime available to drive background tasks
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Result type for real-time activity operations
pub type Result<T> = std::result::Result<T, RtaError>;

/// Errors produced by a single transport operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No socket is open
    #[error("Transport is not connected")]
    NotConnected,

    /// The WebSocket handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The token provider could not authenticate the request
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The outbound queue rejected a frame
    #[error("Send failed: {0}")]
    Send(String),

    /// The endpoint could not be turned into a request
    #[error("Invalid endpoint uri: {0}")]
    InvalidUri(String),
}

impl TransportError {
    /// Check if a retry of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected | TransportError::Handshake(_) | TransportError::Send(_)
        )
    }
}

/// Provider-side reasons a subscribe request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionErrorKind {
    /// Status 0
    NoError,
    /// Status 1: the principal holds too many subscriptions
    SubscriptionLimitReached,
    /// Status 2: the principal may not observe this resource
    AccessDenied,
    /// Any other status
    GenericProviderError,
}

impl SubscriptionErrorKind {
    /// Translate a provider status code
    pub fn from_status(status: i64) -> Self {
        match status {
            0 => SubscriptionErrorKind::NoError,
            1 => SubscriptionErrorKind::SubscriptionLimitReached,
            2 => SubscriptionErrorKind::AccessDenied,
            _ => SubscriptionErrorKind::GenericProviderError,
        }
    }
}

impl std::fmt::Display for SubscriptionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionErrorKind::NoError => write!(f, "no error"),
            SubscriptionErrorKind::SubscriptionLimitReached => {
                write!(f, "subscription limit reached")
            }
            SubscriptionErrorKind::AccessDenied => write!(f, "access denied"),
            SubscriptionErrorKind::GenericProviderError => write!(f, "generic provider error"),
        }
    }
}
