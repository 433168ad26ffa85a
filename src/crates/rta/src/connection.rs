//! Connection supervisor
//!
//! Wraps a [`Transport`] with a reconnect state machine. Callers ask for a
//! connection with [`ConnectionSupervisor::ensure_connected`] and observe
//! the outcome through the state-changed handler; connect attempts and
//! backoff waits run on background tasks of the runtime captured at
//! construction.
//!
//! ```text
//! Disconnected --ensure_connected--> Activated --> Connecting --> Connected
//!       ^                                              |  ^           |
//!       +------ timeout window elapsed / close() ------+  +-- lost ---+
//! ```

use crate::backoff::BackoffPolicy;
use crate::config::RtaConfig;
use crate::error::{Result, RtaError, TransportError};
use crate::logging::format_duration;
use crate::transport::{Principal, ReceivedHandler, Transport, CLOSE_NORMAL};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// State of the supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// A connection was requested and no attempt has run yet
    Activated,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Activated => "activated",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Invoked with `(old, new)` on every state change
pub type StateChangedHandler = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

struct Status {
    state: ConnectionState,
    /// A connect loop is running
    connecting: bool,
    close_requested: bool,
    /// Bumped whenever a connection starts or ends; lifetime timers of an
    /// older connection do nothing
    episode: u64,
}

struct Inner {
    principal: Principal,
    transport: Arc<dyn Transport>,
    endpoint: String,
    sub_protocol: String,
    backoff: BackoffPolicy,
    timeout_window: Duration,
    max_lifetime: Option<Duration>,
    runtime: Handle,
    status: Mutex<Status>,
    state_handler: Mutex<Option<StateChangedHandler>>,
    close_notify: Notify,
}

/// Keeps one principal's transport connected.
///
/// Cloning yields another handle to the same supervisor.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Create a supervisor in the `Disconnected` state.
    ///
    /// Must be called from within a tokio runtime; background work is
    /// spawned on that runtime.
    pub fn new(principal: Principal, transport: Arc<dyn Transport>, config: &RtaConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| RtaError::Runtime(format!("no tokio runtime: {}", e)))?;

        let inner = Arc::new(Inner {
            principal,
            transport,
            endpoint: config.endpoint.clone(),
            sub_protocol: config.sub_protocol.clone(),
            backoff: config.backoff.clone(),
            timeout_window: config.timeout_window(),
            max_lifetime: config.max_connection_lifetime(),
            runtime,
            status: Mutex::new(Status {
                state: ConnectionState::Disconnected,
                connecting: false,
                close_requested: false,
                episode: 0,
            }),
            state_handler: Mutex::new(None),
            close_notify: Notify::new(),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.transport.set_closed_handler(Some(Arc::new(move |code| {
            if let Some(inner) = weak.upgrade() {
                inner.on_close(code);
            }
        })));

        Ok(Self { inner })
    }

    pub fn principal(&self) -> &Principal {
        &self.inner.principal
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.lock().state
    }

    /// Check whether a connect loop is running
    pub fn is_connecting(&self) -> bool {
        self.inner.status.lock().connecting
    }

    /// Start connecting unless already connected or connecting. Returns
    /// immediately.
    pub fn ensure_connected(&self) {
        self.inner.ensure_connected();
    }

    /// Queue a text frame on the transport
    pub fn send(&self, text: String) -> std::result::Result<(), TransportError> {
        self.inner.transport.send(text)
    }

    /// Stop retrying, close the socket and settle in `Disconnected`
    pub fn close(&self) {
        self.inner.close();
    }

    /// Replace the state-changed handler
    pub fn set_state_changed_handler(&self, handler: Option<StateChangedHandler>) {
        *self.inner.state_handler.lock() = handler;
    }

    /// Route inbound frames to `handler`
    pub fn set_received_handler(&self, handler: Option<ReceivedHandler>) {
        self.inner.transport.set_received_handler(handler);
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("principal", &self.inner.principal)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn ensure_connected(self: &Arc<Self>) {
        let (activated, spawn) = {
            let mut status = self.status.lock();
            let spawn = if status.connecting {
                if !status.close_requested {
                    return;
                }
                // The loop has not seen the close yet; it keeps going
                status.close_requested = false;
                false
            } else if status.state == ConnectionState::Connected {
                return;
            } else {
                status.connecting = true;
                status.close_requested = false;
                true
            };

            let activated = status.state == ConnectionState::Disconnected;
            if activated {
                status.state = ConnectionState::Activated;
            }
            (activated, spawn)
        };

        if activated {
            self.notify(ConnectionState::Disconnected, ConnectionState::Activated);
        }
        if spawn {
            let inner = self.clone();
            self.runtime.spawn(async move { inner.connect_loop().await });
        }
    }

    async fn connect_loop(self: Arc<Self>) {
        let old = {
            let mut status = self.status.lock();
            if status.close_requested {
                status.connecting = false;
                debug!(principal = %self.principal, "Closed before the first attempt");
                return;
            }
            std::mem::replace(&mut status.state, ConnectionState::Connecting)
        };
        if old != ConnectionState::Connecting {
            self.notify(old, ConnectionState::Connecting);
        }

        let started = Instant::now();
        let mut delays = self.backoff.schedule();
        let mut attempt: u32 = 0;
        let mut timed_out = false;

        loop {
            let notified = self.close_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut status = self.status.lock();
                if status.close_requested {
                    status.connecting = false;
                    debug!(principal = %self.principal, "Connect loop stopped");
                    return;
                }
            }

            attempt += 1;
            debug!(principal = %self.principal, attempt, "Connecting");

            match self
                .transport
                .connect(&self.principal, &self.endpoint, &self.sub_protocol)
                .await
            {
                Ok(()) => {
                    self.on_connected();
                    return;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(principal = %self.principal, attempt, error = %e, "Connect attempt failed");
                    } else {
                        // Retrying will not help until the token or endpoint changes
                        error!(principal = %self.principal, attempt, error = %e, "Connect attempt rejected");
                    }
                    if !timed_out && started.elapsed() >= self.timeout_window {
                        timed_out = true;
                        warn!(
                            principal = %self.principal,
                            elapsed = %format_duration(started.elapsed()),
                            "Connection timeout window elapsed, still retrying"
                        );
                        self.transition(ConnectionState::Disconnected);
                    }
                }
            }

            let delay = delays.next().unwrap_or_else(|| self.backoff.max());
            debug!(principal = %self.principal, delay = %format_duration(delay), "Waiting before retry");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut notified => {}
            }
        }
    }

    fn on_connected(self: &Arc<Self>) {
        let (old, episode) = {
            let mut status = self.status.lock();
            status.connecting = false;
            if status.close_requested {
                drop(status);
                debug!(principal = %self.principal, "Closed while connecting");
                self.transport.close();
                return;
            }
            status.episode += 1;
            let old = std::mem::replace(&mut status.state, ConnectionState::Connected);
            (old, status.episode)
        };

        if old != ConnectionState::Connecting {
            self.notify(old, ConnectionState::Connecting);
        }
        self.notify(ConnectionState::Connecting, ConnectionState::Connected);

        if let Some(lifetime) = self.max_lifetime {
            let weak = Arc::downgrade(self);
            self.runtime.spawn(async move {
                tokio::time::sleep(lifetime).await;
                if let Some(inner) = weak.upgrade() {
                    inner.recycle(episode);
                }
            });
        }
    }

    fn on_close(self: &Arc<Self>, code: u16) {
        let reconnect = {
            let mut status = self.status.lock();
            status.episode += 1;
            !status.close_requested && code != CLOSE_NORMAL
        };

        if reconnect {
            info!(principal = %self.principal, code, "Connection lost, reconnecting");
            self.reconnect();
        } else {
            info!(principal = %self.principal, code, "Connection closed");
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn recycle(self: &Arc<Self>, episode: u64) {
        {
            let mut status = self.status.lock();
            if status.episode != episode
                || status.state != ConnectionState::Connected
                || status.close_requested
            {
                return;
            }
            status.episode += 1;
        }

        info!(principal = %self.principal, "Connection reached its maximum lifetime, recycling");
        self.transport.close();
        self.reconnect();
    }

    /// Reconnect after a lost or recycled connection.
    ///
    /// Unlike `ensure_connected` this never clears `close_requested`, so a
    /// `close()` from a state handler or another thread sticks.
    fn reconnect(self: &Arc<Self>) {
        let old = {
            let mut status = self.status.lock();
            if status.close_requested {
                return;
            }
            std::mem::replace(&mut status.state, ConnectionState::Connecting)
        };
        if old != ConnectionState::Connecting {
            self.notify(old, ConnectionState::Connecting);
        }

        let spawn = {
            let mut status = self.status.lock();
            if status.close_requested || status.connecting {
                false
            } else {
                status.connecting = true;
                true
            }
        };
        if spawn {
            let inner = self.clone();
            self.runtime.spawn(async move { inner.connect_loop().await });
        }
    }

    fn close(&self) {
        {
            let mut status = self.status.lock();
            status.close_requested = true;
            status.episode += 1;
        }
        self.close_notify.notify_waiters();
        self.transport.close();
        self.transition(ConnectionState::Disconnected);
    }

    fn transition(&self, new: ConnectionState) {
        let old = {
            let mut status = self.status.lock();
            if status.state == new {
                return;
            }
            std::mem::replace(&mut status.state, new)
        };
        self.notify(old, new);
    }

    fn notify(&self, old: ConnectionState, new: ConnectionState) {
        info!(principal = %self.principal, from = %old, to = %new, "Connection state changed");
        let handler = self.state_handler.lock().clone();
        if let Some(handler) = handler {
            handler(old, new);
        }
    }
}
