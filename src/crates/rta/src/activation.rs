//! Activation accounting
//!
//! Several consumers may need the same principal's socket at once: a title
//! talking to the registry directly, plus long-lived managers (multiplayer,
//! social) that hold their own claim. [`ActivationManager`] counts those
//! claims and owns one [`RealTimeActivityService`] per principal, closing it
//! only when the last claim is released.

use crate::config::RtaConfig;
use crate::connection::ConnectionSupervisor;
use crate::error::Result;
use crate::service::RealTimeActivityService;
use crate::transport::{Principal, TransportFactory};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Who is asking for the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerKind {
    /// Direct use of the registry
    Title,
    MultiplayerManager,
    SocialManager,
}

impl ConsumerKind {
    /// Long-lived managers share a single socket claim between them
    pub fn is_manager(&self) -> bool {
        matches!(
            self,
            ConsumerKind::MultiplayerManager | ConsumerKind::SocialManager
        )
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerKind::Title => "title",
            ConsumerKind::MultiplayerManager => "multiplayer_manager",
            ConsumerKind::SocialManager => "social_manager",
        };
        f.write_str(name)
    }
}

struct PrincipalEntry {
    service: RealTimeActivityService,
    socket_activations: u32,
    title_activations: u32,
    manager_activations: u32,
}

/// Reference-counts socket users per principal
pub struct ActivationManager {
    config: RtaConfig,
    transport_factory: TransportFactory,
    principals: Mutex<HashMap<Principal, PrincipalEntry>>,
}

impl ActivationManager {
    pub fn new(config: RtaConfig, transport_factory: TransportFactory) -> Self {
        Self {
            config,
            transport_factory,
            principals: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RtaConfig {
        &self.config
    }

    /// Claim the principal's socket, opening it on first use.
    ///
    /// Exceeding the soft limit only logs a warning.
    pub fn activate(
        &self,
        principal: &Principal,
        kind: ConsumerKind,
    ) -> Result<RealTimeActivityService> {
        let (service, connection) = {
            let mut principals = self.principals.lock();

            let connection = if principals.contains_key(principal) {
                None
            } else {
                let transport = (self.transport_factory)();
                Some(ConnectionSupervisor::new(
                    principal.clone(),
                    transport,
                    &self.config,
                )?)
            };

            let entry = principals
                .entry(principal.clone())
                .or_insert_with(|| PrincipalEntry {
                    service: RealTimeActivityService::new(principal.clone()),
                    socket_activations: 0,
                    title_activations: 0,
                    manager_activations: 0,
                });

            if kind.is_manager() {
                entry.manager_activations += 1;
                if entry.manager_activations == 1 {
                    entry.socket_activations += 1;
                }
            } else {
                entry.title_activations += 1;
                entry.socket_activations += 1;
            }

            debug!(
                principal = %principal,
                kind = %kind,
                socket_activations = entry.socket_activations,
                manager_activations = entry.manager_activations,
                "Activated"
            );

            if self.config.diagnostics_enabled
                && entry.socket_activations > self.config.activation_soft_limit
            {
                warn!(
                    principal = %principal,
                    count = entry.socket_activations,
                    limit = self.config.activation_soft_limit,
                    "Too many activations for one principal; make sure every activate is paired with a deactivate"
                );
            }

            (entry.service.clone(), connection)
        };

        match connection {
            Some(connection) => {
                info!(principal = %principal, "Opening real-time activity connection");
                service.activate_connection(connection);
            }
            // Revives a socket the peer closed normally; no-op otherwise
            None => service.ensure_connected(),
        }

        Ok(service)
    }

    /// Release a claim; the socket closes once no claim is left
    pub fn deactivate(&self, principal: &Principal, kind: ConsumerKind) {
        let closing = {
            let mut principals = self.principals.lock();

            let Some(entry) = principals.get_mut(principal) else {
                debug!(principal = %principal, kind = %kind, "Deactivate for inactive principal");
                return;
            };

            if kind.is_manager() {
                if entry.manager_activations == 0 {
                    warn!(principal = %principal, kind = %kind, "Unbalanced manager deactivate");
                    return;
                }
                entry.manager_activations -= 1;
                if entry.manager_activations > 0 {
                    return;
                }
            } else {
                if entry.title_activations == 0 {
                    warn!(principal = %principal, kind = %kind, "Unbalanced title deactivate");
                    return;
                }
                entry.title_activations -= 1;
            }
            entry.socket_activations = entry.socket_activations.saturating_sub(1);

            debug!(
                principal = %principal,
                kind = %kind,
                socket_activations = entry.socket_activations,
                manager_activations = entry.manager_activations,
                "Deactivated"
            );

            if entry.socket_activations == 0 {
                principals.remove(principal).map(|entry| entry.service)
            } else {
                None
            }
        };

        if let Some(service) = closing {
            info!(principal = %principal, "Closing real-time activity connection");
            service.close();
        }
    }

    /// Registry for `principal`, if it is active
    pub fn service(&self, principal: &Principal) -> Option<RealTimeActivityService> {
        self.principals
            .lock()
            .get(principal)
            .map(|entry| entry.service.clone())
    }

    /// Socket claims per principal
    pub fn activation_counts(&self) -> HashMap<Principal, u32> {
        self.principals
            .lock()
            .iter()
            .map(|(principal, entry)| (principal.clone(), entry.socket_activations))
            .collect()
    }

    /// Manager claims per principal
    pub fn manager_activation_counts(&self) -> HashMap<Principal, u32> {
        self.principals
            .lock()
            .iter()
            .map(|(principal, entry)| (principal.clone(), entry.manager_activations))
            .collect()
    }
}

impl fmt::Debug for ActivationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationManager")
            .field("endpoint", &self.config.endpoint)
            .field("principals", &self.principals.lock().len())
            .finish()
    }
}
