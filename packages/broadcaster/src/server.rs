//! Server façade: configuration, publishing, and stats.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::hub::{Hub, HubError, HubHandle};
use crate::models::{Message, Stats};

/// Connect authorization predicate, applied to the handshake auth data.
pub type ConnectPredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Subscribe authorization predicate, applied to the connection's auth data
/// and the requested channel.
pub type SubscribePredicate = Arc<dyn Fn(&Message, &str) -> bool + Send + Sync>;

/// Server configuration. Both predicates default to allow-all.
#[derive(Clone)]
pub struct ServerConfig {
    pub can_connect: Option<ConnectPredicate>,
    pub can_subscribe: Option<SubscribePredicate>,

    /// How long a poll request is held open waiting for messages.
    pub poll_timeout: Duration,

    /// Bound of each long-poll pending outbox; overflow drops the oldest.
    pub outbox_capacity: usize,

    /// Idle duration after which a long-poll connection expires.
    pub session_expiry: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            can_connect: None,
            can_subscribe: None,
            poll_timeout: Duration::from_secs(30),
            outbox_capacity: 100,
            session_expiry: Duration::from_secs(60),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("can_connect", &self.can_connect.is_some())
            .field("can_subscribe", &self.can_subscribe.is_some())
            .field("poll_timeout", &self.poll_timeout)
            .field("outbox_capacity", &self.outbox_capacity)
            .field("session_expiry", &self.session_expiry)
            .finish()
    }
}

impl ServerConfig {
    #[must_use]
    pub fn allows_connect(&self, auth: &Message) -> bool {
        self.can_connect.as_ref().is_none_or(|allowed| allowed(auth))
    }
}

/// The broadcast server: configuration plus a handle to the hub.
///
/// Cheap to clone; hand one to the HTTP app as shared data. Publishing and
/// stats go through the hub's command stream, so observers see a linearized
/// view.
#[derive(Debug, Clone)]
pub struct BroadcastServer {
    config: Arc<ServerConfig>,
    hub: HubHandle,
}

impl BroadcastServer {
    /// Build the server and its hub. Spawn [`Hub::run`] to start it.
    #[must_use]
    pub fn new(config: ServerConfig) -> (Self, Hub) {
        let config = Arc::new(config);
        let (hub, handle) = Hub::new(config.clone());

        (
            Self {
                config,
                hub: handle,
            },
            hub,
        )
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub const fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Publish `body` on `channel` to every local subscriber.
    ///
    /// # Errors
    ///
    /// * [`HubError::Closed`] if the server has stopped
    pub async fn publish(&self, channel: &str, body: Value) -> Result<usize, HubError> {
        self.hub.publish(channel, body).await
    }

    /// Snapshot connection and subscription counts.
    ///
    /// # Errors
    ///
    /// * [`HubError::Closed`] if the server has stopped
    pub async fn stats(&self) -> Result<Stats, HubError> {
        self.hub.stats().await
    }

    /// Stop the hub; every connection is closed.
    pub fn shutdown(&self) {
        self.hub.shutdown();
    }
}
