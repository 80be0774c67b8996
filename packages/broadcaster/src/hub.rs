//! The hub: authoritative local state for connections and subscriptions.
//!
//! All mutations are serialized on a single task draining a command channel.
//! Commands carry their completion signal as an embedded oneshot sender, so
//! callers on any task observe a linearized view of the tables. Publish
//! fan-out runs inline on the hub task; connection sends are non-blocking by
//! contract (see [`crate::connection`]).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::{thread_rng, Rng as _};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnId, ConnectionHandle, LongpollSession};
use crate::models::{Message, Stats};
use crate::server::ServerConfig;

/// Close code sent to socket connections when the server stops.
const CLOSE_GOING_AWAY: u16 = 1001;

/// A subscription refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("Channel refused")]
    Refused,
}

/// Errors surfaced by [`HubHandle`] operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub has stopped; the command was not processed.
    #[error("Hub is closed")]
    Closed,
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

/// A command processed by the [`Hub`].
#[derive(Debug)]
enum Command {
    Register {
        conn: ConnectionHandle,
        auth: Message,
        res_tx: oneshot::Sender<ConnId>,
    },

    Unregister {
        conn: ConnId,
    },

    Subscribe {
        conn: ConnId,
        channel: String,
        res_tx: oneshot::Sender<Result<(), SubscribeError>>,
    },

    Unsubscribe {
        conn: ConnId,
        channel: String,
        res_tx: oneshot::Sender<()>,
    },

    Publish {
        channel: String,
        body: Value,
        res_tx: oneshot::Sender<usize>,
    },

    Stats {
        res_tx: oneshot::Sender<Stats>,
    },

    FindToken {
        token: String,
        res_tx: oneshot::Sender<Option<(ConnId, Arc<LongpollSession>)>>,
    },
}

/// The coordinator owning every connection and subscription table.
///
/// Call and spawn [`run`](Self::run) to start processing commands.
#[derive(Debug)]
pub struct Hub {
    config: Arc<ServerConfig>,

    /// Live connections.
    sessions: HashMap<ConnId, ConnectionHandle>,

    /// Auth data captured at registration, input to the subscribe policy.
    auth: HashMap<ConnId, Message>,

    /// Channel name to the set of subscribed connections.
    channels: HashMap<String, HashSet<ConnId>>,

    /// Long-poll token to connection index.
    tokens: HashMap<String, ConnId>,

    /// Command receiver.
    cmd_rx: mpsc::UnboundedReceiver<Command>,

    token: CancellationToken,
}

impl Hub {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> (Self, HubHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        (
            Self {
                config,
                sessions: HashMap::new(),
                auth: HashMap::new(),
                channels: HashMap::new(),
                tokens: HashMap::new(),
                cmd_rx,
                token: token.clone(),
            },
            HubHandle { cmd_tx, token },
        )
    }

    /// Register a connection after successful auth.
    ///
    /// Registering a long-poll token that is already live returns the
    /// existing connection id, so a reattach cannot duplicate state.
    fn register(&mut self, conn: ConnectionHandle, auth: Message) -> ConnId {
        if let Some(token) = conn.token() {
            if let Some(existing) = self.tokens.get(token) {
                log::debug!("token {token} already registered as {existing}");
                return *existing;
            }
        }

        let mut id = thread_rng().gen::<ConnId>();
        while self.sessions.contains_key(&id) {
            id = thread_rng().gen::<ConnId>();
        }

        if let Some(token) = conn.token() {
            self.tokens.insert(token.to_string(), id);
        }
        self.sessions.insert(id, conn);
        self.auth.insert(id, auth);

        log::debug!("connection {id} registered ({} live)", self.sessions.len());

        id
    }

    /// Remove a connection and all of its subscriptions.
    fn unregister(&mut self, conn: ConnId) {
        let Some(handle) = self.sessions.remove(&conn) else {
            return;
        };

        if let Some(token) = handle.token() {
            self.tokens.remove(token);
        }
        self.auth.remove(&conn);
        self.channels.retain(|_, subscribers| {
            subscribers.remove(&conn);
            !subscribers.is_empty()
        });

        log::debug!("connection {conn} unregistered ({} live)", self.sessions.len());
    }

    fn subscribe(&mut self, conn: ConnId, channel: &str) -> Result<(), SubscribeError> {
        if !self.sessions.contains_key(&conn) {
            return Err(SubscribeError::Refused);
        }

        if let Some(can_subscribe) = &self.config.can_subscribe {
            let auth = self.auth.get(&conn).cloned().unwrap_or_default();
            if !can_subscribe(&auth, channel) {
                return Err(SubscribeError::Refused);
            }
        }

        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn);

        Ok(())
    }

    fn unsubscribe(&mut self, conn: ConnId, channel: &str) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(&conn);
            if subscribers.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    /// Deliver `body` to every current subscriber of `channel`.
    fn publish(&self, channel: &str, body: &Value) -> usize {
        let Some(subscribers) = self.channels.get(channel) else {
            return 0;
        };

        let mut delivered = 0;
        for conn in subscribers {
            if let Some(handle) = self.sessions.get(conn) {
                handle.send(channel, body);
                delivered += 1;
            }
        }

        log::trace!("published to {delivered} subscriber(s) of {channel}");

        delivered
    }

    fn stats(&self) -> Stats {
        Stats {
            connections: self.sessions.len(),
            local_subscriptions: self
                .channels
                .iter()
                .map(|(channel, subscribers)| (channel.clone(), subscribers.len()))
                .collect(),
        }
    }

    fn find_token(&self, token: &str) -> Option<(ConnId, Arc<LongpollSession>)> {
        let conn = *self.tokens.get(token)?;
        let session = self.sessions.get(&conn)?.longpoll_session()?;
        Some((conn, session))
    }

    /// Drop long-poll connections that have gone idle past the expiry.
    fn expire_idle_sessions(&mut self) {
        let expiry = self.config.session_expiry;
        let expired = self
            .sessions
            .iter()
            .filter_map(|(conn, handle)| {
                let session = handle.longpoll_session()?;
                (session.idle_for() > expiry).then_some((*conn, session))
            })
            .collect::<Vec<_>>();

        for (conn, session) in expired {
            log::debug!("expiring idle long-poll connection {conn}");
            session.close();
            self.unregister(conn);
        }
    }

    fn process_command(&mut self, cmd: Command) {
        match cmd {
            Command::Register { conn, auth, res_tx } => {
                let id = self.register(conn, auth);
                if res_tx.send(id).is_err() {
                    log::error!("failed to respond to Register command");
                }
            }

            Command::Unregister { conn } => self.unregister(conn),

            Command::Subscribe {
                conn,
                channel,
                res_tx,
            } => {
                let result = self.subscribe(conn, &channel);
                let _ = res_tx.send(result);
            }

            Command::Unsubscribe {
                conn,
                channel,
                res_tx,
            } => {
                self.unsubscribe(conn, &channel);
                let _ = res_tx.send(());
            }

            Command::Publish {
                channel,
                body,
                res_tx,
            } => {
                let delivered = self.publish(&channel, &body);
                let _ = res_tx.send(delivered);
            }

            Command::Stats { res_tx } => {
                let _ = res_tx.send(self.stats());
            }

            Command::FindToken { token, res_tx } => {
                let _ = res_tx.send(self.find_token(&token));
            }
        }
    }

    /// Close every connection on the way out.
    fn close_all(&mut self) {
        for (conn, handle) in self.sessions.drain() {
            log::debug!("closing connection {conn}");
            handle.close(CLOSE_GOING_AWAY, "Server shutting down");
        }
        self.auth.clear();
        self.channels.clear();
        self.tokens.clear();
    }

    /// Process commands until cancelled or every handle is dropped.
    pub async fn run(mut self) {
        let token = self.token.clone();

        let sweep_every = (self.config.session_expiry / 2).max(Duration::from_secs(1));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        sweep.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    log::debug!("hub was cancelled");
                    break;
                }
                _ = sweep.tick() => self.expire_idle_sessions(),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        log::trace!("received hub command: {cmd:?}");
                        self.process_command(cmd);
                    }
                    None => break,
                },
            }
        }

        self.close_all();
        self.cmd_rx.close();

        log::debug!("hub stopped");
    }
}

/// Handle and command sender for the hub.
///
/// Reduces boilerplate of setting up response channels in the transport
/// handlers. Every operation fails with [`HubError::Closed`] once the hub
/// has stopped.
#[derive(Debug, Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
}

impl HubHandle {
    async fn request<T>(
        &self,
        cmd: Command,
        res_rx: oneshot::Receiver<T>,
    ) -> Result<T, HubError> {
        self.cmd_tx.send(cmd).map_err(|_| HubError::Closed)?;
        res_rx.await.map_err(|_| HubError::Closed)
    }

    /// Register a connection and obtain its id.
    ///
    /// # Errors
    ///
    /// * [`HubError::Closed`] if the hub has stopped
    pub async fn register(
        &self,
        conn: ConnectionHandle,
        auth: Message,
    ) -> Result<ConnId, HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.request(Command::Register { conn, auth, res_tx }, res_rx)
            .await
    }

    /// Remove a connection and all its subscriptions.
    pub fn unregister(&self, conn: ConnId) {
        // a closed hub has already dropped every connection
        let _ = self.cmd_tx.send(Command::Unregister { conn });
    }

    /// Add a subscription.
    ///
    /// # Errors
    ///
    /// * [`HubError::Subscribe`] if the subscribe policy refuses the channel
    /// * [`HubError::Closed`] if the hub has stopped
    pub async fn subscribe(&self, conn: ConnId, channel: &str) -> Result<(), HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.request(
            Command::Subscribe {
                conn,
                channel: channel.to_string(),
                res_tx,
            },
            res_rx,
        )
        .await??;
        Ok(())
    }

    /// Remove a subscription. Succeeds whether or not it existed.
    ///
    /// # Errors
    ///
    /// * [`HubError::Closed`] if the hub has stopped
    pub async fn unsubscribe(&self, conn: ConnId, channel: &str) -> Result<(), HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.request(
            Command::Unsubscribe {
                conn,
                channel: channel.to_string(),
                res_tx,
            },
            res_rx,
        )
        .await
    }

    /// Deliver `body` to every current subscriber of `channel`, in
    /// publication order. Completes once the fan-out has been dispatched.
    ///
    /// # Errors
    ///
    /// * [`HubError::Closed`] if the hub has stopped
    pub async fn publish(&self, channel: &str, body: Value) -> Result<usize, HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.request(
            Command::Publish {
                channel: channel.to_string(),
                body,
                res_tx,
            },
            res_rx,
        )
        .await
    }

    /// Snapshot the hub tables at a single point in the command stream.
    ///
    /// # Errors
    ///
    /// * [`HubError::Closed`] if the hub has stopped
    pub async fn stats(&self) -> Result<Stats, HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.request(Command::Stats { res_tx }, res_rx).await
    }

    /// Locate a live long-poll connection by its token.
    ///
    /// # Errors
    ///
    /// * [`HubError::Closed`] if the hub has stopped
    pub async fn find_token(
        &self,
        token: &str,
    ) -> Result<Option<(ConnId, Arc<LongpollSession>)>, HubError> {
        let (res_tx, res_rx) = oneshot::channel();
        self.request(
            Command::FindToken {
                token: token.to_string(),
                res_tx,
            },
            res_rx,
        )
        .await
    }

    /// Stop the hub; it closes every connection and drains.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::seq::SliceRandom as _;
    use serde_json::json;
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::connection::SocketFrame;

    fn spawn_hub(config: ServerConfig) -> HubHandle {
        let (hub, handle) = Hub::new(Arc::new(config));
        tokio::spawn(hub.run());
        handle
    }

    async fn register_socket(
        hub: &HubHandle,
    ) -> (ConnId, mpsc::UnboundedReceiver<SocketFrame>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let conn = hub
            .register(ConnectionHandle::socket(frame_tx), Message::new())
            .await
            .unwrap();
        (conn, frame_rx)
    }

    fn received_bodies(frame_rx: &mut mpsc::UnboundedReceiver<SocketFrame>) -> Vec<Value> {
        let mut bodies = vec![];
        while let Ok(frame) = frame_rx.try_recv() {
            let SocketFrame::Text(text) = frame else {
                continue;
            };
            let message = serde_json::from_str::<Message>(&text).unwrap();
            bodies.push(message.body().unwrap().clone());
        }
        bodies
    }

    #[test_log::test(tokio::test)]
    async fn register_and_unregister_track_connection_count() {
        let hub = spawn_hub(ServerConfig::default());

        let (conn, _frame_rx) = register_socket(&hub).await;
        assert_eq!(hub.stats().await.unwrap().connections, 1);

        hub.unregister(conn);
        assert_eq!(hub.stats().await.unwrap().connections, 0);
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_subscribe_counts_once() {
        let hub = spawn_hub(ServerConfig::default());
        let (conn, _frame_rx) = register_socket(&hub).await;

        hub.subscribe(conn, "test").await.unwrap();
        hub.subscribe(conn, "test").await.unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.local_subscriptions.get("test"), Some(&1));
    }

    #[test_log::test(tokio::test)]
    async fn unsubscribe_is_idempotent() {
        let hub = spawn_hub(ServerConfig::default());
        let (conn, _frame_rx) = register_socket(&hub).await;

        hub.unsubscribe(conn, "test").await.unwrap();

        hub.subscribe(conn, "test").await.unwrap();
        hub.unsubscribe(conn, "test").await.unwrap();
        hub.unsubscribe(conn, "test").await.unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.local_subscriptions.get("test"), None);
        assert_eq!(stats.connections, 1);
    }

    #[test_log::test(tokio::test)]
    async fn subscription_count_stays_zero_or_one_over_random_sequences() {
        let hub = spawn_hub(ServerConfig::default());
        let (conn, _frame_rx) = register_socket(&hub).await;

        let mut rng = thread_rng();
        let mut subscribed = false;
        for _ in 0..200 {
            if *[true, false].choose(&mut rng).unwrap() {
                hub.subscribe(conn, "test").await.unwrap();
                subscribed = true;
            } else {
                hub.unsubscribe(conn, "test").await.unwrap();
                subscribed = false;
            }

            let count = hub
                .stats()
                .await
                .unwrap()
                .local_subscriptions
                .get("test")
                .copied()
                .unwrap_or(0);
            assert_eq!(count, usize::from(subscribed));
        }
    }

    #[test_log::test(tokio::test)]
    async fn publish_reaches_every_subscriber_exactly_once() {
        let hub = spawn_hub(ServerConfig::default());
        let (conn_a, mut frames_a) = register_socket(&hub).await;
        let (conn_b, mut frames_b) = register_socket(&hub).await;

        hub.subscribe(conn_a, "test").await.unwrap();
        hub.subscribe(conn_b, "test").await.unwrap();

        let delivered = hub.publish("test", json!("Test message")).await.unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(received_bodies(&mut frames_a), vec![json!("Test message")]);
        assert_eq!(received_bodies(&mut frames_b), vec![json!("Test message")]);
    }

    #[test_log::test(tokio::test)]
    async fn publish_does_not_cross_channels() {
        let hub = spawn_hub(ServerConfig::default());
        let (conn, mut frame_rx) = register_socket(&hub).await;

        hub.subscribe(conn, "test").await.unwrap();

        hub.publish("other", json!("Test message")).await.unwrap();
        hub.publish("test", json!("Test message")).await.unwrap();

        assert_eq!(received_bodies(&mut frame_rx), vec![json!("Test message")]);
    }

    #[test_log::test(tokio::test)]
    async fn publications_arrive_in_publish_order() {
        let hub = spawn_hub(ServerConfig::default());
        let (conn, mut frame_rx) = register_socket(&hub).await;

        hub.subscribe(conn, "test").await.unwrap();

        for n in 0..50 {
            hub.publish("test", json!(n)).await.unwrap();
        }

        let expected = (0..50).map(|n| json!(n)).collect::<Vec<_>>();
        assert_eq!(received_bodies(&mut frame_rx), expected);
    }

    #[test_log::test(tokio::test)]
    async fn unregister_clears_every_subscription() {
        let hub = spawn_hub(ServerConfig::default());
        let (conn, _frame_rx) = register_socket(&hub).await;

        hub.subscribe(conn, "test").await.unwrap();
        hub.subscribe(conn, "other").await.unwrap();

        hub.unregister(conn);

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.local_subscriptions.get("test"), None);
        assert_eq!(stats.local_subscriptions.get("other"), None);
    }

    #[test_log::test(tokio::test)]
    async fn refused_subscribe_leaves_no_state() {
        let hub = spawn_hub(ServerConfig {
            can_subscribe: Some(Arc::new(|_, _| false)),
            ..ServerConfig::default()
        });
        let (conn, _frame_rx) = register_socket(&hub).await;

        let err = hub.subscribe(conn, "test").await.unwrap_err();
        assert_eq!(err.to_string(), "Channel refused");

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.local_subscriptions.get("test"), None);
    }

    #[test_log::test(tokio::test)]
    async fn subscribe_policy_sees_registered_auth_data() {
        let hub = spawn_hub(ServerConfig {
            can_subscribe: Some(Arc::new(|auth, channel| {
                auth.str_field("role") == Some("admin") || channel == "public"
            })),
            ..ServerConfig::default()
        });

        let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
        let conn = hub
            .register(
                ConnectionHandle::socket(frame_tx),
                Message::new().with("role", "guest"),
            )
            .await
            .unwrap();

        assert!(hub.subscribe(conn, "public").await.is_ok());
        assert!(hub.subscribe(conn, "private").await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn subscribe_from_unknown_connection_is_refused() {
        let hub = spawn_hub(ServerConfig::default());

        let err = hub.subscribe(12345, "test").await.unwrap_err();
        assert_eq!(err.to_string(), "Channel refused");
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_longpoll_token_registers_once() {
        let hub = spawn_hub(ServerConfig::default());

        let session = Arc::new(LongpollSession::new("token-1".to_string(), 10));
        let first = hub
            .register(ConnectionHandle::longpoll(session.clone()), Message::new())
            .await
            .unwrap();
        let second = hub
            .register(ConnectionHandle::longpoll(session), Message::new())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(hub.stats().await.unwrap().connections, 1);
    }

    #[test_log::test(tokio::test)]
    async fn find_token_locates_live_longpoll_connections() {
        let hub = spawn_hub(ServerConfig::default());

        let session = Arc::new(LongpollSession::new("token-2".to_string(), 10));
        let conn = hub
            .register(ConnectionHandle::longpoll(session), Message::new())
            .await
            .unwrap();

        let (found, _session) = hub.find_token("token-2").await.unwrap().unwrap();
        assert_eq!(found, conn);

        assert!(hub.find_token("missing").await.unwrap().is_none());

        hub.unregister(conn);
        assert!(hub.find_token("token-2").await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_closes_connections_and_fails_later_commands() {
        let hub = spawn_hub(ServerConfig::default());
        let (_conn, mut frame_rx) = register_socket(&hub).await;

        hub.shutdown();

        let frame = frame_rx.recv().await.unwrap();
        assert_eq!(
            frame,
            SocketFrame::Close {
                code: 1001,
                reason: "Server shutting down".to_string(),
            }
        );

        let result = hub.stats().await;
        assert!(matches!(result, Err(HubError::Closed)));
    }

    #[test_log::test(tokio::test)]
    async fn idle_longpoll_sessions_expire() {
        let hub = spawn_hub(ServerConfig {
            session_expiry: Duration::from_millis(50),
            ..ServerConfig::default()
        });

        let session = Arc::new(LongpollSession::new("token-3".to_string(), 10));
        let _conn = hub
            .register(ConnectionHandle::longpoll(session.clone()), Message::new())
            .await
            .unwrap();
        assert_eq!(hub.stats().await.unwrap().connections, 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert_eq!(hub.stats().await.unwrap().connections, 0);
        assert!(session.is_closed());
    }

    #[test_log::test(tokio::test)]
    async fn send_to_gone_socket_still_counts_other_subscribers() {
        let hub = spawn_hub(ServerConfig::default());
        let (conn_a, frames_a) = register_socket(&hub).await;
        let (conn_b, mut frames_b) = register_socket(&hub).await;

        hub.subscribe(conn_a, "test").await.unwrap();
        hub.subscribe(conn_b, "test").await.unwrap();

        // handler task gone, unregister not yet processed
        drop(frames_a);

        hub.publish("test", json!("Test message")).await.unwrap();
        assert_eq!(received_bodies(&mut frames_b), vec![json!("Test message")]);

        assert!(matches!(frames_b.try_recv(), Err(TryRecvError::Empty)));
    }
}
