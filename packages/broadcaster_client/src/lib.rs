//! Client library for the broadcast server.
//!
//! A [`Client`] is parameterized by a [`Transport`]: the persistent socket
//! transport ([`socket::SocketTransport`]) or the HTTP long-poll transport
//! ([`longpoll::LongpollTransport`]). Both behave identically at this level;
//! the transport owns its wire discriminator key and any transport metadata
//! (the long-poll token).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), broadcaster_client::ClientError> {
//! use broadcaster_client::{Client, ConnectOptions};
//!
//! let mut client = Client::connect_socket(
//!     "ws://127.0.0.1:8080/",
//!     ConnectOptions::default(),
//! )
//! .await?;
//!
//! client.subscribe("news").await?;
//! let message = client.recv().await?;
//! println!("{:?}", message.body());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod longpoll;
pub mod socket;

use std::collections::VecDeque;

use async_trait::async_trait;
use broadcaster::models::{Message, MessageType};
use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection closed")]
    Closed,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Client-level failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server refused the connection.
    #[error("Auth error: {0}")]
    Auth(String),
    /// The server refused a subscription.
    #[error("Subscribe error: {0}")]
    Subscribe(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A client transport: socket or long-poll.
///
/// `connect` applies the transport's auth envelope; `send` attaches any
/// transport metadata (the long-poll token); `receive` yields complete wire
/// messages in arrival order.
#[async_trait]
pub trait Transport: Send {
    /// Wire key carrying the type discriminator on this transport.
    fn type_key(&self) -> &'static str;

    async fn connect(&mut self, auth: Option<Message>) -> Result<(), TransportError>;

    async fn send(&mut self, message: Message) -> Result<(), TransportError>;

    async fn receive(&mut self) -> Result<Message, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Connection options.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Free-form auth data sent with the handshake.
    pub auth_data: Message,

    /// Suppress the auth envelope entirely. Used to verify that the server
    /// refuses unauthenticated commands.
    pub skip_auth: bool,
}

/// A connected subscriber.
pub struct Client {
    transport: Box<dyn Transport>,
    /// Publications received while waiting for a command reply.
    pending: VecDeque<Message>,
}

impl Client {
    /// Connect over the persistent socket transport.
    ///
    /// # Errors
    ///
    /// * [`ClientError::Auth`] if the server refuses the connection
    /// * [`ClientError::Transport`] on connection failures
    pub async fn connect_socket(
        url: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<Self, ClientError> {
        Self::connect_with(socket::SocketTransport::new(url), options).await
    }

    /// Connect over the HTTP long-poll transport.
    ///
    /// # Errors
    ///
    /// * [`ClientError::Auth`] if the server refuses the connection
    /// * [`ClientError::Transport`] on connection failures
    pub async fn connect_longpoll(
        url: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<Self, ClientError> {
        Self::connect_with(longpoll::LongpollTransport::new(url), options).await
    }

    /// Connect over any transport.
    ///
    /// # Errors
    ///
    /// * [`ClientError::Auth`] if the server refuses the connection
    /// * [`ClientError::Transport`] on connection failures
    pub async fn connect_with(
        transport: impl Transport + 'static,
        options: ConnectOptions,
    ) -> Result<Self, ClientError> {
        let mut client = Self {
            transport: Box::new(transport),
            pending: VecDeque::new(),
        };

        if options.skip_auth {
            client.transport.connect(None).await?;
            return Ok(client);
        }

        client.transport.connect(Some(options.auth_data)).await?;

        let reply = client.transport.receive().await?;
        match reply.type_of(client.transport.type_key()) {
            MessageType::AuthOk => Ok(client),
            MessageType::AuthFailed => Err(ClientError::Auth(
                reply.reason().unwrap_or("Unknown").to_string(),
            )),
            _ => Err(ClientError::Auth("Unexpected reply".to_string())),
        }
    }

    /// The wire discriminator key of the underlying transport.
    #[must_use]
    pub fn type_key(&self) -> &'static str {
        self.transport.type_key()
    }

    /// Subscribe to `channel`, waiting for the server's reply. Publications
    /// arriving in the meantime are buffered for [`recv`](Self::recv).
    ///
    /// # Errors
    ///
    /// * [`ClientError::Subscribe`] if the server refuses the channel
    /// * [`ClientError::Auth`] if the server refused the connection
    /// * [`ClientError::Transport`] on connection failures
    pub async fn subscribe(&mut self, channel: &str) -> Result<(), ClientError> {
        let key = self.transport.type_key();
        let command = Message::of_type(MessageType::Subscribe, key).with("channel", channel);
        self.transport.send(command).await?;

        loop {
            let reply = self.transport.receive().await?;
            match reply.type_of(key) {
                MessageType::Message => self.pending.push_back(reply),
                MessageType::SubscribeOk if reply.channel() == Some(channel) => return Ok(()),
                MessageType::SubscribeError if reply.channel() == Some(channel) => {
                    return Err(ClientError::Subscribe(
                        reply.error().unwrap_or("Unknown").to_string(),
                    ));
                }
                MessageType::AuthFailed => {
                    return Err(ClientError::Auth(
                        reply.reason().unwrap_or("Unknown").to_string(),
                    ));
                }
                other => log::debug!("ignoring {other} frame while awaiting subscribe reply"),
            }
        }
    }

    /// Unsubscribe from `channel`. Succeeds whether or not a subscription
    /// existed.
    ///
    /// # Errors
    ///
    /// * [`ClientError::Auth`] if the server refused the connection
    /// * [`ClientError::Transport`] on connection failures
    pub async fn unsubscribe(&mut self, channel: &str) -> Result<(), ClientError> {
        let key = self.transport.type_key();
        let command = Message::of_type(MessageType::Unsubscribe, key).with("channel", channel);
        self.transport.send(command).await?;

        loop {
            let reply = self.transport.receive().await?;
            match reply.type_of(key) {
                MessageType::Message => self.pending.push_back(reply),
                MessageType::UnsubscribeOk if reply.channel() == Some(channel) => return Ok(()),
                MessageType::AuthFailed => {
                    return Err(ClientError::Auth(
                        reply.reason().unwrap_or("Unknown").to_string(),
                    ));
                }
                other => log::debug!("ignoring {other} frame while awaiting unsubscribe reply"),
            }
        }
    }

    /// The next publication, in delivery order.
    ///
    /// # Errors
    ///
    /// * [`ClientError::Transport`] once the connection has closed
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(message);
            }

            let message = self.transport.receive().await?;
            if message.type_of(self.transport.type_key()) == MessageType::Message {
                return Ok(message);
            }

            log::debug!("ignoring non-publication frame");
        }
    }

    /// Send a command of arbitrary `kind` with no reply correlation.
    /// Protocol-testing escape hatch.
    ///
    /// # Errors
    ///
    /// * [`ClientError::Transport`] on connection failures
    pub async fn send_raw(&mut self, kind: &str, fields: Option<Message>) -> Result<(), ClientError> {
        let mut message = fields.unwrap_or_default();
        message.insert(self.transport.type_key(), kind);
        self.transport.send(message).await?;
        Ok(())
    }

    /// The next frame of any type, bypassing the publication buffer.
    /// Protocol-testing escape hatch.
    ///
    /// # Errors
    ///
    /// * [`ClientError::Transport`] once the connection has closed
    pub async fn recv_raw(&mut self) -> Result<Message, ClientError> {
        Ok(self.transport.receive().await?)
    }

    /// Close the transport. Terminal.
    pub async fn disconnect(mut self) {
        if let Err(err) = self.transport.close().await {
            log::debug!("error closing transport: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use broadcaster::models::SOCKET_TYPE_KEY;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    /// Scripted transport: replays canned frames, records sends.
    struct MockTransport {
        replies: VecDeque<Message>,
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl MockTransport {
        fn new(replies: Vec<Message>) -> (Self, Arc<Mutex<Vec<Message>>>) {
            let sent = Arc::new(Mutex::new(vec![]));
            (
                Self {
                    replies: replies.into(),
                    sent: sent.clone(),
                },
                sent,
            )
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn type_key(&self) -> &'static str {
            SOCKET_TYPE_KEY
        }

        async fn connect(&mut self, auth: Option<Message>) -> Result<(), TransportError> {
            if let Some(mut auth) = auth {
                auth.insert(SOCKET_TYPE_KEY, MessageType::Auth.as_str());
                self.sent.lock().unwrap().push(auth);
            }
            Ok(())
        }

        async fn send(&mut self, message: Message) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Message, TransportError> {
            self.replies.pop_front().ok_or(TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn of_type(kind: MessageType) -> Message {
        Message::of_type(kind, SOCKET_TYPE_KEY)
    }

    #[test_log::test(tokio::test)]
    async fn connect_sends_auth_envelope() {
        let (transport, sent) = MockTransport::new(vec![of_type(MessageType::AuthOk)]);

        let options = ConnectOptions {
            auth_data: Message::new().with("token", "abcdefg"),
            ..ConnectOptions::default()
        };
        Client::connect_with(transport, options).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].type_of(SOCKET_TYPE_KEY), MessageType::Auth);
        assert_eq!(sent[0].str_field("token"), Some("abcdefg"));
    }

    #[test_log::test(tokio::test)]
    async fn skip_auth_sends_nothing() {
        let (transport, sent) = MockTransport::new(vec![]);

        let options = ConnectOptions {
            skip_auth: true,
            ..ConnectOptions::default()
        };
        Client::connect_with(transport, options).await.unwrap();

        assert!(sent.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn refused_connect_surfaces_the_reason() {
        let (transport, _sent) =
            MockTransport::new(vec![of_type(MessageType::AuthFailed).with("reason", "Unauthorized")]);

        let err = Client::connect_with(transport, ConnectOptions::default())
            .await
            .err()
            .unwrap();

        assert_eq!(err.to_string(), "Auth error: Unauthorized");
    }

    #[test_log::test(tokio::test)]
    async fn subscribe_buffers_publications_that_race_the_reply() {
        let (transport, _sent) = MockTransport::new(vec![
            of_type(MessageType::AuthOk),
            of_type(MessageType::Message)
                .with("channel", "test")
                .with("body", "early"),
            of_type(MessageType::SubscribeOk).with("channel", "test"),
            of_type(MessageType::Message)
                .with("channel", "test")
                .with("body", "late"),
        ]);

        let mut client = Client::connect_with(transport, ConnectOptions::default())
            .await
            .unwrap();
        client.subscribe("test").await.unwrap();

        assert_eq!(client.recv().await.unwrap().body(), Some(&json!("early")));
        assert_eq!(client.recv().await.unwrap().body(), Some(&json!("late")));
    }

    #[test_log::test(tokio::test)]
    async fn refused_subscribe_surfaces_the_error() {
        let (transport, _sent) = MockTransport::new(vec![
            of_type(MessageType::AuthOk),
            of_type(MessageType::SubscribeError)
                .with("channel", "test")
                .with("error", "Channel refused"),
        ]);

        let mut client = Client::connect_with(transport, ConnectOptions::default())
            .await
            .unwrap();
        let err = client.subscribe("test").await.err().unwrap();

        assert_eq!(err.to_string(), "Subscribe error: Channel refused");
    }

    #[test_log::test(tokio::test)]
    async fn unsubscribe_waits_for_matching_reply() {
        let (transport, sent) = MockTransport::new(vec![
            of_type(MessageType::AuthOk),
            of_type(MessageType::UnsubscribeOk).with("channel", "test"),
        ]);

        let mut client = Client::connect_with(transport, ConnectOptions::default())
            .await
            .unwrap();
        client.unsubscribe("test").await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[1].type_of(SOCKET_TYPE_KEY), MessageType::Unsubscribe);
        assert_eq!(sent[1].channel(), Some("test"));
    }
}
