//! Shared message model for the broadcast wire protocol.
//!
//! Both transports speak JSON objects with a reserved type discriminator.
//! The socket transport keys it under `type`; the long-poll transport keys it
//! under `__type` and reserves the `__` prefix for transport metadata
//! (`__token`). The divergence is part of the wire contract.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type discriminator key on the socket wire.
pub const SOCKET_TYPE_KEY: &str = "type";
/// Type discriminator key on the long-poll wire.
pub const LONGPOLL_TYPE_KEY: &str = "__type";
/// Connection token key on the long-poll wire.
pub const TOKEN_KEY: &str = "__token";

/// The recognized message kinds.
///
/// Any message carrying an unrecognized discriminator, or none at all, is
/// [`MessageType::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Auth,
    AuthOk,
    AuthFailed,
    Subscribe,
    SubscribeOk,
    SubscribeError,
    Unsubscribe,
    UnsubscribeOk,
    Message,
    Unknown,
}

impl MessageType {
    /// Wire name of this message kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthOk => "authOk",
            Self::AuthFailed => "authFailed",
            Self::Subscribe => "subscribe",
            Self::SubscribeOk => "subscribeOk",
            Self::SubscribeError => "subscribeError",
            Self::Unsubscribe => "unsubscribe",
            Self::UnsubscribeOk => "unsubscribeOk",
            Self::Message => "message",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a wire name, falling back to [`MessageType::Unknown`].
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "auth" => Self::Auth,
            "authOk" => Self::AuthOk,
            "authFailed" => Self::AuthFailed,
            "subscribe" => Self::Subscribe,
            "subscribeOk" => Self::SubscribeOk,
            "subscribeError" => Self::SubscribeError,
            "unsubscribe" => Self::Unsubscribe,
            "unsubscribeOk" => Self::UnsubscribeOk,
            "message" => Self::Message,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wire message: an unordered mapping from string keys to JSON values.
///
/// Free-form payload keys (`channel`, `body`, auth data) live beside the
/// transport's discriminator key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(pub Map<String, Value>);

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a message of `kind`, with the discriminator under `type_key`.
    #[must_use]
    pub fn of_type(kind: MessageType, type_key: &str) -> Self {
        let mut map = Map::new();
        map.insert(type_key.to_string(), Value::String(kind.as_str().to_string()));
        Self(map)
    }

    /// Classify this message by the discriminator under `type_key`.
    #[must_use]
    pub fn type_of(&self, type_key: &str) -> MessageType {
        self.0
            .get(type_key)
            .and_then(Value::as_str)
            .map_or(MessageType::Unknown, MessageType::from_name)
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.str_field("channel")
    }

    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.0.get("body")
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.str_field(TOKEN_KEY).filter(|token| !token.is_empty())
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.str_field("reason")
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.str_field("error")
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for Message {
    /// Renders the compact JSON encoding, the frame format of both wires.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

/// Build the publication frame delivered to subscribers.
#[must_use]
pub fn broadcast_message(type_key: &str, channel: &str, body: &Value) -> Message {
    Message::of_type(MessageType::Message, type_key)
        .with("channel", channel)
        .with("body", body.clone())
}

/// A read-only snapshot of the hub's tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Number of live connections.
    pub connections: usize,
    /// Count of connections subscribed to each channel.
    pub local_subscriptions: HashMap<String, usize>,
}
