//! Real-time broadcast server.
//!
//! Delivers published messages on named channels to authenticated
//! subscribers, over two concurrent transports sharing one server model: a
//! persistent websocket and an HTTP long-poll emulation of it. Every locally
//! connected subscriber of a channel receives each publication exactly once,
//! in publication order.
//!
//! # Main components
//!
//! * [`Hub`] - single-writer coordinator owning all connection and
//!   subscription state
//! * [`BroadcastServer`] - façade tying the hub to its configuration;
//!   exposes [`BroadcastServer::publish`] and [`BroadcastServer::stats`]
//! * [`api::configure`] - mounts the HTTP entry point on an actix app
//! * [`models`] - the shared wire message model
//!
//! # Example
//!
//! ```rust,no_run
//! use actix_web::{web, App, HttpServer};
//! use broadcaster::{BroadcastServer, ServerConfig};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let (server, hub) = BroadcastServer::new(ServerConfig::default());
//!     tokio::spawn(hub.run());
//!
//!     let data = web::Data::new(server);
//!     HttpServer::new(move || {
//!         App::new()
//!             .app_data(data.clone())
//!             .configure(broadcaster::api::configure)
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod api;
pub mod connection;
pub mod hub;
pub mod longpoll;
pub mod models;
pub mod server;
pub mod ws;

pub use connection::{ConnId, ConnectionHandle, LongpollSession, SocketFrame};
pub use hub::{Hub, HubError, HubHandle, SubscribeError};
pub use models::{
    broadcast_message, Message, MessageType, Stats, LONGPOLL_TYPE_KEY, SOCKET_TYPE_KEY, TOKEN_KEY,
};
pub use server::{BroadcastServer, ConnectPredicate, ServerConfig, SubscribePredicate};
