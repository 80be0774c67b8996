//! Long-poll transport, server side.
//!
//! A stateless HTTP transport emulating a persistent subscriber. Each
//! logical connection is keyed by an opaque token minted at handshake;
//! commands arrive as single JSON objects and every reply body is a JSON
//! array. Pending publications sit in the session's bounded outbox until the
//! next poll drains them.

use std::sync::Arc;

use actix_web::HttpResponse;
use uuid::Uuid;

use crate::connection::{ConnId, ConnectionHandle, LongpollSession};
use crate::hub::HubError;
use crate::models::{Message, MessageType, LONGPOLL_TYPE_KEY, TOKEN_KEY};
use crate::server::BroadcastServer;

fn auth_failed(reason: &str) -> Message {
    Message::of_type(MessageType::AuthFailed, LONGPOLL_TYPE_KEY).with("reason", reason)
}

fn reply(messages: Vec<Message>) -> HttpResponse {
    HttpResponse::Ok().json(messages)
}

fn shutting_down() -> HttpResponse {
    HttpResponse::ServiceUnavailable().body("Server shutting down")
}

/// Route a command request: token holders dispatch on their connection,
/// everything else goes through the handshake gates.
pub async fn handle_message(server: &BroadcastServer, message: Message) -> HttpResponse {
    if let Some(token) = message.token() {
        match server.hub().find_token(token).await {
            Ok(Some((conn, session))) => {
                return handle_command(server, conn, &session, &message).await;
            }
            // unknown or expired token: same path as a fresh client
            Ok(None) => {}
            Err(_) => return shutting_down(),
        }
    }

    handshake(server, message).await
}

/// Authenticate and mint a token for a new logical connection.
async fn handshake(server: &BroadcastServer, auth: Message) -> HttpResponse {
    // Expect an auth message first.
    if auth.type_of(LONGPOLL_TYPE_KEY) != MessageType::Auth {
        return HttpResponse::Unauthorized().json(vec![auth_failed("Auth expected")]);
    }

    if !server.config().allows_connect(&auth) {
        return HttpResponse::Unauthorized().json(vec![auth_failed("Unauthorized")]);
    }

    let session = Arc::new(LongpollSession::new(
        Uuid::new_v4().to_string(),
        server.config().outbox_capacity,
    ));
    let token = session.token().to_string();

    match server
        .hub()
        .register(ConnectionHandle::longpoll(session), auth)
        .await
    {
        Ok(conn) => log::debug!("long-poll connection id: {conn} token: {token}"),
        Err(_) => return shutting_down(),
    }

    reply(vec![
        Message::of_type(MessageType::AuthOk, LONGPOLL_TYPE_KEY).with(TOKEN_KEY, token),
    ])
}

/// Dispatch an authenticated command, replying on the same HTTP response.
async fn handle_command(
    server: &BroadcastServer,
    conn: ConnId,
    session: &LongpollSession,
    message: &Message,
) -> HttpResponse {
    session.touch();

    match message.type_of(LONGPOLL_TYPE_KEY) {
        MessageType::Subscribe => {
            let Some(channel) = message.channel() else {
                return HttpResponse::BadRequest().body("Missing channel");
            };

            match server.hub().subscribe(conn, channel).await {
                Ok(()) => reply(vec![
                    Message::of_type(MessageType::SubscribeOk, LONGPOLL_TYPE_KEY)
                        .with("channel", channel),
                ]),
                Err(HubError::Subscribe(err)) => reply(vec![
                    Message::of_type(MessageType::SubscribeError, LONGPOLL_TYPE_KEY)
                        .with("channel", channel)
                        .with("error", err.to_string()),
                ]),
                Err(HubError::Closed) => shutting_down(),
            }
        }

        MessageType::Unsubscribe => {
            let Some(channel) = message.channel() else {
                return HttpResponse::BadRequest().body("Missing channel");
            };

            match server.hub().unsubscribe(conn, channel).await {
                Ok(()) => reply(vec![
                    Message::of_type(MessageType::UnsubscribeOk, LONGPOLL_TYPE_KEY)
                        .with("channel", channel),
                ]),
                Err(_) => shutting_down(),
            }
        }

        _ => HttpResponse::BadRequest().body("Unexpected message"),
    }
}

/// Drain the pending outbox for `token`, holding the request open until a
/// message arrives or the poll timeout elapses. Always replies with a JSON
/// array.
pub async fn poll(server: &BroadcastServer, token: &str) -> HttpResponse {
    let found = match server.hub().find_token(token).await {
        Ok(found) => found,
        Err(_) => return shutting_down(),
    };

    let Some((conn, session)) = found else {
        return HttpResponse::Unauthorized().json(vec![auth_failed("Unauthorized")]);
    };

    log::trace!("polling connection {conn}");
    session.touch();

    let hold = tokio::time::sleep(server.config().poll_timeout);
    tokio::pin!(hold);

    loop {
        let wakeup = session.wait();

        let batch = session.drain();
        if !batch.is_empty() || session.is_closed() {
            return reply(batch);
        }

        tokio::select! {
            () = &mut hold => return reply(vec![]),
            () = wakeup => {}
        }
    }
}
