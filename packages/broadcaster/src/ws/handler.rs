//! Socket connection handler.
//!
//! One task per connection. The select loop is the connection's single write
//! path: command replies and hub publications are both funneled through it,
//! so frames never interleave.

use actix_ws::{CloseCode, CloseReason, Message as WsMessage, MessageStream, Session};
use futures_util::StreamExt as _;
use serde_json::json;
use tokio::sync::mpsc;

use crate::connection::{ConnId, ConnectionHandle, SocketFrame};
use crate::hub::HubError;
use crate::models::{Message, MessageType, SOCKET_TYPE_KEY};
use crate::server::BroadcastServer;
use crate::ws::{CLOSE_BAD_MESSAGE, CLOSE_UNAUTHORIZED};

/// Drive one socket connection from handshake to teardown.
pub async fn handle_socket(
    server: BroadcastServer,
    mut session: Session,
    mut msg_stream: MessageStream,
) {
    log::debug!("socket connected");

    // Expect an auth message first.
    let auth = match read_auth(&mut session, &mut msg_stream).await {
        Some(auth) => auth,
        None => {
            refuse_auth(session, "Auth expected").await;
            return;
        }
    };

    if !server.config().allows_connect(&auth) {
        refuse_auth(session, "Unauthorized").await;
        return;
    }

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();

    // register before replying so stats observed after the handshake are exact
    let conn = match server
        .hub()
        .register(ConnectionHandle::socket(frame_tx), auth)
        .await
    {
        Ok(conn) => conn,
        Err(_) => {
            close(session, CLOSE_BAD_MESSAGE, "Server shutting down").await;
            return;
        }
    };

    log::debug!("socket connection id: {conn}");

    if session
        .text(json!({ "type": MessageType::AuthOk.as_str() }).to_string())
        .await
        .is_err()
    {
        server.hub().unregister(conn);
        return;
    }

    let close_with = loop {
        tokio::select! {
            frame = msg_stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<Message>(&text) {
                        Ok(message) => {
                            if let Some(reason) =
                                process_message(&server, conn, &mut session, &message).await
                            {
                                break Some(reason);
                            }
                        }
                        Err(err) => break Some((CLOSE_BAD_MESSAGE, err.to_string())),
                    }
                }

                Some(Ok(WsMessage::Binary(bytes))) => {
                    match serde_json::from_slice::<Message>(&bytes) {
                        Ok(message) => {
                            if let Some(reason) =
                                process_message(&server, conn, &mut session, &message).await
                            {
                                break Some(reason);
                            }
                        }
                        Err(err) => break Some((CLOSE_BAD_MESSAGE, err.to_string())),
                    }
                }

                Some(Ok(WsMessage::Ping(bytes))) => {
                    let _ = session.pong(&bytes).await;
                }

                Some(Ok(WsMessage::Pong(_))) => {}

                // client went away
                Some(Ok(WsMessage::Close(reason))) => {
                    log::debug!("socket {conn} closed by peer: {reason:?}");
                    break None;
                }

                Some(Ok(_)) => {}

                Some(Err(err)) => {
                    log::error!("socket {conn} stream error: {err}");
                    break Some((CLOSE_BAD_MESSAGE, err.to_string()));
                }

                None => break None,
            },

            frame = frame_rx.recv() => match frame {
                Some(SocketFrame::Text(text)) => {
                    if session.text(text).await.is_err() {
                        break None;
                    }
                }

                Some(SocketFrame::Close { code, reason }) => break Some((code, reason)),

                // hub dropped our sender
                None => break None,
            },
        }
    };

    server.hub().unregister(conn);

    match close_with {
        Some((code, reason)) => close(session, code, &reason).await,
        None => {
            let _ = session.close(None).await;
        }
    }
}

/// Read frames until the first parseable message; return it only if it is an
/// auth message.
async fn read_auth(session: &mut Session, msg_stream: &mut MessageStream) -> Option<Message> {
    let message = loop {
        match msg_stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                break serde_json::from_str::<Message>(&text).ok()
            }
            Some(Ok(WsMessage::Binary(bytes))) => {
                break serde_json::from_slice::<Message>(&bytes).ok()
            }
            Some(Ok(WsMessage::Ping(bytes))) => {
                let _ = session.pong(&bytes).await;
            }
            Some(Ok(WsMessage::Pong(_))) => {}
            Some(Ok(_)) | Some(Err(_)) | None => break None,
        }
    };

    message.filter(|message| message.type_of(SOCKET_TYPE_KEY) == MessageType::Auth)
}

/// Handle one authenticated command. Returns the close code and reason if
/// the connection must terminate.
async fn process_message(
    server: &BroadcastServer,
    conn: ConnId,
    session: &mut Session,
    message: &Message,
) -> Option<(u16, String)> {
    match message.type_of(SOCKET_TYPE_KEY) {
        MessageType::Subscribe => {
            let Some(channel) = message.channel() else {
                return Some((CLOSE_BAD_MESSAGE, "Missing channel".to_string()));
            };

            let reply = match server.hub().subscribe(conn, channel).await {
                Ok(()) => json!({
                    "type": MessageType::SubscribeOk.as_str(),
                    "channel": channel,
                }),
                Err(HubError::Subscribe(err)) => json!({
                    "type": MessageType::SubscribeError.as_str(),
                    "channel": channel,
                    "error": err.to_string(),
                }),
                Err(HubError::Closed) => {
                    return Some((CLOSE_BAD_MESSAGE, "Server shutting down".to_string()));
                }
            };

            if session.text(reply.to_string()).await.is_err() {
                return Some((CLOSE_BAD_MESSAGE, "Write failed".to_string()));
            }

            None
        }

        MessageType::Unsubscribe => {
            let Some(channel) = message.channel() else {
                return Some((CLOSE_BAD_MESSAGE, "Missing channel".to_string()));
            };

            if server.hub().unsubscribe(conn, channel).await.is_err() {
                return Some((CLOSE_BAD_MESSAGE, "Server shutting down".to_string()));
            }

            let reply = json!({
                "type": MessageType::UnsubscribeOk.as_str(),
                "channel": channel,
            });

            if session.text(reply.to_string()).await.is_err() {
                return Some((CLOSE_BAD_MESSAGE, "Write failed".to_string()));
            }

            None
        }

        _ => Some((CLOSE_BAD_MESSAGE, "Unexpected message".to_string())),
    }
}

/// Refuse the handshake: tell the client why, then close 401.
///
/// The error frame precedes the close because intermediate websocket stacks
/// may rewrite the non-standard close code before the client sees it.
async fn refuse_auth(mut session: Session, reason: &str) {
    let _ = session
        .text(
            json!({
                "type": MessageType::AuthFailed.as_str(),
                "reason": reason,
            })
            .to_string(),
        )
        .await;

    close(session, CLOSE_UNAUTHORIZED, reason).await;
}

async fn close(session: Session, code: u16, reason: &str) {
    let _ = session
        .close(Some(CloseReason {
            code: CloseCode::from(code),
            description: Some(reason.to_string()),
        }))
        .await;
}
