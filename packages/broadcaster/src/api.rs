//! HTTP entry point.
//!
//! One route serves both transports: websocket upgrade requests spawn a
//! socket connection, JSON `POST` bodies are long-poll handshakes or
//! commands, and `GET` requests carrying a token drain that connection's
//! outbox.

use actix_web::http::{header, Method};
use actix_web::{route, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::models::Message;
use crate::server::BroadcastServer;
use crate::{longpoll, ws};

#[derive(Debug, Deserialize)]
struct PollParams {
    token: String,
}

/// Mount the broadcast endpoint on an actix app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(endpoint);
}

#[route("/", method = "GET", method = "POST")]
#[allow(clippy::future_not_send)]
pub async fn endpoint(
    req: HttpRequest,
    body: web::Payload,
    server: web::Data<BroadcastServer>,
) -> Result<HttpResponse, actix_web::Error> {
    if is_websocket_upgrade(&req) {
        let (res, session, msg_stream) = actix_ws::handle(&req, body)?;

        // spawn the socket handler (and don't await it) so that the upgrade
        // response is returned immediately
        tokio::task::spawn_local(ws::handler::handle_socket(
            (**server).clone(),
            session,
            msg_stream,
        ));

        return Ok(res);
    }

    if req.method() == Method::POST {
        let bytes = body.to_bytes().await?;
        let Ok(message) = serde_json::from_slice::<Message>(&bytes) else {
            return Ok(HttpResponse::BadRequest().body("Invalid JSON body"));
        };

        return Ok(longpoll::handle_message(&server, message).await);
    }

    // GET: a poll for pending messages
    let Ok(params) = web::Query::<PollParams>::from_query(req.query_string()) else {
        return Ok(HttpResponse::BadRequest().body("Missing token"));
    };

    Ok(longpoll::poll(&server, &params.token).await)
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}
