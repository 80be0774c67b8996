//! Long-poll client transport, over reqwest.
//!
//! Commands go out as JSON `POST`s; every reply body is a JSON array whose
//! elements feed the incoming queue in order. After a successful handshake
//! the transport captures the connection token, echoes it in every request,
//! and keeps a background poll (`GET`) loop draining the server-side outbox.

use std::time::Duration;

use async_trait::async_trait;
use broadcaster::models::{Message, MessageType, LONGPOLL_TYPE_KEY, TOKEN_KEY};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Transport, TransportError};

/// Pause before retrying after a failed poll request.
const POLL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Request/response transport (`http://` / `https://` URL).
pub struct LongpollTransport {
    url: String,
    http: reqwest::Client,
    token: Option<String>,
    incoming_tx: mpsc::UnboundedSender<Message>,
    incoming_rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
}

impl LongpollTransport {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            token: None,
            incoming_tx,
            incoming_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// POST a message and funnel the reply array into the incoming queue.
    async fn post(&mut self, message: Message) -> Result<(), TransportError> {
        let response = self.http.post(&self.url).json(&message).send().await?;

        // non-array bodies (protocol errors) carry no messages
        let replies = response.json::<Vec<Message>>().await.unwrap_or_default();
        for reply in replies {
            self.accept(reply);
        }

        Ok(())
    }

    fn accept(&mut self, message: Message) {
        if self.token.is_none() && message.type_of(LONGPOLL_TYPE_KEY) == MessageType::AuthOk {
            if let Some(token) = message.token() {
                self.token = Some(token.to_string());
                self.spawn_poll_loop();
            }
        }

        let _ = self.incoming_tx.send(message);
    }

    /// Keep a drain request outstanding so publications arrive promptly.
    fn spawn_poll_loop(&self) {
        let Some(token) = self.token.clone() else {
            return;
        };
        let url = self.url.clone();
        let http = self.http.clone();
        let incoming_tx = self.incoming_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let request = http.get(&url).query(&[("token", token.as_str())]).send();

                let response = tokio::select! {
                    () = cancel.cancelled() => break,
                    response = request => response,
                };

                match response {
                    Ok(response) if response.status().is_success() => {
                        let batch = response.json::<Vec<Message>>().await.unwrap_or_default();
                        for message in batch {
                            if incoming_tx.send(message).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(response) => {
                        // token refused or expired; the connection is gone
                        log::debug!("poll returned {}; stopping", response.status());
                        break;
                    }
                    Err(err) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        log::debug!("poll error: {err}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Transport for LongpollTransport {
    fn type_key(&self) -> &'static str {
        LONGPOLL_TYPE_KEY
    }

    async fn connect(&mut self, auth: Option<Message>) -> Result<(), TransportError> {
        let handshake = match auth {
            Some(mut auth) => {
                auth.insert(LONGPOLL_TYPE_KEY, MessageType::Auth.as_str());
                auth
            }
            // suppressed auth envelope: an empty, typeless body
            None => Message::new(),
        };

        self.post(handshake).await
    }

    async fn send(&mut self, mut message: Message) -> Result<(), TransportError> {
        if let Some(token) = &self.token {
            message.insert(TOKEN_KEY, token.as_str());
        }
        self.post(message).await
    }

    async fn receive(&mut self) -> Result<Message, TransportError> {
        self.incoming_rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.cancel.cancel();
        Ok(())
    }
}

impl Drop for LongpollTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
