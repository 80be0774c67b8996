//! Socket client transport, over tokio-tungstenite.

use async_trait::async_trait;
use broadcaster::models::{Message, MessageType, SOCKET_TYPE_KEY};
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::{Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Persistent full-duplex transport (`ws://` / `wss://` URL).
pub struct SocketTransport {
    url: String,
    stream: Option<WsStream>,
}

impl SocketTransport {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn type_key(&self) -> &'static str {
        SOCKET_TYPE_KEY
    }

    async fn connect(&mut self, auth: Option<Message>) -> Result<(), TransportError> {
        let (stream, _response) = connect_async(self.url.as_str()).await?;
        self.stream = Some(stream);

        if let Some(mut auth) = auth {
            auth.insert(SOCKET_TYPE_KEY, MessageType::Auth.as_str());
            self.send(auth).await?;
        }

        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.send(WsMessage::text(message.to_string())).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            let frame = stream.next().await.ok_or(TransportError::Closed)?;
            match frame? {
                WsMessage::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
                WsMessage::Close(frame) => return Ok(close_to_message(frame)),
                _ => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
        Ok(())
    }
}

/// Classify a server close frame as a wire message.
///
/// A 401 close is the server refusing authentication; surface it as the
/// `authFailed` message a long-poll client would have seen. Any other close
/// yields a typeless map, which classifies as unknown.
fn close_to_message(frame: Option<CloseFrame>) -> Message {
    frame.map_or_else(Message::new, |frame| {
        let code = u16::from(frame.code);
        if code == 401 {
            Message::of_type(MessageType::AuthFailed, SOCKET_TYPE_KEY)
                .with("reason", frame.reason.as_str())
        } else {
            Message::new()
                .with("code", code)
                .with("reason", frame.reason.as_str())
        }
    })
}

#[cfg(test)]
mod tests {
    use broadcaster::models::LONGPOLL_TYPE_KEY;
    use pretty_assertions::assert_eq;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    use super::*;

    #[test_log::test]
    fn close_401_becomes_auth_failed() {
        let message = close_to_message(Some(CloseFrame {
            code: CloseCode::from(401),
            reason: "Auth expected".into(),
        }));

        assert_eq!(message.type_of(SOCKET_TYPE_KEY), MessageType::AuthFailed);
        assert_eq!(message.reason(), Some("Auth expected"));
        assert_eq!(message.type_of(LONGPOLL_TYPE_KEY), MessageType::Unknown);
    }

    #[test_log::test]
    fn other_closes_classify_as_unknown() {
        let message = close_to_message(Some(CloseFrame {
            code: CloseCode::from(400),
            reason: "Unexpected message".into(),
        }));

        assert_eq!(message.type_of(SOCKET_TYPE_KEY), MessageType::Unknown);
        assert_eq!(message.str_field("reason"), Some("Unexpected message"));

        let message = close_to_message(None);
        assert_eq!(message.type_of(SOCKET_TYPE_KEY), MessageType::Unknown);
    }
}
