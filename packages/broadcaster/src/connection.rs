//! Connection handles the hub can address without knowing transport details.
//!
//! The hub sees every connection as the capability set {send, close,
//! identity}. Both capabilities are non-blocking: a socket send is a push
//! onto the connection's writer channel, a long-poll send is a push onto the
//! session's bounded outbox. This keeps the hub's publish fan-out bounded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::models::{broadcast_message, Message, LONGPOLL_TYPE_KEY, SOCKET_TYPE_KEY};

/// Identity of a connection within the hub.
pub type ConnId = usize;

/// Outbound frame for a socket connection's write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Server-side state of one logical long-poll connection.
///
/// Written by the hub task (enqueue), read by the poll-servicing task
/// (drain). The outbox is bounded; overflow drops the oldest message.
#[derive(Debug)]
pub struct LongpollSession {
    token: String,
    outbox: Mutex<VecDeque<Message>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl LongpollSession {
    #[must_use]
    pub fn new(token: String, capacity: usize) -> Self {
        Self {
            token,
            outbox: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Append a message to the pending outbox without blocking.
    pub fn enqueue(&self, message: Message) {
        let mut outbox = self.outbox.lock().unwrap();
        if outbox.len() >= self.capacity {
            log::warn!(
                "outbox for token {} full ({}); dropping oldest message",
                self.token,
                self.capacity
            );
            outbox.pop_front();
        }
        outbox.push_back(message);
        drop(outbox);

        self.notify.notify_one();
    }

    /// Take every pending message, in enqueue order.
    #[must_use]
    pub fn drain(&self) -> Vec<Message> {
        self.outbox.lock().unwrap().drain(..).collect()
    }

    /// Wait until the outbox may have become non-empty.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record activity on this session. Idle sessions expire.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }
}

/// Transport half of a registered connection.
#[derive(Debug, Clone)]
enum TransportHandle {
    Socket(mpsc::UnboundedSender<SocketFrame>),
    Longpoll(Arc<LongpollSession>),
}

/// A connection as the hub addresses it.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    transport: TransportHandle,
}

impl ConnectionHandle {
    #[must_use]
    pub fn socket(frame_tx: mpsc::UnboundedSender<SocketFrame>) -> Self {
        Self {
            transport: TransportHandle::Socket(frame_tx),
        }
    }

    #[must_use]
    pub fn longpoll(session: Arc<LongpollSession>) -> Self {
        Self {
            transport: TransportHandle::Longpoll(session),
        }
    }

    /// The long-poll token, if this is a long-poll connection.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        match &self.transport {
            TransportHandle::Socket(_) => None,
            TransportHandle::Longpoll(session) => Some(session.token()),
        }
    }

    #[must_use]
    pub fn longpoll_session(&self) -> Option<Arc<LongpollSession>> {
        match &self.transport {
            TransportHandle::Socket(_) => None,
            TransportHandle::Longpoll(session) => Some(session.clone()),
        }
    }

    /// Deliver a publication to this connection. Never blocks.
    pub fn send(&self, channel: &str, body: &Value) {
        match &self.transport {
            TransportHandle::Socket(frame_tx) => {
                let frame = broadcast_message(SOCKET_TYPE_KEY, channel, body).to_string();
                // errors if the handler task already exited; unregister follows
                let _ = frame_tx.send(SocketFrame::Text(frame));
            }
            TransportHandle::Longpoll(session) => {
                session.enqueue(broadcast_message(LONGPOLL_TYPE_KEY, channel, body));
            }
        }
    }

    /// Close this connection. Never blocks.
    pub fn close(&self, code: u16, reason: &str) {
        match &self.transport {
            TransportHandle::Socket(frame_tx) => {
                let _ = frame_tx.send(SocketFrame::Close {
                    code,
                    reason: reason.to_string(),
                });
            }
            TransportHandle::Longpoll(session) => {
                session.close();
            }
        }
    }
}
