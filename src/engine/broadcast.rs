//! Broadcast fan-out to connected clients
//!
//! Each client owns a bounded send buffer. Fan-out never blocks: a full
//! buffer drops the frame for that client with a warning, so one slow
//! reader cannot stall the engine.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::position::AuthorId;

use super::protocol::Message;

/// Frames buffered per client before drops begin.
pub const CLIENT_SEND_BUFFER: usize = 256;

pub type ClientId = Uuid;

/// A connected client as the engine sees it: an identity, a bounded outbox
/// and the set of documents it subscribed to.
pub struct ClientHandle {
    pub id: ClientId,
    pub author: AuthorId,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<Message>,
    subscriptions: RwLock<HashSet<String>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub author: AuthorId,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
}

impl ClientHandle {
    pub fn subscribe(&self, document_id: &str) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.insert(document_id.to_string());
        }
    }

    pub fn unsubscribe(&self, document_id: &str) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.remove(document_id);
        }
    }

    pub fn is_subscribed(&self, document_id: &str) -> bool {
        self.subscriptions
            .read()
            .map(|subs| subs.contains(document_id))
            .unwrap_or(false)
    }

    /// Queue a frame without blocking. Returns false when the buffer is
    /// full or the client is gone; the frame is dropped either way.
    pub fn send(&self, message: Message) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client = %self.id, "send buffer full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            author: self.author.clone(),
            connected_at: self.connected_at,
            subscriptions: self
                .subscriptions
                .read()
                .map(|subs| subs.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// Registry of connected clients and the fan-out over them.
#[derive(Default)]
pub struct Broadcaster {
    clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, handing back its handle and the receiving end of
    /// its outbox for the transport to drain.
    pub fn register(&self, author: AuthorId) -> (Arc<ClientHandle>, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(CLIENT_SEND_BUFFER);
        let handle = Arc::new(ClientHandle {
            id: Uuid::new_v4(),
            author,
            connected_at: Utc::now(),
            sender,
            subscriptions: RwLock::new(HashSet::new()),
        });
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(handle.id, Arc::clone(&handle));
        }
        (handle, receiver)
    }

    pub fn remove(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.write().ok()?.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.read().ok()?.get(&id).cloned()
    }

    /// Send to every client subscribed to `document_id`, except the one
    /// that originated the frame. Returns the number of queued sends.
    pub fn broadcast_to_document(
        &self,
        document_id: &str,
        message: &Message,
        exclude: Option<ClientId>,
    ) -> usize {
        let Ok(clients) = self.clients.read() else {
            return 0;
        };
        let mut delivered = 0;
        for (id, client) in clients.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if client.is_subscribed(document_id) && client.send(message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .map(|clients| clients.values().map(|c| c.info()).collect())
            .unwrap_or_default()
    }

    pub fn document_clients(&self, document_id: &str) -> Vec<ClientInfo> {
        self.clients
            .read()
            .map(|clients| {
                clients
                    .values()
                    .filter(|c| c.is_subscribed(document_id))
                    .map(|c| c.info())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::protocol::{AckPayload, MessageKind};

    fn frame() -> Message {
        Message::new(
            MessageKind::Ack,
            &AckPayload {
                message_id: "m".to_string(),
                success: true,
                error: None,
            },
            "author".to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_only() {
        let broadcaster = Broadcaster::new();
        let (subscribed, mut rx1) = broadcaster.register("alice".to_string());
        let (other, mut rx2) = broadcaster.register("bob".to_string());
        subscribed.subscribe("doc");

        let delivered = broadcaster.broadcast_to_document("doc", &frame(), None);
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
        drop(other);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let broadcaster = Broadcaster::new();
        let (sender, mut rx) = broadcaster.register("alice".to_string());
        sender.subscribe("doc");

        let delivered = broadcaster.broadcast_to_document("doc", &frame(), Some(sender.id));
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_buffer_drops_frames() {
        let broadcaster = Broadcaster::new();
        let (client, _rx) = broadcaster.register("alice".to_string());
        client.subscribe("doc");

        for _ in 0..CLIENT_SEND_BUFFER {
            assert!(client.send(frame()));
        }
        // Buffer is full; the next frame is dropped, not blocked on.
        assert!(!client.send(frame()));
    }

    #[tokio::test]
    async fn test_remove_client() {
        let broadcaster = Broadcaster::new();
        let (client, _rx) = broadcaster.register("alice".to_string());
        assert_eq!(broadcaster.clients().len(), 1);

        broadcaster.remove(client.id);
        assert!(broadcaster.clients().is_empty());
    }
}
