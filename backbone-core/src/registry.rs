//! Process-wide routing registry: `ClientId -> InboundQueue`, plus one
//! server-wide S2S control queue. Owned as a value by the server and
//! cloned into every handler, rather than a global, per spec.md's design
//! note in §9.

use crate::id::ClientId;
use crate::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One connected client's inbound queue.
pub type InboundSender = mpsc::Sender<Message>;
pub type InboundReceiver = mpsc::Receiver<Message>;

const QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Registry {
    clients: Arc<Mutex<HashMap<ClientId, InboundSender>>>,
    server_queue_tx: mpsc::Sender<Message>,
}

impl Registry {
    /// Returns the registry plus the receiving half of the server queue,
    /// which the caller (the server supervisor) drains for `S2S(DONE)`.
    pub fn new() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Registry {
                clients: Arc::new(Mutex::new(HashMap::new())),
                server_queue_tx: tx,
            },
            rx,
        )
    }

    /// Atomically creates a fresh queue, inserts it, and returns both
    /// halves. Unconditionally replaces any existing entry for `id` — the
    /// caller is responsible for rejecting duplicate sessions before
    /// calling this, per spec.md's resolved Open Question.
    pub async fn register(&self, id: ClientId) -> InboundReceiver {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        self.clients.lock().await.insert(id, tx);
        rx
    }

    pub async fn deregister(&self, id: ClientId) {
        self.clients.lock().await.remove(&id);
    }

    pub async fn get(&self, id: ClientId) -> Option<InboundSender> {
        self.clients.lock().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: ClientId) -> bool {
        self.clients.lock().await.contains_key(&id)
    }

    pub fn server_queue(&self) -> mpsc::Sender<Message> {
        self.server_queue_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, S2SType};

    #[tokio::test]
    async fn register_then_get_delivers() {
        let (registry, _server_rx) = Registry::new();
        let id = ClientId::new();
        let mut rx = registry.register(id).await;

        let sender = registry.get(id).await.unwrap();
        sender
            .send(Message::c2c(id, b"hi".to_vec()))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, Message::c2c(id, b"hi".to_vec()));
    }

    #[tokio::test]
    async fn get_absent_client_is_none() {
        let (registry, _server_rx) = Registry::new();
        assert!(registry.get(ClientId::new()).await.is_none());
    }

    #[tokio::test]
    async fn deregister_makes_client_absent() {
        let (registry, _server_rx) = Registry::new();
        let id = ClientId::new();
        let _rx = registry.register(id).await;
        assert!(registry.contains(id).await);

        registry.deregister(id).await;
        assert!(!registry.contains(id).await);
        assert!(registry.get(id).await.is_none());
    }

    #[tokio::test]
    async fn server_queue_is_shared() {
        let (registry, mut server_rx) = Registry::new();
        registry
            .server_queue()
            .send(Message::s2s(S2SType::Done, None))
            .await
            .unwrap();

        let msg = server_rx.recv().await.unwrap();
        assert!(matches!(msg, Message::S2S { ty: S2SType::Done, .. }));
    }
}
