//! Client registry — tracks connected clients by id, name, and type
//!
//! The registry is shared between the accept loop and every queue actor.
//! Lookups take the read side of the lock; connect/disconnect take the
//! write side. Scan order for name/type lookups is insertion order,
//! which is also the order used for first-acquirer resolution.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

use crate::codec;
use crate::error::{HmqError, Result};
use crate::message::Message;

/// Target prefix selecting clients by name
pub const TARGET_NAME_PREFIX: &str = "@name:";

/// Target prefix selecting clients by type
pub const TARGET_TYPE_PREFIX: &str = "@type:";

/// Immutable identity of a connected client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: String,
    pub name: String,
    pub client_type: String,
    pub joined_at: DateTime<Utc>,
}

/// Cheap clonable write handle for a connected client
///
/// Sending hands pre-encoded frame bytes to the connection's writer
/// task. A send failure means the connection is gone.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    info: Arc<ClientInfo>,
    sender: mpsc::Sender<Bytes>,
}

impl ClientHandle {
    pub fn new(info: ClientInfo, sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            info: Arc::new(info),
            sender,
        }
    }

    /// Test/loopback constructor: a handle whose outbound frames land in
    /// the returned receiver
    pub fn channel(
        id: impl Into<String>,
        name: impl Into<String>,
        client_type: impl Into<String>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(256);
        let info = ClientInfo {
            id: id.into(),
            name: name.into(),
            client_type: client_type.into(),
            joined_at: Utc::now(),
        };
        (Self::new(info, tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn client_type(&self) -> &str {
        &self.info.client_type
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    /// Queue pre-encoded bytes for the connection writer
    pub async fn send_bytes(&self, bytes: Bytes) -> Result<()> {
        self.sender
            .send(bytes)
            .await
            .map_err(|_| HmqError::Unreachable(self.info.id.clone()))
    }

    /// Encode and queue a frame for the connection writer
    pub async fn send(&self, message: &Message) -> Result<()> {
        let bytes = codec::encode(message)?;
        self.send_bytes(bytes).await
    }
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, ClientHandle>,
    /// Insertion-ordered ids, the scan order for name/type lookups
    order: Vec<String>,
}

/// Registry of connected clients
#[derive(Default)]
pub struct ClientRegistry {
    inner: RwLock<RegistryInner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Fails on duplicate id.
    pub async fn add(&self, handle: ClientHandle) -> Result<()> {
        let mut inner = self.inner.write().await;
        let id = handle.id().to_string();
        if inner.by_id.contains_key(&id) {
            return Err(HmqError::Config(format!("Duplicate client id: {}", id)));
        }
        inner.order.push(id.clone());
        inner.by_id.insert(id, handle);
        Ok(())
    }

    /// Remove a client by id, returning its handle if it was present
    pub async fn remove_by_id(&self, id: &str) -> Option<ClientHandle> {
        let mut inner = self.inner.write().await;
        let removed = inner.by_id.remove(id);
        if removed.is_some() {
            inner.order.retain(|existing| existing != id);
        }
        removed
    }

    pub async fn find_by_id(&self, id: &str) -> Option<ClientHandle> {
        self.inner.read().await.by_id.get(id).cloned()
    }

    /// All clients with the given name, in insertion order
    pub async fn find_by_name(&self, name: &str) -> Vec<ClientHandle> {
        self.scan(|handle| handle.name() == name).await
    }

    /// All clients of the given type, in insertion order
    pub async fn find_by_type(&self, client_type: &str) -> Vec<ClientHandle> {
        self.scan(|handle| handle.client_type() == client_type).await
    }

    /// Resolve a `@name:` / `@type:` / client-id target
    pub async fn resolve_target(&self, target: &str) -> Vec<ClientHandle> {
        if let Some(name) = target.strip_prefix(TARGET_NAME_PREFIX) {
            self.find_by_name(name).await
        } else if let Some(client_type) = target.strip_prefix(TARGET_TYPE_PREFIX) {
            self.find_by_type(client_type).await
        } else {
            self.find_by_id(target).await.into_iter().collect()
        }
    }

    /// Send a frame to every client matching the predicate.
    /// Sends run concurrently; returns the number of clients the frame
    /// was queued for.
    pub async fn broadcast(
        &self,
        predicate: impl Fn(&ClientHandle) -> bool,
        message: &Message,
    ) -> Result<usize> {
        let bytes = codec::encode(message)?;
        let targets = self.scan(predicate).await;
        let sends = targets
            .iter()
            .map(|handle| handle.send_bytes(bytes.clone()));
        let sent = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|result| result.is_ok())
            .count();
        Ok(sent)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of all clients in insertion order
    pub async fn all(&self) -> Vec<ClientHandle> {
        self.scan(|_| true).await
    }

    async fn scan(&self, predicate: impl Fn(&ClientHandle) -> bool) -> Vec<ClientHandle> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|handle| predicate(handle))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with(clients: &[(&str, &str, &str)]) -> ClientRegistry {
        let registry = ClientRegistry::new();
        for (id, name, client_type) in clients {
            let (handle, _rx) = ClientHandle::channel(*id, *name, *client_type);
            registry.add(handle).await.unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_add_and_find_by_id() {
        let registry = registry_with(&[("c1", "worker", "consumer")]).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.find_by_id("c1").await.is_some());
        assert!(registry.find_by_id("c2").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = registry_with(&[("c1", "a", "t")]).await;
        let (dup, _rx) = ClientHandle::channel("c1", "b", "t");
        assert!(registry.add(dup).await.is_err());
    }

    #[tokio::test]
    async fn test_find_by_name_insertion_order() {
        let registry = registry_with(&[
            ("c1", "worker", "consumer"),
            ("c2", "other", "consumer"),
            ("c3", "worker", "producer"),
        ])
        .await;

        let workers = registry.find_by_name("worker").await;
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].id(), "c1");
        assert_eq!(workers[1].id(), "c3");

        let consumers = registry.find_by_type("consumer").await;
        assert_eq!(consumers.len(), 2);
        assert_eq!(consumers[0].id(), "c1");
    }

    #[tokio::test]
    async fn test_resolve_target_prefixes() {
        let registry = registry_with(&[("c1", "worker", "consumer")]).await;

        assert_eq!(registry.resolve_target("@name:worker").await.len(), 1);
        assert_eq!(registry.resolve_target("@type:consumer").await.len(), 1);
        assert_eq!(registry.resolve_target("c1").await.len(), 1);
        assert_eq!(registry.resolve_target("@name:missing").await.len(), 0);
    }

    #[tokio::test]
    async fn test_remove_updates_scan_order() {
        let registry = registry_with(&[("c1", "w", "t"), ("c2", "w", "t")]).await;
        assert!(registry.remove_by_id("c1").await.is_some());
        assert!(registry.remove_by_id("c1").await.is_none());

        let remaining = registry.find_by_name("w").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), "c2");
    }

    #[tokio::test]
    async fn test_broadcast_to_matching_clients() {
        let registry = ClientRegistry::new();
        let (c1, mut rx1) = ClientHandle::channel("c1", "w", "consumer");
        let (c2, mut rx2) = ClientHandle::channel("c2", "w", "producer");
        registry.add(c1).await.unwrap();
        registry.add(c2).await.unwrap();

        let mut message = Message::direct("@type:consumer", 1);
        message.set_string_content("hi");
        let sent = registry
            .broadcast(|h| h.client_type() == "consumer", &message)
            .await
            .unwrap();

        assert_eq!(sent, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver_is_unreachable() {
        let (handle, rx) = ClientHandle::channel("c1", "w", "t");
        drop(rx);
        let err = handle.send(&Message::direct("c1", 1)).await.unwrap_err();
        assert!(matches!(err, HmqError::Unreachable(_)));
    }
}
