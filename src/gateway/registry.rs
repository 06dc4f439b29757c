use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::{RwLock, mpsc::UnboundedSender};
use uuid::Uuid;

use crate::gateway::event::ServerEvent;
use crate::identity::Identity;

/// Identifies one live connection for the duration of its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct ConnectionEntry {
    identity: Identity,
    sender: UnboundedSender<ServerEvent>,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// In-memory table of live connections and their room subscriptions.
///
/// Both maps sit behind one lock so that `subscribers_of` reflects
/// every subscribe/unsubscribe that has completed. The lock is never
/// held across an await point; message persistence happens entirely
/// outside of it.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a verified connection with an empty room set.
    pub async fn register(
        &self,
        identity: Identity,
        sender: UnboundedSender<ServerEvent>,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            id,
            ConnectionEntry {
                identity,
                sender,
                rooms: HashSet::new(),
            },
        );
        id
    }

    /// Removes the connection and drops it from every room it was
    /// subscribed to. Safe to call for a connection in any state,
    /// including one that never joined a room or is already gone.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Identity> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(&id)?;
        for room in &entry.rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }
        Some(entry.identity)
    }

    /// Idempotent; joining a room twice is a no-op. A stale
    /// connection id returns `None` (benign disconnect race).
    pub async fn subscribe(&self, id: ConnectionId, room_id: &str) -> Option<Identity> {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let entry = inner.connections.get_mut(&id)?;
        entry.rooms.insert(room_id.to_owned());
        inner.rooms.entry(room_id.to_owned()).or_default().insert(id);
        Some(entry.identity.clone())
    }

    /// Idempotent; leaving a room that was never joined is a no-op.
    pub async fn unsubscribe(&self, id: ConnectionId, room_id: &str) -> Option<Identity> {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let entry = inner.connections.get_mut(&id)?;
        entry.rooms.remove(room_id);
        if let Some(members) = inner.rooms.get_mut(room_id) {
            members.remove(&id);
            if members.is_empty() {
                inner.rooms.remove(room_id);
            }
        }
        Some(entry.identity.clone())
    }

    /// Snapshot of the room's subscribers as of this call.
    pub async fn subscribers_of(&self, room_id: &str) -> HashSet<ConnectionId> {
        let inner = self.inner.read().await;
        inner.rooms.get(room_id).cloned().unwrap_or_default()
    }

    pub async fn identity_of(&self, id: ConnectionId) -> Option<Identity> {
        let inner = self.inner.read().await;
        inner.connections.get(&id).map(|e| e.identity.clone())
    }

    /// Direct delivery to a single connection; a no-op if it has
    /// already disconnected.
    pub async fn send_to(&self, id: ConnectionId, event: ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(entry) = inner.connections.get(&id) {
            let _ = entry.sender.send(event);
        }
    }

    /// Snapshot of delivery handles for a room, for the multiplexer.
    pub(crate) async fn delivery_targets(
        &self,
        room_id: &str,
        exclude: Option<ConnectionId>,
    ) -> Vec<(ConnectionId, UnboundedSender<ServerEvent>)> {
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(room_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| {
                inner
                    .connections
                    .get(id)
                    .map(|entry| (*id, entry.sender.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn identity(name: &str) -> Identity {
        Identity {
            id: format!("user-{name}"),
            username: name.to_string(),
        }
    }

    async fn connect(
        registry: &ConnectionRegistry,
        name: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(identity(name), tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn register_starts_with_no_rooms() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry, "alice").await;

        assert_eq!(registry.identity_of(id).await.unwrap().username, "alice");
        assert!(registry.subscribers_of("general").await.is_empty());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry, "alice").await;

        registry.subscribe(id, "general").await.unwrap();
        registry.subscribe(id, "general").await.unwrap();

        let subs = registry.subscribers_of("general").await;
        assert_eq!(subs.len(), 1);
        assert!(subs.contains(&id));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry, "alice").await;

        registry.subscribe(id, "general").await.unwrap();
        registry.unsubscribe(id, "general").await.unwrap();
        registry.unsubscribe(id, "general").await.unwrap();

        assert!(registry.subscribers_of("general").await.is_empty());
    }

    #[tokio::test]
    async fn unregister_leaves_every_room() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry, "alice").await;

        registry.subscribe(id, "general").await.unwrap();
        registry.subscribe(id, "random").await.unwrap();
        let identity = registry.unregister(id).await.unwrap();

        assert_eq!(identity.username, "alice");
        assert!(registry.subscribers_of("general").await.is_empty());
        assert!(registry.subscribers_of("random").await.is_empty());
        assert!(registry.identity_of(id).await.is_none());
    }

    #[tokio::test]
    async fn unregister_without_rooms_is_safe() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry, "alice").await;

        assert!(registry.unregister(id).await.is_some());
        assert!(registry.unregister(id).await.is_none());
    }

    #[tokio::test]
    async fn stale_connection_operations_are_dropped() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry, "alice").await;
        registry.unregister(id).await;

        assert!(registry.subscribe(id, "general").await.is_none());
        assert!(registry.unsubscribe(id, "general").await.is_none());
        assert!(registry.subscribers_of("general").await.is_empty());
    }

    #[tokio::test]
    async fn delivery_targets_respects_exclusion() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry, "alice").await;
        let (b, _rx_b) = connect(&registry, "bob").await;
        registry.subscribe(a, "general").await.unwrap();
        registry.subscribe(b, "general").await.unwrap();

        let targets = registry.delivery_targets("general", Some(a)).await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, b);
    }
}
