use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use uuid::Uuid;
use weft_core::UserId;

/// Outcome of a register/unregister call. Only the 0->1 and 1->0 edges carry
/// a broadcast; every other call is a silent membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PresenceChange {
    CameOnline,
    AlreadyOnline,
    WentOffline,
    StillOnline,
    UnknownConnection,
}

/// Live-connection registry, owned by `AppState` and constructed fresh per
/// process. Edge detection happens inside the write guard so concurrent
/// register/unregister calls can neither corrupt a user's connection set nor
/// double-fire a transition.
#[derive(Debug, Default)]
pub(crate) struct PresenceRegistry {
    inner: RwLock<HashMap<UserId, HashSet<Uuid>>>,
}

impl PresenceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn register(&self, user_id: UserId, connection_id: Uuid) -> PresenceChange {
        let mut inner = self.inner.write().await;
        let connections = inner.entry(user_id).or_default();
        let first = connections.is_empty();
        connections.insert(connection_id);
        if first {
            PresenceChange::CameOnline
        } else {
            PresenceChange::AlreadyOnline
        }
    }

    pub(crate) async fn unregister(&self, user_id: UserId, connection_id: Uuid) -> PresenceChange {
        let mut inner = self.inner.write().await;
        let Some(connections) = inner.get_mut(&user_id) else {
            return PresenceChange::UnknownConnection;
        };
        if !connections.remove(&connection_id) {
            return PresenceChange::UnknownConnection;
        }
        if connections.is_empty() {
            inner.remove(&user_id);
            PresenceChange::WentOffline
        } else {
            PresenceChange::StillOnline
        }
    }

    pub(crate) async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.read().await.contains_key(&user_id)
    }

    pub(crate) async fn online_users(&self) -> HashSet<UserId> {
        self.inner.read().await.keys().copied().collect()
    }

    /// Connection ids a user's personal events should be fanned out to.
    pub(crate) async fn connections_of(&self, user_id: UserId) -> Vec<Uuid> {
        self.inner
            .read()
            .await
            .get(&user_id)
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default()
    }
}
