//! Registry of open push connections.
//!
//! Broadcast fan-out iterates over a snapshot of the registry, so a
//! registration or removal that races a broadcast can never corrupt the
//! iteration. A connection belongs to exactly one space for its
//! lifetime; reconnecting creates a new connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{Model, SpaceId};
use crate::transport::Transport;

/// One open push connection.
#[derive(Clone)]
pub struct Connection {
    pub id: Uuid,
    pub space_id: SpaceId,
    /// Resolved caller identity (a being id), if the connect request
    /// carried credentials.
    pub identity: Option<Uuid>,
    /// Subscribed model set; empty means all models.
    pub models: HashSet<Model>,
    pub transport: Arc<dyn Transport>,
    last_heartbeat: Instant,
}

impl Connection {
    pub fn new(
        space_id: SpaceId,
        identity: Option<Uuid>,
        models: HashSet<Model>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            space_id,
            identity,
            models,
            transport,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn subscribed_to(&self, model: Model) -> bool {
        self.models.is_empty() || self.models.contains(&model)
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("space_id", &self.space_id)
            .field("identity", &self.identity)
            .field("models", &self.models)
            .finish()
    }
}

/// A removal result, reporting whether the connection was the last one
/// carrying its identity (the presence deriver cares about that edge).
#[derive(Debug)]
pub struct RemovedConnection {
    pub connection: Connection,
    pub last_for_identity: bool,
}

/// Process-wide connection registry. Constructed once at startup; all
/// mutation goes through the inner lock.
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<Uuid, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection. Returns whether this is the identity's
    /// first live connection (it just came online).
    pub async fn register(&self, conn: Connection) -> bool {
        let mut map = self.inner.write().await;
        let first_for_identity = match conn.identity {
            Some(identity) => !map.values().any(|c| c.identity == Some(identity)),
            None => false,
        };
        log::debug!(
            "Connection {} registered for space {} ({} total)",
            conn.id,
            conn.space_id,
            map.len() + 1
        );
        map.insert(conn.id, conn);
        first_for_identity
    }

    /// Remove a connection and close its transport.
    pub async fn remove(&self, id: Uuid) -> Option<RemovedConnection> {
        let mut map = self.inner.write().await;
        let conn = map.remove(&id)?;
        conn.transport.close();
        let last_for_identity = match conn.identity {
            Some(identity) => !map.values().any(|c| c.identity == Some(identity)),
            None => false,
        };
        log::debug!(
            "Connection {} removed from space {} ({} remain)",
            conn.id,
            conn.space_id,
            map.len()
        );
        Some(RemovedConnection {
            connection: conn,
            last_for_identity,
        })
    }

    /// Refresh a connection's heartbeat clock. Returns false for an
    /// unknown connection.
    pub async fn touch(&self, id: Uuid) -> bool {
        let mut map = self.inner.write().await;
        match map.get_mut(&id) {
            Some(conn) => {
                conn.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the connections registered for a space.
    pub async fn for_space(&self, space: SpaceId) -> Vec<Connection> {
        self.inner
            .read()
            .await
            .values()
            .filter(|c| c.space_id == space)
            .cloned()
            .collect()
    }

    /// Snapshot of every registered connection.
    pub async fn snapshot(&self) -> Vec<Connection> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Whether at least one live connection carries this identity.
    pub async fn identity_online(&self, identity: Uuid) -> bool {
        self.inner
            .read()
            .await
            .values()
            .any(|c| c.identity == Some(identity))
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
