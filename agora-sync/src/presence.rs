//! Presence derived live from the connection registry.
//!
//! No online/offline state is ever persisted: a being is online iff the
//! registry holds a live connection for its identity right now, so
//! presence self-heals across crashes and restarts. Room and agent
//! beings are always online.

use std::sync::Arc;

use crate::model::{Being, BeingKind};
use crate::registry::ConnectionRegistry;

pub struct PresenceDeriver {
    registry: Arc<ConnectionRegistry>,
}

impl PresenceDeriver {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn is_online(&self, being: &Being) -> bool {
        match being.kind {
            BeingKind::Room | BeingKind::Agent => true,
            BeingKind::Human => self.registry.identity_online(being.id).await,
        }
    }

    /// Serialize a being for the wire with the derived `online` flag
    /// injected into its metadata.
    pub async fn to_wire(&self, being: &Being) -> serde_json::Value {
        let online = self.is_online(being).await;
        let mut value = serde_json::to_value(being).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            let metadata = obj
                .entry("metadata")
                .or_insert(serde_json::Value::Null);
            if !metadata.is_object() {
                *metadata = serde_json::json!({});
            }
            if let Some(meta) = metadata.as_object_mut() {
                meta.insert("online".to_string(), serde_json::Value::Bool(online));
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpaceId;
    use crate::registry::Connection;
    use crate::transport::RecordingTransport;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn connection_for(space: SpaceId, identity: Uuid) -> Connection {
        Connection::new(
            space,
            Some(identity),
            HashSet::new(),
            Arc::new(RecordingTransport::new()),
        )
    }

    #[tokio::test]
    async fn test_rooms_and_agents_always_online() {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceDeriver::new(registry);
        let space = Uuid::new_v4();

        let room = Being::new("lobby", BeingKind::Room, space);
        let agent = Being::new("helper", BeingKind::Agent, space);
        assert!(presence.is_online(&room).await);
        assert!(presence.is_online(&agent).await);
    }

    #[tokio::test]
    async fn test_human_presence_follows_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceDeriver::new(registry.clone());
        let space = Uuid::new_v4();
        let human = Being::new("Ada", BeingKind::Human, space);

        assert!(!presence.is_online(&human).await);

        let conn = connection_for(space, human.id);
        let conn_id = conn.id;
        registry.register(conn).await;
        assert!(presence.is_online(&human).await);

        registry.remove(conn_id).await;
        assert!(!presence.is_online(&human).await);
    }

    #[tokio::test]
    async fn test_wire_form_carries_online_flag() {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceDeriver::new(registry.clone());
        let space = Uuid::new_v4();

        let mut human = Being::new("Ada", BeingKind::Human, space);
        human.metadata = serde_json::json!({"role": "speaker"});

        let offline = presence.to_wire(&human).await;
        assert_eq!(offline["metadata"]["online"], false);
        // Existing metadata survives the injection.
        assert_eq!(offline["metadata"]["role"], "speaker");

        registry.register(connection_for(space, human.id)).await;
        let online = presence.to_wire(&human).await;
        assert_eq!(online["metadata"]["online"], true);
    }

    #[tokio::test]
    async fn test_wire_form_with_null_metadata() {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceDeriver::new(registry);
        let room = Being::new("lobby", BeingKind::Room, Uuid::new_v4());

        let value = presence.to_wire(&room).await;
        assert_eq!(value["metadata"]["online"], true);
    }
}
