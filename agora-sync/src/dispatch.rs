//! Fan-out broadcast with per-connection failure isolation.
//!
//! One event at a time: the dispatch lock keeps the fan-out loop
//! sequential, which is what gives every connection of a space the same
//! delivery order. A write failure removes that connection and the loop
//! carries on; a faulty subscriber never blocks delivery to the others.
//! Push is fire-and-forget; recovery is reconnection plus catch-up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::model::{Model, SpaceId};
use crate::protocol::Frame;
use crate::registry::{ConnectionRegistry, RemovedConnection};
use crate::transport::WireFrame;

/// Dispatch counters, tracked with atomics off the fan-out path.
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub frames_dispatched: u64,
    pub writes_failed: u64,
}

/// Result of one broadcast.
pub struct BroadcastOutcome {
    /// Connections the frame was written to.
    pub delivered: usize,
    /// Connections removed because their transport write failed.
    pub dropped: Vec<RemovedConnection>,
}

pub struct BroadcastDispatcher {
    registry: Arc<ConnectionRegistry>,
    /// Serializes fan-out so events reach every subscriber in dispatch
    /// order.
    dispatch_lock: Mutex<()>,
    frames_dispatched: AtomicU64,
    writes_failed: AtomicU64,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            dispatch_lock: Mutex::new(()),
            frames_dispatched: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
        }
    }

    /// Broadcast a frame to every connection registered for its space
    /// and subscribed to its model.
    pub async fn broadcast(&self, frame: &Frame) -> Result<BroadcastOutcome, crate::error::SyncError> {
        let json = frame.encode()?;
        Ok(self
            .fan_out(frame.space(), Some(frame.model()), &WireFrame::Data(json))
            .await)
    }

    /// Broadcast a raw wire frame (keep-alives, pre-encoded payloads) to
    /// a space, optionally filtered by model subscription.
    pub async fn fan_out(
        &self,
        space: SpaceId,
        model: Option<Model>,
        wire: &WireFrame,
    ) -> BroadcastOutcome {
        let _guard = self.dispatch_lock.lock().await;
        let connections = self.registry.for_space(space).await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for conn in connections {
            if let Some(model) = model {
                if !conn.subscribed_to(model) {
                    continue;
                }
            }
            match conn.transport.send(wire) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Write to connection {} failed ({e}); removing", conn.id);
                    failed.push(conn.id);
                }
            }
        }

        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
        self.writes_failed
            .fetch_add(failed.len() as u64, Ordering::Relaxed);

        let mut dropped = Vec::new();
        for id in failed {
            if let Some(removed) = self.registry.remove(id).await {
                dropped.push(removed);
            }
        }

        BroadcastOutcome { delivered, dropped }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Connection;
    use crate::transport::RecordingTransport;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn delta(space: SpaceId, model: Model, version: u64) -> Frame {
        Frame::SpaceDelta {
            space,
            model,
            version,
            timestamp: 0,
            created: vec![],
            updated: vec![],
            deleted: vec![],
        }
    }

    async fn attach(
        registry: &ConnectionRegistry,
        space: SpaceId,
        models: HashSet<Model>,
    ) -> Arc<RecordingTransport> {
        let transport = Arc::new(RecordingTransport::new());
        registry
            .register(Connection::new(space, None, models, transport.clone()))
            .await;
        transport
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_space_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let space = Uuid::new_v4();
        let other_space = Uuid::new_v4();

        let a = attach(&registry, space, HashSet::new()).await;
        let b = attach(&registry, space, HashSet::new()).await;
        let outsider = attach(&registry, other_space, HashSet::new()).await;

        let outcome = dispatcher
            .broadcast(&delta(space, Model::Intentions, 1))
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 2);
        assert!(outcome.dropped.is_empty());
        assert_eq!(a.payloads().len(), 1);
        assert_eq!(b.payloads().len(), 1);
        assert!(outsider.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_model_subscription_filter() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let space = Uuid::new_v4();

        let mut intentions_only = HashSet::new();
        intentions_only.insert(Model::Intentions);
        let filtered = attach(&registry, space, intentions_only).await;
        let unfiltered = attach(&registry, space, HashSet::new()).await;

        dispatcher
            .broadcast(&delta(space, Model::Beings, 1))
            .await
            .unwrap();

        assert!(filtered.payloads().is_empty());
        assert_eq!(unfiltered.payloads().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_connection_is_removed_others_delivered() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let space = Uuid::new_v4();

        let healthy = attach(&registry, space, HashSet::new()).await;
        let broken = attach(&registry, space, HashSet::new()).await;
        broken.fail_writes();

        let outcome = dispatcher
            .broadcast(&delta(space, Model::Intentions, 1))
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(healthy.payloads().len(), 1);
        assert_eq!(registry.len().await, 1);

        // A second broadcast no longer sees the broken connection.
        let outcome = dispatcher
            .broadcast(&delta(space, Model::Intentions, 2))
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 1);
        assert!(outcome.dropped.is_empty());
        assert_eq!(healthy.payloads().len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_order_is_preserved() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let space = Uuid::new_v4();
        let transport = attach(&registry, space, HashSet::new()).await;

        for version in 1..=5 {
            dispatcher
                .broadcast(&delta(space, Model::Intentions, version))
                .await
                .unwrap();
        }

        let versions: Vec<u64> = transport
            .payloads()
            .iter()
            .map(|json| Frame::decode(json).unwrap().version())
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let space = Uuid::new_v4();

        let broken = attach(&registry, space, HashSet::new()).await;
        broken.fail_writes();
        dispatcher
            .broadcast(&delta(space, Model::Intentions, 1))
            .await
            .unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.frames_dispatched, 1);
        assert_eq!(stats.writes_failed, 1);
    }
}
