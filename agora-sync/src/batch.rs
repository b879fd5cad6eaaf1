//! Coalescing of mutation notifications into batched deltas.
//!
//! Every successful write lands here as a `record_change` call. The
//! first change for a space opens a buffer and arms a flush timer (one
//! window, default 1 s); further changes within the window fold into the
//! same buffer, so a burst of writes (a token stream, a bulk import)
//! costs one broadcast per window instead of one per write.
//!
//! At flush time the buffer is rebuilt against a fresh fetch from the
//! entity store rather than from tracked before/after diffs. The change
//! buckets only carry ids; bodies come from the fetch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::dispatch::BroadcastDispatcher;
use crate::model::{ChangeKind, Model, SpaceId};
use crate::presence::PresenceDeriver;
use crate::protocol::Frame;
use crate::store::SpaceStore;
use crate::version::VersionStore;

/// Changed-entity ids for one model, bucketed by change kind.
#[derive(Debug, Default, Clone)]
pub struct ModelChanges {
    created: HashSet<Uuid>,
    updated: HashSet<Uuid>,
    deleted: HashSet<Uuid>,
}

impl ModelChanges {
    /// Fold a change into the buckets. Later kinds override earlier ones
    /// for the same id: create-then-update stays a create, anything
    /// followed by delete collapses to a delete, and create-then-delete
    /// nets out entirely (subscribers never saw the entity).
    pub fn record(&mut self, entity: Uuid, kind: ChangeKind) {
        match kind {
            ChangeKind::Created => {
                if self.deleted.remove(&entity) {
                    // Delete-then-recreate within one window: subscribers
                    // still hold the old row, so it surfaces as an update.
                    self.updated.insert(entity);
                } else {
                    self.created.insert(entity);
                }
            }
            ChangeKind::Updated => {
                if !self.created.contains(&entity) && !self.deleted.contains(&entity) {
                    self.updated.insert(entity);
                }
            }
            ChangeKind::Deleted => {
                if self.created.remove(&entity) {
                    return;
                }
                self.updated.remove(&entity);
                self.deleted.insert(entity);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Ephemeral per-space buffer; lives for at most one window.
#[derive(Debug, Default)]
struct DeltaBuffer {
    generation: u64,
    changes: HashMap<Model, ModelChanges>,
}

pub struct DeltaBatcher {
    window: Duration,
    store: Arc<dyn SpaceStore>,
    versions: Arc<VersionStore>,
    dispatcher: Arc<BroadcastDispatcher>,
    presence: Arc<PresenceDeriver>,
    buffers: Mutex<HashMap<SpaceId, DeltaBuffer>>,
    /// Serializes flushes so version order equals dispatch order.
    flush_lock: Mutex<()>,
    generations: AtomicU64,
}

impl DeltaBatcher {
    pub fn new(
        window: Duration,
        store: Arc<dyn SpaceStore>,
        versions: Arc<VersionStore>,
        dispatcher: Arc<BroadcastDispatcher>,
        presence: Arc<PresenceDeriver>,
    ) -> Self {
        Self {
            window,
            store,
            versions,
            dispatcher,
            presence,
            buffers: Mutex::new(HashMap::new()),
            flush_lock: Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    /// Record a mutation for later batched broadcast. The first change
    /// for a space arms the flush timer; the timer is not extended by
    /// further changes, so a steady write stream still flushes once per
    /// window.
    pub async fn record_change(
        self: &Arc<Self>,
        space: SpaceId,
        entity: Uuid,
        model: Model,
        kind: ChangeKind,
    ) {
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers.entry(space).or_insert_with(|| {
            let generation = self.generations.fetch_add(1, Ordering::Relaxed);
            let batcher = Arc::clone(self);
            let window = self.window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                batcher.flush_generation(space, generation).await;
            });
            DeltaBuffer {
                generation,
                ..DeltaBuffer::default()
            }
        });
        buffer.changes.entry(model).or_default().record(entity, kind);
        log::trace!("Buffered {kind:?} of {entity} ({model}) for space {space}");
    }

    /// Flush a space's buffer immediately, regardless of the timer.
    /// The armed timer then finds no buffer and does nothing.
    pub async fn flush_now(self: &Arc<Self>, space: SpaceId) {
        let buffer = self.buffers.lock().await.remove(&space);
        if let Some(buffer) = buffer {
            self.flush_buffer(space, buffer).await;
        }
    }

    /// Number of changes currently buffered for a space.
    pub async fn pending(&self, space: SpaceId) -> usize {
        self.buffers
            .lock()
            .await
            .get(&space)
            .map(|b| b.changes.values().map(ModelChanges::len).sum())
            .unwrap_or(0)
    }

    /// Timer-driven flush. Only fires if the buffer it armed for is
    /// still the current one; a `flush_now` in between wins.
    async fn flush_generation(self: &Arc<Self>, space: SpaceId, generation: u64) {
        let buffer = {
            let mut buffers = self.buffers.lock().await;
            match buffers.get(&space) {
                Some(b) if b.generation == generation => buffers.remove(&space),
                _ => None,
            }
        };
        if let Some(buffer) = buffer {
            self.flush_buffer(space, buffer).await;
        }
    }

    async fn flush_buffer(self: &Arc<Self>, space: SpaceId, buffer: DeltaBuffer) {
        let _guard = self.flush_lock.lock().await;

        for model in Model::ALL {
            let changes = match buffer.changes.get(&model) {
                Some(c) if !c.is_empty() => c.clone(),
                _ => continue,
            };
            match self.build_delta(space, model, &changes).await {
                Ok(frame) => {
                    self.versions
                        .record_broadcast(space, model, frame.clone())
                        .await;
                    match self.dispatcher.broadcast(&frame).await {
                        Ok(outcome) => {
                            log::debug!(
                                "Flushed {} changes for space {space} ({model}) to {} connections at version {}",
                                changes.len(),
                                outcome.delivered,
                                frame.version()
                            );
                            self.note_presence_drops(space, &outcome.dropped).await;
                        }
                        Err(e) => log::error!("Broadcast failed for space {space}: {e}"),
                    }
                }
                Err(e) => {
                    log::error!("Delta build failed for space {space} ({model}): {e}");
                }
            }
        }
    }

    /// Rebuild the delta against a fresh entity fetch. Ids marked
    /// created/updated that no longer exist are reported as deletions.
    async fn build_delta(
        &self,
        space: SpaceId,
        model: Model,
        changes: &ModelChanges,
    ) -> Result<Frame, crate::error::SyncError> {
        let mut fresh: HashMap<Uuid, serde_json::Value> = HashMap::new();
        match model {
            Model::Beings => {
                for being in self.store.beings_in(space)? {
                    let wire = self.presence.to_wire(&being).await;
                    fresh.insert(being.id, wire);
                }
            }
            Model::Intentions => {
                for intention in self.store.intentions_in(space)? {
                    fresh.insert(intention.id, serde_json::to_value(&intention)?);
                }
            }
        }

        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut deleted: Vec<Uuid> = changes.deleted.iter().copied().collect();

        for id in &changes.created {
            match fresh.get(id) {
                Some(value) => created.push(value.clone()),
                None => deleted.push(*id),
            }
        }
        for id in &changes.updated {
            match fresh.get(id) {
                Some(value) => updated.push(value.clone()),
                None => deleted.push(*id),
            }
        }
        deleted.sort_unstable();
        deleted.dedup();

        let version = self.versions.bump(space, model).await;
        Ok(Frame::SpaceDelta {
            space,
            model,
            version,
            timestamp: Utc::now().timestamp_millis(),
            created,
            updated,
            deleted,
        })
    }

    /// Connections dropped mid-broadcast may have taken an identity
    /// offline; surface that as a being update so subscribers see the
    /// presence flip.
    async fn note_presence_drops(
        self: &Arc<Self>,
        space: SpaceId,
        dropped: &[crate::registry::RemovedConnection],
    ) {
        for removed in dropped {
            if !removed.last_for_identity {
                continue;
            }
            let Some(identity) = removed.connection.identity else {
                continue;
            };
            match self.store.being(identity) {
                Ok(Some(being)) if being.space_id == space => {
                    // Route the recursive re-entry through a boxed `Send`
                    // future in a submodule to break the auto-trait
                    // inference cycle (this path re-enters `record_change`,
                    // which arms a `tokio::spawn`). The call stays awaited
                    // inline, so ordering is unchanged.
                    recur::record_change(
                        Arc::clone(self),
                        space,
                        identity,
                        Model::Beings,
                        ChangeKind::Updated,
                    )
                    .await;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Presence lookup for {identity} failed: {e}"),
            }
        }
    }
}

/// Boxed re-entry point for the recursive `record_change` call made by
/// `note_presence_drops`. Living in its own module puts the cast outside
/// the opaque-type defining scope, which lets the `Send` bound be proven
/// across the recursion cycle.
mod recur {
    use super::*;

    pub(super) fn record_change(
        batcher: Arc<DeltaBatcher>,
        space: SpaceId,
        entity: Uuid,
        model: Model,
        kind: ChangeKind,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            batcher.record_change(space, entity, model, kind).await;
        })
    }
}
