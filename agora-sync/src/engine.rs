//! The engine façade.
//!
//! Owns every component (registry, version store, batcher, dispatcher,
//! catch-up resolver, presence deriver, heartbeat sweeper, streaming
//! relay), constructed once at startup around an injected entity store
//! and shared by reference. Nothing here is a process global.
//!
//! Outward surface, in collaborator terms:
//! - `connect` / `disconnect` / `heartbeat_ack` for the transport layer;
//! - `notify_mutation` for the persistence-mutation layer (the mutation
//!   helpers below write through the store and call it themselves);
//! - `append_token` / `finalize_intention` for the generation backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::batch::DeltaBatcher;
use crate::catchup::{CatchupResolver, SinceMarker, DEFAULT_CATCHUP_CAP};
use crate::dispatch::BroadcastDispatcher;
use crate::error::SyncError;
use crate::model::{Being, ChangeKind, Intention, IntentionStatus, Model, SpaceId};
use crate::presence::PresenceDeriver;
use crate::registry::{Connection, ConnectionRegistry};
use crate::relay::{StreamOutcome, StreamingRelay, DEFAULT_RELAY_FLUSH};
use crate::store::SpaceStore;
use crate::sweeper::{HeartbeatSweeper, DEFAULT_HEARTBEAT_INTERVAL};
use crate::transport::{ChannelTransport, Transport, WireFrame};
use crate::version::VersionStore;

/// Engine tunables. The defaults match the reference deployment; tests
/// shrink the windows.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delta coalescing window.
    pub batch_window: Duration,
    /// Keep-alive interval; the stale timeout is twice this.
    pub heartbeat_interval: Duration,
    /// Minimum spacing between streamed-content persists.
    pub relay_flush_interval: Duration,
    /// Catch-up payload cap, in records.
    pub catchup_cap: usize,
    /// Per-connection outbound queue capacity.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_secs(1),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            relay_flush_interval: DEFAULT_RELAY_FLUSH,
            catchup_cap: DEFAULT_CATCHUP_CAP,
            channel_capacity: 256,
        }
    }
}

/// Parameters of one connect request, after credential resolution.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub space_id: SpaceId,
    pub identity: Option<Uuid>,
    /// Subscribed models; empty means all.
    pub models: HashSet<Model>,
    pub since: Option<SinceMarker>,
}

impl ConnectParams {
    pub fn new(space_id: SpaceId) -> Self {
        Self {
            space_id,
            identity: None,
            models: HashSet::new(),
            since: None,
        }
    }

    pub fn with_identity(mut self, identity: Uuid) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_models(mut self, models: impl IntoIterator<Item = Model>) -> Self {
        self.models = models.into_iter().collect();
        self
    }

    pub fn with_since(mut self, since: SinceMarker) -> Self {
        self.since = Some(since);
        self
    }
}

/// What `connect` hands the transport layer: the registered connection
/// id (for heartbeat acks) and the outbound frame stream, primed with
/// the initial snapshot or catch-up payload.
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub frames: mpsc::Receiver<WireFrame>,
}

pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn SpaceStore>,
    registry: Arc<ConnectionRegistry>,
    versions: Arc<VersionStore>,
    presence: Arc<PresenceDeriver>,
    batcher: Arc<DeltaBatcher>,
    resolver: CatchupResolver,
    relay: StreamingRelay,
    sweeper: HeartbeatSweeper,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn SpaceStore>, config: EngineConfig) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let versions = Arc::new(VersionStore::new());
        let presence = Arc::new(PresenceDeriver::new(registry.clone()));
        let dispatcher = Arc::new(BroadcastDispatcher::new(registry.clone()));
        let batcher = Arc::new(DeltaBatcher::new(
            config.batch_window,
            store.clone(),
            versions.clone(),
            dispatcher,
            presence.clone(),
        ));
        let resolver = CatchupResolver::new(
            store.clone(),
            versions.clone(),
            presence.clone(),
            config.catchup_cap,
        );
        let relay = StreamingRelay::new(store.clone(), config.relay_flush_interval);
        let sweeper = HeartbeatSweeper::new(registry.clone(), config.heartbeat_interval);

        Arc::new(Self {
            config,
            store,
            registry,
            versions,
            presence,
            batcher,
            resolver,
            relay,
            sweeper,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceDeriver {
        &self.presence
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    pub fn store(&self) -> &Arc<dyn SpaceStore> {
        &self.store
    }

    /// Spawn the heartbeat sweep loop. Runs until the handle is aborted
    /// or the runtime shuts down.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.sweeper.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.sweep_now().await;
            }
        })
    }

    /// Run one heartbeat sweep, surfacing presence flips for identities
    /// whose last connection was pruned.
    pub async fn sweep_now(&self) -> usize {
        let outcome = self.sweeper.sweep().await;
        let mut removed = 0;
        for gone in outcome.removed() {
            removed += 1;
            if gone.last_for_identity {
                if let Some(identity) = gone.connection.identity {
                    self.note_presence_change(identity).await;
                }
            }
        }
        removed
    }

    /// Open a push connection: resolve the initial payload, prime the
    /// outbound channel with it, and register for future broadcasts.
    ///
    /// A resolution failure returns the error before anything is
    /// registered; the caller sends the one error frame and closes.
    pub async fn connect(&self, params: ConnectParams) -> Result<ConnectionHandle, SyncError> {
        let mut initial = Vec::new();
        for model in Model::ALL {
            if !params.models.is_empty() && !params.models.contains(&model) {
                continue;
            }
            initial.push(
                self.resolver
                    .resolve(params.space_id, model, params.since)
                    .await?,
            );
        }

        let (transport, frames) = ChannelTransport::new(self.config.channel_capacity);
        let transport: Arc<dyn Transport> = Arc::new(transport);
        for frame in initial {
            transport
                .send(&WireFrame::Data(frame.encode()?))
                .map_err(|e| SyncError::SnapshotUnavailable(e.to_string()))?;
        }

        let connection = Connection::new(
            params.space_id,
            params.identity,
            params.models,
            transport,
        );
        let connection_id = connection.id;
        let came_online = self.registry.register(connection).await;
        log::info!(
            "Connection {connection_id} joined space {} (identity: {:?})",
            params.space_id,
            params.identity
        );

        if came_online {
            if let Some(identity) = params.identity {
                self.note_presence_change(identity).await;
            }
        }

        Ok(ConnectionHandle {
            connection_id,
            frames,
        })
    }

    /// Deregister a connection (client disconnect, stream dropped).
    pub async fn disconnect(&self, connection_id: Uuid) {
        if let Some(removed) = self.registry.remove(connection_id).await {
            if removed.last_for_identity {
                if let Some(identity) = removed.connection.identity {
                    self.note_presence_change(identity).await;
                }
            }
        }
    }

    /// Refresh a connection's liveness clock. Returns false for an
    /// unknown (already pruned) connection.
    pub async fn heartbeat_ack(&self, connection_id: Uuid) -> bool {
        self.registry.touch(connection_id).await
    }

    /// Entry point for the persistence-mutation layer: called after
    /// every successful write.
    pub async fn notify_mutation(
        &self,
        space: SpaceId,
        entity: Uuid,
        model: Model,
        kind: ChangeKind,
    ) {
        self.batcher.record_change(space, entity, model, kind).await;
    }

    /// Force the space's pending delta out immediately.
    pub async fn flush_now(&self, space: SpaceId) {
        self.batcher.flush_now(space).await;
    }

    // ── Generation backend surface ────────────────────────────────────

    pub async fn append_token(&self, intention_id: Uuid, token: &str) -> Result<(), SyncError> {
        let flush = self.relay.append_token(intention_id, token).await?;
        if flush.persisted {
            self.notify_mutation(
                flush.space_id,
                intention_id,
                Model::Intentions,
                ChangeKind::Updated,
            )
            .await;
        }
        Ok(())
    }

    pub async fn finalize_intention(
        &self,
        intention_id: Uuid,
        outcome: StreamOutcome,
        content: Option<String>,
    ) -> Result<(), SyncError> {
        let space = self.relay.finalize(intention_id, outcome, content).await?;
        self.notify_mutation(space, intention_id, Model::Intentions, ChangeKind::Updated)
            .await;
        Ok(())
    }

    // ── Mutation helpers (write through the store, then notify) ───────

    pub async fn create_being(&self, being: Being) -> Result<Being, SyncError> {
        self.store.upsert_being(being.clone())?;
        self.notify_mutation(being.space_id, being.id, Model::Beings, ChangeKind::Created)
            .await;
        Ok(being)
    }

    pub async fn update_being(&self, mut being: Being) -> Result<Being, SyncError> {
        if self.store.being(being.id)?.is_none() {
            return Err(SyncError::UnknownBeing(being.id));
        }
        being.touch();
        self.store.upsert_being(being.clone())?;
        self.notify_mutation(being.space_id, being.id, Model::Beings, ChangeKind::Updated)
            .await;
        Ok(being)
    }

    pub async fn delete_being(&self, id: Uuid) -> Result<(), SyncError> {
        let being = self.store.being(id)?.ok_or(SyncError::UnknownBeing(id))?;
        self.store.delete_being(id)?;
        self.notify_mutation(being.space_id, id, Model::Beings, ChangeKind::Deleted)
            .await;
        Ok(())
    }

    pub async fn create_intention(&self, intention: Intention) -> Result<Intention, SyncError> {
        self.store.upsert_intention(intention.clone())?;
        self.notify_mutation(
            intention.space_id,
            intention.id,
            Model::Intentions,
            ChangeKind::Created,
        )
        .await;
        Ok(intention)
    }

    /// Apply a lifecycle transition. Illegal transitions are rejected
    /// and nothing is written or broadcast.
    pub async fn update_intention_status(
        &self,
        id: Uuid,
        next: IntentionStatus,
    ) -> Result<Intention, SyncError> {
        let mut intention = self
            .store
            .intention(id)?
            .ok_or(SyncError::UnknownIntention(id))?;
        intention.transition(next)?;
        self.store.upsert_intention(intention.clone())?;
        self.notify_mutation(
            intention.space_id,
            id,
            Model::Intentions,
            ChangeKind::Updated,
        )
        .await;
        Ok(intention)
    }

    pub async fn append_intention_content(
        &self,
        id: Uuid,
        element: String,
    ) -> Result<Intention, SyncError> {
        let mut intention = self
            .store
            .intention(id)?
            .ok_or(SyncError::UnknownIntention(id))?;
        intention.content.push(element);
        intention.touch();
        self.store.upsert_intention(intention.clone())?;
        self.notify_mutation(
            intention.space_id,
            id,
            Model::Intentions,
            ChangeKind::Updated,
        )
        .await;
        Ok(intention)
    }

    pub async fn delete_intention(&self, id: Uuid) -> Result<(), SyncError> {
        let intention = self
            .store
            .intention(id)?
            .ok_or(SyncError::UnknownIntention(id))?;
        self.store.delete_intention(id)?;
        self.notify_mutation(
            intention.space_id,
            id,
            Model::Intentions,
            ChangeKind::Deleted,
        )
        .await;
        Ok(())
    }

    /// A mutated being may have flipped presence; surface it as a
    /// normal being update so subscribers re-derive.
    async fn note_presence_change(&self, identity: Uuid) {
        match self.store.being(identity) {
            Ok(Some(being)) => {
                self.notify_mutation(
                    being.space_id,
                    identity,
                    Model::Beings,
                    ChangeKind::Updated,
                )
                .await;
            }
            Ok(None) => {}
            Err(e) => log::warn!("Presence lookup for {identity} failed: {e}"),
        }
    }
}
