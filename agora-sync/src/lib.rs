//! # agora-sync — Real-time space synchronization engine
//!
//! Keeps every connected client of a "space" (a chat room of beings and
//! intentions) consistent with server-held state: versioned snapshots,
//! batched deltas fanned out over a long-lived push channel,
//! reconnection catch-up, heartbeat pruning, live presence, and a
//! rate-limited relay for token-by-token generated content.
//!
//! ## Architecture
//!
//! ```text
//! mutation (create/update/delete)          connect(space, types, since)
//!        │                                          │
//!        ▼                                          ▼
//!  DeltaBatcher ── window (1s) ──┐          CatchupResolver
//!        │                       │                  │ snapshot / tail
//!        ▼                       │                  ▼
//!  SpaceStore (fresh fetch)      │          ChannelTransport ──► client
//!        │                       │                  │
//!        ▼                       ▼                  ▼
//!  VersionStore bump ──► BroadcastDispatcher ──► ConnectionRegistry
//!                                │                  ▲
//!                                ▼                  │
//!                       every space connection   HeartbeatSweeper
//! ```
//!
//! All broadcasts for one (space, model) pair carry a strictly
//! increasing version and reach that space's live connections in
//! dispatch order. A connection that cannot be written to is removed
//! and recovers by reconnecting with a catch-up marker; a version gap
//! observed client-side triggers the same path. State lives in one
//! process; fan-out across processes is explicitly out of scope.
//!
//! ## Modules
//!
//! - [`model`] — beings, intentions, lifecycle state machine
//! - [`protocol`] — JSON wire frames and SSE framing
//! - [`transport`] — the transport seam and the channel transport
//! - [`store`] — entity store collaborator trait + in-memory impl
//! - [`version`] — per-(space, model) version counters
//! - [`registry`] — open connection registry
//! - [`batch`] — mutation coalescing into batched deltas
//! - [`dispatch`] — fan-out with per-connection failure isolation
//! - [`catchup`] — snapshot vs. catch-up resolution on connect
//! - [`presence`] — liveness derived from the registry
//! - [`sweeper`] — keep-alives and stale pruning
//! - [`relay`] — token streaming for generated content
//! - [`client`] — client cache, gap detection, reconnect backoff
//! - [`engine`] — the façade wiring it all together
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications,
//! Chapter 5 (replication) and Chapter 8 (broadcast protocols).

pub mod batch;
pub mod catchup;
pub mod client;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod store;
pub mod sweeper;
pub mod transport;
pub mod version;

// Re-exports for convenience
pub use batch::{DeltaBatcher, ModelChanges};
pub use catchup::{CatchupResolver, SinceMarker, DEFAULT_CATCHUP_CAP};
pub use client::{ApplyResult, ConnectionState, ReconnectPolicy, SpaceView};
pub use dispatch::{BroadcastDispatcher, BroadcastOutcome, DispatchStats};
pub use engine::{ConnectParams, ConnectionHandle, EngineConfig, SyncEngine};
pub use error::SyncError;
pub use model::{
    Being, BeingKind, ChangeKind, Intention, IntentionStatus, Model, SpaceId,
};
pub use presence::PresenceDeriver;
pub use protocol::{ErrorFrame, Frame, HEARTBEAT_SSE};
pub use registry::{Connection, ConnectionRegistry, RemovedConnection};
pub use relay::{StreamOutcome, StreamingRelay, TokenFlush, DEFAULT_RELAY_FLUSH};
pub use store::{MemoryStore, SpaceStore, StoreError};
pub use sweeper::{HeartbeatSweeper, SweepOutcome, DEFAULT_HEARTBEAT_INTERVAL};
pub use transport::{ChannelTransport, RecordingTransport, Transport, TransportError, WireFrame};
pub use version::VersionStore;
