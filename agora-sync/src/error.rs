//! Engine error taxonomy.
//!
//! Transport write failures are deliberately absent here: they are
//! recovered locally by the dispatcher (the failing connection is
//! removed) and never propagated to the writer that triggered a
//! broadcast. See [`crate::transport::TransportError`] for that side.

use uuid::Uuid;

use crate::model::IntentionStatus;

/// Errors surfaced by the sync engine.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// A payload could not be serialized to JSON.
    Serialization(String),
    /// The entity store collaborator reported a failure.
    Store(String),
    /// An illegal intention lifecycle transition was requested.
    InvalidTransition {
        from: IntentionStatus,
        to: IntentionStatus,
    },
    /// The referenced intention does not exist.
    UnknownIntention(Uuid),
    /// The referenced being does not exist.
    UnknownBeing(Uuid),
    /// The referenced connection is not registered.
    UnknownConnection(Uuid),
    /// The intention's generation stream was already finalized.
    AlreadyFinalized(Uuid),
    /// The initial snapshot for a new connection could not be produced.
    SnapshotUnavailable(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Store(e) => write!(f, "Store error: {e}"),
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid lifecycle transition: {from} -> {to}")
            }
            Self::UnknownIntention(id) => write!(f, "Unknown intention: {id}"),
            Self::UnknownBeing(id) => write!(f, "Unknown being: {id}"),
            Self::UnknownConnection(id) => write!(f, "Unknown connection: {id}"),
            Self::AlreadyFinalized(id) => write!(f, "Intention already finalized: {id}"),
            Self::SnapshotUnavailable(e) => write!(f, "Snapshot unavailable: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}
