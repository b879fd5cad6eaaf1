//! JSON wire protocol for space synchronization.
//!
//! One frame describes one (space, model) pair so that every frame
//! carries exactly one version sequence:
//!
//! ```text
//! {"type":"snapshot",   "space":…, "model":"beings",     "version":3, "timestamp":…, "data":[…]}
//! {"type":"space-delta","space":…, "model":"intentions", "version":4, "timestamp":…,
//!                       "created":[…], "updated":[…], "deleted":[…]}
//! {"type":"catch-up",   "space":…, "model":"intentions", "version":4, "timestamp":…, "data":[…]}
//! ```
//!
//! Over the push channel each frame is rendered as an SSE message
//! (`data: <json>\n\n`); heartbeats are comment-only frames
//! (`: heartbeat\n\n`) which clients ignore but intermediaries see as
//! traffic. A single error frame (`{"error":true,"message":…}`) may be
//! sent before the server closes a connection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{Model, SpaceId};

/// A versioned payload frame for one (space, model) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Full current state for the model.
    Snapshot {
        space: SpaceId,
        model: Model,
        version: u64,
        /// Unix milliseconds.
        timestamp: i64,
        data: Vec<serde_json::Value>,
    },
    /// Batched description of what changed since the last broadcast.
    SpaceDelta {
        space: SpaceId,
        model: Model,
        version: u64,
        timestamp: i64,
        created: Vec<serde_json::Value>,
        updated: Vec<serde_json::Value>,
        deleted: Vec<Uuid>,
    },
    /// Tail of changes since a client-supplied marker. Unlike a snapshot
    /// it does not replace the client's cache, only upserts into it.
    CatchUp {
        space: SpaceId,
        model: Model,
        version: u64,
        timestamp: i64,
        data: Vec<serde_json::Value>,
    },
}

impl Frame {
    pub fn space(&self) -> SpaceId {
        match self {
            Frame::Snapshot { space, .. }
            | Frame::SpaceDelta { space, .. }
            | Frame::CatchUp { space, .. } => *space,
        }
    }

    pub fn model(&self) -> Model {
        match self {
            Frame::Snapshot { model, .. }
            | Frame::SpaceDelta { model, .. }
            | Frame::CatchUp { model, .. } => *model,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Frame::Snapshot { version, .. }
            | Frame::SpaceDelta { version, .. }
            | Frame::CatchUp { version, .. } => *version,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn decode(json: &str) -> Result<Frame, SyncError> {
        serde_json::from_str(json).map_err(Into::into)
    }

    /// Render as a complete SSE message.
    pub fn to_sse(&self) -> Result<String, SyncError> {
        Ok(sse_data(&self.encode()?))
    }
}

/// One-shot error frame, sent before the server closes the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: bool,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: true,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            // A struct of two primitives cannot fail to serialize; keep a
            // hand-written fallback anyway so encode stays infallible.
            "{\"error\":true,\"message\":\"internal error\"}".to_string()
        })
    }
}

/// SSE comment frame used as a keep-alive.
pub const HEARTBEAT_SSE: &str = ": heartbeat\n\n";

/// Wrap a JSON payload in SSE message framing.
pub fn sse_data(json: &str) -> String {
    format!("data: {json}\n\n")
}
