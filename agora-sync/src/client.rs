//! Client-side view of a space.
//!
//! Transport-agnostic: whatever channel the frames arrive over, a
//! [`SpaceView`] applies them to a local cache and tracks the expected
//! next version per model. A delta that skips ahead (observed version
//! greater than expected + 1) marks the model as needing a resync; the
//! client then reconnects with a catch-up marker or asks for a fresh
//! snapshot. Gaps are an expected, recoverable condition, not a fault.
//!
//! Reconnection uses bounded exponential backoff with an attempt
//! ceiling; the constants are tunable, the shape is not.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use uuid::Uuid;

use crate::model::{Model, SpaceId};
use crate::protocol::Frame;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Bounded exponential reconnect backoff.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based), or `None`
    /// once the ceiling is reached and the client should give up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt);
        Some(self.base.saturating_mul(factor).min(self.max))
    }
}

/// Result of applying one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Applied,
    /// A version was skipped; the model needs a resync.
    GapDetected { expected: u64, observed: u64 },
    /// Duplicate or stale frame, dropped.
    Stale,
    /// Frame for another space, dropped.
    WrongSpace,
}

/// Local cache of one space's entities, keyed by entity id.
pub struct SpaceView {
    space: SpaceId,
    versions: HashMap<Model, u64>,
    entities: HashMap<Model, HashMap<Uuid, serde_json::Value>>,
    needs_resync: HashSet<Model>,
}

impl SpaceView {
    pub fn new(space: SpaceId) -> Self {
        Self {
            space,
            versions: HashMap::new(),
            entities: HashMap::new(),
            needs_resync: HashSet::new(),
        }
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Last applied version for a model; 0 before any frame arrived.
    pub fn version(&self, model: Model) -> u64 {
        self.versions.get(&model).copied().unwrap_or(0)
    }

    pub fn needs_resync(&self, model: Model) -> bool {
        self.needs_resync.contains(&model)
    }

    pub fn entities(&self, model: Model) -> Vec<&serde_json::Value> {
        self.entities
            .get(&model)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    pub fn entity(&self, model: Model, id: Uuid) -> Option<&serde_json::Value> {
        self.entities.get(&model)?.get(&id)
    }

    pub fn len(&self, model: Model) -> usize {
        self.entities.get(&model).map(|m| m.len()).unwrap_or(0)
    }

    /// Apply one frame to the cache.
    ///
    /// Snapshots replace the model's cache and clear any resync flag;
    /// catch-ups upsert (they are an explicit resync path, so version
    /// jumps are fine); deltas must carry exactly the next version.
    pub fn apply(&mut self, frame: &Frame) -> ApplyResult {
        if frame.space() != self.space {
            return ApplyResult::WrongSpace;
        }
        let model = frame.model();

        match frame {
            Frame::Snapshot { version, data, .. } => {
                let cache: HashMap<Uuid, serde_json::Value> = data
                    .iter()
                    .filter_map(|v| Some((entity_id(v)?, v.clone())))
                    .collect();
                self.entities.insert(model, cache);
                self.versions.insert(model, *version);
                self.needs_resync.remove(&model);
                ApplyResult::Applied
            }
            Frame::CatchUp { version, data, .. } => {
                let cache = self.entities.entry(model).or_default();
                for value in data {
                    if let Some(id) = entity_id(value) {
                        cache.insert(id, value.clone());
                    }
                }
                self.versions.insert(model, *version);
                self.needs_resync.remove(&model);
                ApplyResult::Applied
            }
            Frame::SpaceDelta {
                version,
                created,
                updated,
                deleted,
                ..
            } => {
                let expected = self.version(model);
                if *version <= expected {
                    return ApplyResult::Stale;
                }
                if *version > expected + 1 {
                    self.needs_resync.insert(model);
                    return ApplyResult::GapDetected {
                        expected: expected + 1,
                        observed: *version,
                    };
                }
                let cache = self.entities.entry(model).or_default();
                for value in created.iter().chain(updated.iter()) {
                    if let Some(id) = entity_id(value) {
                        cache.insert(id, value.clone());
                    }
                }
                for id in deleted {
                    cache.remove(id);
                }
                self.versions.insert(model, *version);
                ApplyResult::Applied
            }
        }
    }
}

fn entity_id(value: &serde_json::Value) -> Option<Uuid> {
    value
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}
