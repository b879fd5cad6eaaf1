//! Per-(space, model) version counters.
//!
//! Every broadcast for a key carries the next integer in that key's
//! sequence; concurrent writers are serialized behind one lock so
//! versions are never duplicated or skipped. The store also retains the
//! last broadcast frame per key (side-effect-free reads for late
//! joiners) and a bounded ring of recent `(version, timestamp)` pairs so
//! a version-valued catch-up marker can be translated into a time
//! marker.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{Model, SpaceId};
use crate::protocol::Frame;

const DEFAULT_HISTORY: usize = 64;

#[derive(Debug, Default)]
struct VersionEntry {
    version: u64,
    last_broadcast: Option<Frame>,
    /// Recent (version, bump time) pairs, newest at the back.
    history: VecDeque<(u64, DateTime<Utc>)>,
}

/// Process-wide version store. Constructed once at startup and shared by
/// reference; per-key mutation is serialized by the inner lock.
pub struct VersionStore {
    inner: RwLock<HashMap<(SpaceId, Model), VersionEntry>>,
    history_cap: usize,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    pub fn with_history(history_cap: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            history_cap: history_cap.max(1),
        }
    }

    /// Atomically increment and return the new version for the key.
    /// The first bump of a key yields 1.
    pub async fn bump(&self, space: SpaceId, model: Model) -> u64 {
        let mut map = self.inner.write().await;
        let entry = map.entry((space, model)).or_default();
        entry.version += 1;
        entry.history.push_back((entry.version, Utc::now()));
        while entry.history.len() > self.history_cap {
            entry.history.pop_front();
        }
        entry.version
    }

    /// Current version without side effects; 0 for an uninitialized key.
    pub async fn current(&self, space: SpaceId, model: Model) -> u64 {
        self.inner
            .read()
            .await
            .get(&(space, model))
            .map(|e| e.version)
            .unwrap_or(0)
    }

    /// Remember the payload that went out for this key.
    pub async fn record_broadcast(&self, space: SpaceId, model: Model, frame: Frame) {
        let mut map = self.inner.write().await;
        map.entry((space, model)).or_default().last_broadcast = Some(frame);
    }

    /// The last broadcast payload, if any. No side effects.
    pub async fn last_broadcast(&self, space: SpaceId, model: Model) -> Option<Frame> {
        self.inner
            .read()
            .await
            .get(&(space, model))
            .and_then(|e| e.last_broadcast.clone())
    }

    /// When `version` was produced, if it is still inside the retained
    /// ring. `None` means the marker is too old to resolve.
    pub async fn timestamp_of(
        &self,
        space: SpaceId,
        model: Model,
        version: u64,
    ) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .await
            .get(&(space, model))
            .and_then(|e| {
                e.history
                    .iter()
                    .find(|(v, _)| *v == version)
                    .map(|(_, t)| *t)
            })
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}
