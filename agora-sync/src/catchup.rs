//! Reconnection and catch-up resolution.
//!
//! A connecting client either gets the full current state (no marker)
//! or the tail of changes since a marker it supplies, capped to bound
//! payload size. The resolver never decides whether a later full resync
//! is required; clients detect version gaps themselves and reconnect.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::SyncError;
use crate::model::{Model, SpaceId};
use crate::presence::PresenceDeriver;
use crate::protocol::Frame;
use crate::store::SpaceStore;
use crate::version::VersionStore;

pub const DEFAULT_CATCHUP_CAP: usize = 50;

/// A client-supplied catch-up marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceMarker {
    /// Unix milliseconds.
    Timestamp(i64),
    /// A version previously observed for the (space, model) key.
    Version(u64),
}

impl SinceMarker {
    /// Parse the wire form: a bare integer is unix milliseconds, a
    /// `v`-prefixed integer is a version (`since=v42`).
    pub fn parse(raw: &str) -> Option<SinceMarker> {
        let raw = raw.trim();
        if let Some(version) = raw.strip_prefix('v') {
            return version.parse().ok().map(SinceMarker::Version);
        }
        raw.parse().ok().map(SinceMarker::Timestamp)
    }
}

pub struct CatchupResolver {
    store: Arc<dyn SpaceStore>,
    versions: Arc<VersionStore>,
    presence: Arc<PresenceDeriver>,
    cap: usize,
}

impl CatchupResolver {
    pub fn new(
        store: Arc<dyn SpaceStore>,
        versions: Arc<VersionStore>,
        presence: Arc<PresenceDeriver>,
        cap: usize,
    ) -> Self {
        Self {
            store,
            versions,
            presence,
            cap,
        }
    }

    /// Resolve the initial payload for a connection.
    pub async fn resolve(
        &self,
        space: SpaceId,
        model: Model,
        since: Option<SinceMarker>,
    ) -> Result<Frame, SyncError> {
        match since {
            None => self.snapshot(space, model).await,
            Some(marker) => match self.marker_to_time(space, model, marker).await {
                Some(cutoff) => self.tail(space, model, cutoff).await,
                // Marker too old to resolve: a full snapshot is always a
                // safe answer.
                None => self.snapshot(space, model).await,
            },
        }
    }

    /// Full current state, fetched fresh. The first snapshot of a key
    /// initializes its version sequence.
    pub async fn snapshot(&self, space: SpaceId, model: Model) -> Result<Frame, SyncError> {
        let data = self.fetch_all(space, model).await?;
        let mut version = self.versions.current(space, model).await;
        if version == 0 {
            version = self.versions.bump(space, model).await;
        }
        Ok(Frame::Snapshot {
            space,
            model,
            version,
            timestamp: Utc::now().timestamp_millis(),
            data,
        })
    }

    async fn tail(
        &self,
        space: SpaceId,
        model: Model,
        cutoff: DateTime<Utc>,
    ) -> Result<Frame, SyncError> {
        let mut data = self.fetch_modified_since(space, model, cutoff).await?;
        if data.len() > self.cap {
            log::debug!(
                "Catch-up for space {space} ({model}) truncated from {} to {} records",
                data.len(),
                self.cap
            );
            data.truncate(self.cap);
        }
        Ok(Frame::CatchUp {
            space,
            model,
            version: self.versions.current(space, model).await,
            timestamp: Utc::now().timestamp_millis(),
            data,
        })
    }

    /// Translate a marker into a time cutoff. `None` means the marker
    /// cannot be resolved and the caller should fall back to a snapshot.
    async fn marker_to_time(
        &self,
        space: SpaceId,
        model: Model,
        marker: SinceMarker,
    ) -> Option<DateTime<Utc>> {
        match marker {
            SinceMarker::Timestamp(ms) => Utc.timestamp_millis_opt(ms).single(),
            SinceMarker::Version(v) => self.versions.timestamp_of(space, model, v).await,
        }
    }

    async fn fetch_all(
        &self,
        space: SpaceId,
        model: Model,
    ) -> Result<Vec<serde_json::Value>, SyncError> {
        match model {
            Model::Beings => {
                let mut out = Vec::new();
                for being in self.store.beings_in(space)? {
                    out.push(self.presence.to_wire(&being).await);
                }
                Ok(out)
            }
            Model::Intentions => {
                let mut out = Vec::new();
                for intention in self.store.intentions_in(space)? {
                    out.push(serde_json::to_value(&intention)?);
                }
                Ok(out)
            }
        }
    }

    async fn fetch_modified_since(
        &self,
        space: SpaceId,
        model: Model,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<serde_json::Value>, SyncError> {
        match model {
            Model::Beings => {
                let mut out = Vec::new();
                for being in self.store.beings_modified_since(space, cutoff)? {
                    out.push(self.presence.to_wire(&being).await);
                }
                Ok(out)
            }
            Model::Intentions => {
                let mut out = Vec::new();
                for intention in self.store.intentions_modified_since(space, cutoff)? {
                    out.push(serde_json::to_value(&intention)?);
                }
                Ok(out)
            }
        }
    }
}
