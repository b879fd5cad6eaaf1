//! Heartbeat keep-alives and stale connection pruning.
//!
//! One pass per interval: connections whose last heartbeat ack is older
//! than the timeout (2x the interval) are force-closed and removed;
//! every survivor gets a keep-alive comment frame, and a failed
//! keep-alive write removes the connection immediately instead of
//! waiting for the next pass. Timed-out clients get no error frame;
//! they are expected to reconnect and catch up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::registry::{ConnectionRegistry, RemovedConnection};
use crate::transport::WireFrame;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// What one sweep did.
#[derive(Default)]
pub struct SweepOutcome {
    /// Removed because the heartbeat timeout elapsed.
    pub expired: Vec<RemovedConnection>,
    /// Removed because the keep-alive write failed.
    pub broken: Vec<RemovedConnection>,
    /// Keep-alives delivered.
    pub kept: usize,
}

impl SweepOutcome {
    /// All removals, regardless of cause.
    pub fn removed(&self) -> impl Iterator<Item = &RemovedConnection> {
        self.expired.iter().chain(self.broken.iter())
    }
}

pub struct HeartbeatSweeper {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatSweeper {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout: interval * 2,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one sweep over a registry snapshot.
    pub async fn sweep(&self) -> SweepOutcome {
        let now = Instant::now();
        let mut outcome = SweepOutcome::default();

        for conn in self.registry.snapshot().await {
            if now.duration_since(conn.last_heartbeat()) > self.timeout {
                log::info!(
                    "Connection {} timed out (no heartbeat ack in {:?})",
                    conn.id,
                    self.timeout
                );
                if let Some(removed) = self.registry.remove(conn.id).await {
                    outcome.expired.push(removed);
                }
                continue;
            }
            match conn.transport.send(&WireFrame::Heartbeat) {
                Ok(()) => outcome.kept += 1,
                Err(e) => {
                    log::info!("Keep-alive to connection {} failed ({e})", conn.id);
                    if let Some(removed) = self.registry.remove(conn.id).await {
                        outcome.broken.push(removed);
                    }
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Connection;
    use crate::transport::{RecordingTransport, Transport};
    use std::collections::HashSet;
    use uuid::Uuid;

    async fn attach(registry: &ConnectionRegistry) -> (Uuid, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let conn = Connection::new(Uuid::new_v4(), None, HashSet::new(), transport.clone());
        let id = conn.id;
        registry.register(conn).await;
        (id, transport)
    }

    #[tokio::test]
    async fn test_healthy_connections_get_keepalives() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sweeper = HeartbeatSweeper::new(registry.clone(), Duration::from_secs(20));
        let (_, transport) = attach(&registry).await;

        let outcome = sweeper.sweep().await;
        assert_eq!(outcome.kept, 1);
        assert!(outcome.expired.is_empty());
        assert_eq!(transport.heartbeat_count(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_expired_connection_removed_not_earlier() {
        let registry = Arc::new(ConnectionRegistry::new());
        // 10ms interval -> 20ms timeout.
        let sweeper = HeartbeatSweeper::new(registry.clone(), Duration::from_millis(10));
        let (id, transport) = attach(&registry).await;

        // Young connection survives a sweep.
        let outcome = sweeper.sweep().await;
        assert!(outcome.expired.is_empty());
        assert!(registry.contains(id).await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let outcome = sweeper.sweep().await;
        assert_eq!(outcome.expired.len(), 1);
        assert!(!registry.contains(id).await);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_heartbeat_ack_defers_expiry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sweeper = HeartbeatSweeper::new(registry.clone(), Duration::from_millis(10));
        let (id, _) = attach(&registry).await;

        tokio::time::sleep(Duration::from_millis(15)).await;
        registry.touch(id).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // 25ms since registration but only 10ms since the ack.
        let outcome = sweeper.sweep().await;
        assert!(outcome.expired.is_empty());
        assert!(registry.contains(id).await);
    }

    #[tokio::test]
    async fn test_broken_keepalive_removes_immediately() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sweeper = HeartbeatSweeper::new(registry.clone(), Duration::from_secs(20));
        let (id, transport) = attach(&registry).await;
        transport.fail_writes();

        let outcome = sweeper.sweep().await;
        assert_eq!(outcome.broken.len(), 1);
        assert_eq!(outcome.kept, 0);
        assert!(!registry.contains(id).await);
    }

    #[tokio::test]
    async fn test_timeout_is_twice_interval() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sweeper = HeartbeatSweeper::new(registry, Duration::from_secs(15));
        assert_eq!(sweeper.timeout(), Duration::from_secs(30));
    }
}
