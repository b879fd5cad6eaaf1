//! The transport seam between the engine and a concrete push channel.
//!
//! The engine is transport-agnostic: everything it writes goes through
//! [`Transport::send`], and the dispatcher treats any send failure as the
//! connection being gone. The canonical implementation is
//! [`ChannelTransport`], a bounded queue drained by the HTTP layer into a
//! long-lived SSE response; alternate transports (a WebSocket writer, a
//! data-channel bridge) plug in behind the same trait.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::protocol::{sse_data, HEARTBEAT_SSE};

/// What a connection actually carries: either a JSON payload or a
/// keep-alive. Framing (SSE, WebSocket text, …) is the transport's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// A JSON payload (snapshot, delta, catch-up or error frame).
    Data(String),
    /// Keep-alive with no payload.
    Heartbeat,
}

impl WireFrame {
    /// Render as SSE text (`data: …\n\n` / `: heartbeat\n\n`).
    pub fn to_sse(&self) -> String {
        match self {
            WireFrame::Data(json) => sse_data(json),
            WireFrame::Heartbeat => HEARTBEAT_SSE.to_string(),
        }
    }
}

/// A failed write. The dispatcher reacts identically to both variants:
/// the connection is removed and fan-out continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is gone (receiver dropped or transport closed).
    Closed,
    /// The outbound queue is full; the consumer is too slow to keep.
    Backpressure,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Transport closed"),
            Self::Backpressure => write!(f, "Transport queue full"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One connection's outbound channel.
pub trait Transport: Send + Sync {
    /// Fire-and-forget write. Must not block.
    fn send(&self, frame: &WireFrame) -> Result<(), TransportError>;

    /// Force the channel shut; subsequent sends fail with `Closed`.
    fn close(&self);

    /// Whether `close` was called.
    fn is_closed(&self) -> bool;
}

/// Bounded in-process channel transport.
///
/// The receiver half is handed to the HTTP handler, which drains it into
/// the response stream. A full queue counts as a write failure: a
/// consumer that cannot keep up is dropped and recovers by reconnecting
/// with a catch-up marker.
pub struct ChannelTransport {
    tx: mpsc::Sender<WireFrame>,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WireFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: &WireFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Capturing transport for tests and diagnostics.
///
/// Records every frame it is asked to send; can be flipped into a
/// failing state to exercise the dispatcher's removal path.
#[derive(Default)]
pub struct RecordingTransport {
    frames: parking_lot::Mutex<Vec<WireFrame>>,
    fail: AtomicBool,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames sent so far.
    pub fn frames(&self) -> Vec<WireFrame> {
        self.frames.lock().clone()
    }

    /// Only the JSON payloads (heartbeats skipped).
    pub fn payloads(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| match f {
                WireFrame::Data(json) => Some(json.clone()),
                WireFrame::Heartbeat => None,
            })
            .collect()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|f| matches!(f, WireFrame::Heartbeat))
            .count()
    }

    /// Make every subsequent send fail with `Closed`.
    pub fn fail_writes(&self) {
        self.fail.store(true, Ordering::Release);
    }
}

impl Transport for RecordingTransport {
    fn send(&self, frame: &WireFrame) -> Result<(), TransportError> {
        if self.fail.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.frames.lock().push(frame.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_delivers() {
        let (transport, mut rx) = ChannelTransport::new(4);
        transport
            .send(&WireFrame::Data("{\"a\":1}".to_string()))
            .unwrap();
        transport.send(&WireFrame::Heartbeat).unwrap();

        assert_eq!(rx.recv().await, Some(WireFrame::Data("{\"a\":1}".to_string())));
        assert_eq!(rx.recv().await, Some(WireFrame::Heartbeat));
    }

    #[tokio::test]
    async fn test_channel_transport_backpressure() {
        let (transport, _rx) = ChannelTransport::new(1);
        transport.send(&WireFrame::Heartbeat).unwrap();
        assert_eq!(
            transport.send(&WireFrame::Heartbeat),
            Err(TransportError::Backpressure)
        );
    }

    #[tokio::test]
    async fn test_channel_transport_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new(4);
        drop(rx);
        assert_eq!(
            transport.send(&WireFrame::Heartbeat),
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_channel_transport_close() {
        let (transport, mut rx) = ChannelTransport::new(4);
        transport.close();
        assert!(transport.is_closed());
        assert_eq!(
            transport.send(&WireFrame::Heartbeat),
            Err(TransportError::Closed)
        );
        // Nothing was queued before the close.
        drop(transport);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_recording_transport_captures() {
        let transport = RecordingTransport::new();
        transport
            .send(&WireFrame::Data("{}".to_string()))
            .unwrap();
        transport.send(&WireFrame::Heartbeat).unwrap();

        assert_eq!(transport.frames().len(), 2);
        assert_eq!(transport.payloads(), vec!["{}".to_string()]);
        assert_eq!(transport.heartbeat_count(), 1);
    }

    #[test]
    fn test_recording_transport_failure_mode() {
        let transport = RecordingTransport::new();
        transport.fail_writes();
        assert_eq!(
            transport.send(&WireFrame::Heartbeat),
            Err(TransportError::Closed)
        );
        assert!(transport.frames().is_empty());
    }

    #[test]
    fn test_wire_frame_sse_rendering() {
        assert_eq!(
            WireFrame::Data("{\"x\":1}".to_string()).to_sse(),
            "data: {\"x\":1}\n\n"
        );
        assert_eq!(WireFrame::Heartbeat.to_sse(), ": heartbeat\n\n");
    }
}
