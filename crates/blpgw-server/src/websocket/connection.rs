//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use blpgw_core::ConnectionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::protocol::ServerMessage;
use crate::metrics::WS_DROPPED_MESSAGES_TOTAL;

/// Represents a connected WebSocket client.
pub struct WsConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Cancelled once the connection starts closing.
    closing: CancellationToken,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Count of messages dropped due to full channel.
    dropped_messages: AtomicU64,
}

impl WsConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            closing: CancellationToken::new(),
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame.
    ///
    /// Returns `false` if the connection is closing or the channel is full or
    /// closed. Dropped frames are counted.
    pub fn send_text(&self, message: Arc<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(WS_DROPPED_MESSAGES_TOTAL).increment(1);
            false
        }
    }

    /// Serialize `message` and queue it.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => self.send_text(Arc::new(json)),
            Err(err) => {
                warn!(connection = %self.id, error = %err, "failed to serialize frame");
                false
            }
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Start closing. Frames already queued are still flushed.
    pub fn close(&self) {
        self.closing.cancel();
    }

    /// Whether the connection is closing or closed.
    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Token cancelled when the connection starts closing.
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }
}
