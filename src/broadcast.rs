//! Server-sent-events fan-out for dashboard clients.
//!
//! Each subscriber gets a small bounded queue. Publishing never blocks: a
//! client that cannot keep up has events dropped and is pruned once its
//! receiver goes away, so one stuck browser tab cannot stall the rest.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Per-client queue depth before events are dropped.
const CLIENT_QUEUE: usize = 16;

pub struct Broadcaster {
    clients: Mutex<Vec<mpsc::Sender<Bytes>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Register a new SSE client; the returned stream yields ready-framed
    /// `data:` payloads.
    pub fn subscribe(&self) -> ReceiverStream<Bytes> {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        self.clients.lock().push(tx);
        ReceiverStream::new(rx)
    }

    /// Serialize `event` as one SSE frame and push it to every client.
    ///
    /// Closed clients are pruned here; full ones just miss this event (the
    /// next frame carries a complete snapshot anyway).
    pub fn publish(&self, event: &serde_json::Value) {
        let frame = Bytes::from(format!("data: {event}\n\n"));
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if clients.len() != before {
            debug!(
                dropped = before - clients.len(),
                remaining = clients.len(),
                "pruned disconnected sse clients"
            );
        }
    }

    /// How many clients are connected. The periodic snapshot task skips its
    /// work entirely when this is zero.
    pub fn client_count(&self) -> usize {
        // Prune closed channels so idle servers converge to zero.
        let mut clients = self.clients.lock();
        clients.retain(|tx| !tx.is_closed());
        clients.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn delivers_framed_events_to_subscribers() {
        let broadcaster = Broadcaster::new();
        let mut stream = broadcaster.subscribe();

        broadcaster.publish(&serde_json::json!({"hello": "world"}));

        let frame = stream.next().await.unwrap();
        assert_eq!(&frame[..], b"data: {\"hello\":\"world\"}\n\n");
    }

    #[tokio::test]
    async fn fans_out_to_all_clients() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.publish(&serde_json::json!({"n": 1}));

        assert!(a.next().await.is_some());
        assert!(b.next().await.is_some());
    }

    #[tokio::test]
    async fn slow_consumer_drops_events_without_blocking() {
        let broadcaster = Broadcaster::new();
        let _stream = broadcaster.subscribe();

        // Way past the queue depth; publish must not block or error.
        for i in 0..100 {
            broadcaster.publish(&serde_json::json!({"n": i}));
        }

        assert_eq!(broadcaster.client_count(), 1);
    }

    #[tokio::test]
    async fn disconnected_clients_are_pruned() {
        let broadcaster = Broadcaster::new();
        let stream = broadcaster.subscribe();
        assert_eq!(broadcaster.client_count(), 1);

        drop(stream);
        broadcaster.publish(&serde_json::json!({}));
        assert_eq!(broadcaster.client_count(), 0);
    }
}
