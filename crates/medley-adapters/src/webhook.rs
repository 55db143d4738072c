//! Push-based adapter: drains a bounded queue fed by the external HTTP
//! surface.
//!
//! The HTTP endpoint itself is out of scope; it holds a [`WebhookQueue`]
//! handle and enqueues raw payloads. The adapter owns normalization and the
//! hand-off into the producer WAL. A full queue pushes back on the HTTP
//! surface (the webhook sender will retry), never on the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::normalize::normalize_event;
use crate::{PublisherSlot, UpstreamAdapter};

/// Inbound payload queue handed to the external HTTP surface.
#[derive(Debug, Clone)]
pub struct WebhookQueue {
    tx: mpsc::Sender<Value>,
}

impl WebhookQueue {
    /// Enqueue one raw webhook payload. `Err` means the queue is full and
    /// the sender should retry later.
    pub async fn enqueue(&self, payload: Value) -> Result<(), Value> {
        self.tx.try_send(payload).map_err(|refused| match refused {
            mpsc::error::TrySendError::Full(payload)
            | mpsc::error::TrySendError::Closed(payload) => payload,
        })
    }
}

/// Webhook-receiving upstream adapter.
pub struct WebhookAdapter {
    source: String,
    server_id: String,
    rx: Mutex<mpsc::Receiver<Value>>,
    queue: WebhookQueue,
    publisher: PublisherSlot,
}

impl WebhookAdapter {
    /// Build with a bounded inbound queue of `capacity` payloads.
    pub fn new(source: &str, server_id: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            source: source.to_string(),
            server_id: server_id.to_string(),
            rx: Mutex::new(rx),
            queue: WebhookQueue { tx },
            publisher: PublisherSlot::empty(),
        }
    }

    /// Handle for the external HTTP surface.
    pub fn queue(&self) -> WebhookQueue {
        self.queue.clone()
    }
}

#[async_trait]
impl UpstreamAdapter for WebhookAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    fn set_event_publisher(&self, publisher: Arc<dyn medley_types::EventSink>) {
        self.publisher.set(publisher);
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut rx = self.rx.lock().await;
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => return Ok(()),
                },
            };
            match normalize_event(&self.source, &self.server_id, &payload) {
                Ok(event) => {
                    if let Err(error) = self.publisher.publish(event).await {
                        warn!(source = %self.source, %error, "webhook event refused by the WAL");
                    }
                }
                Err(error) => {
                    warn!(source = %self.source, %error, "webhook payload did not normalize");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medley_types::{EventKind, EventSink, PlaybackEvent, TransactionId};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink(StdMutex<Vec<PlaybackEvent>>);

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(
            &self,
            event: PlaybackEvent,
        ) -> Result<TransactionId, medley_types::EventError> {
            self.0.lock().unwrap().push(event);
            Ok(Uuid::new_v4())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn enqueued_payloads_flow_to_the_sink() {
        let adapter = Arc::new(WebhookAdapter::new("tautulli", "srv-hook", 16));
        let sink = Arc::new(RecordingSink::default());
        adapter.set_event_publisher(Arc::clone(&sink) as Arc<dyn EventSink>);

        let queue = adapter.queue();
        let cancel = CancellationToken::new();
        let run = {
            let adapter = Arc::clone(&adapter);
            let cancel = cancel.clone();
            tokio::spawn(async move { adapter.start(cancel).await })
        };

        queue
            .enqueue(json!({
                "event": "playback.start",
                "session_key": "sess-7",
                "username": "bob",
            }))
            .await
            .unwrap();
        queue
            .enqueue(json!({"event": "not.a.playback.event"}))
            .await
            .unwrap();

        for _ in 0..100 {
            if sink.0.lock().unwrap().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        {
            let events = sink.0.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind, EventKind::Play);
            assert_eq!(events[0].source, "tautulli");
        }

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn full_queue_pushes_back_on_the_http_surface() {
        let adapter = WebhookAdapter::new("tautulli", "srv", 1);
        let queue = adapter.queue();
        // Adapter not started: nothing drains.
        queue.enqueue(json!({"n": 1})).await.unwrap();
        let refused = queue.enqueue(json!({"n": 2})).await.unwrap_err();
        assert_eq!(refused, json!({"n": 2}));
    }
}
