//! Streaming-socket adapter: a server-initiated event stream with a
//! reconnect loop.
//!
//! The transport is an external collaborator behind [`StreamConnector`];
//! the adapter owns the reconnect policy (infinite, fixed backoff) and the
//! normalization of each frame.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::normalize::normalize_event;
use crate::{PublisherSlot, UpstreamAdapter};

/// Source-specific stream transport. External collaborator.
///
/// `connect` yields a channel of raw frames; the channel closing (or an
/// `Err`) means the connection dropped and the adapter will reconnect.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Establish one connection.
    async fn connect(&self) -> anyhow::Result<mpsc::Receiver<Value>>;
}

/// Socket tuning.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Source tag for emitted events.
    pub source: String,
    /// Upstream instance identifier.
    pub server_id: String,
    /// Fixed pause between reconnect attempts.
    pub reconnect_backoff: Duration,
}

/// Streaming-socket upstream adapter.
pub struct SocketAdapter {
    connector: Arc<dyn StreamConnector>,
    config: SocketConfig,
    publisher: PublisherSlot,
}

impl SocketAdapter {
    /// Build over a source-specific transport.
    pub fn new(connector: Arc<dyn StreamConnector>, config: SocketConfig) -> Self {
        Self {
            connector,
            config,
            publisher: PublisherSlot::empty(),
        }
    }

    async fn drain_connection(
        &self,
        mut frames: mpsc::Receiver<Value>,
        cancel: &CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };
            match normalize_event(&self.config.source, &self.config.server_id, &frame) {
                Ok(event) => {
                    if let Err(error) = self.publisher.publish(event).await {
                        warn!(source = %self.config.source, %error, "stream frame refused by the WAL");
                    }
                }
                Err(error) => {
                    warn!(source = %self.config.source, %error, "stream frame did not normalize");
                }
            }
        }
    }
}

#[async_trait]
impl UpstreamAdapter for SocketAdapter {
    fn source(&self) -> &str {
        &self.config.source
    }

    fn set_event_publisher(&self, publisher: Arc<dyn medley_types::EventSink>) {
        self.publisher.set(publisher);
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.connector.connect().await {
                Ok(frames) => {
                    info!(source = %self.config.source, "stream connected");
                    self.drain_connection(frames, &cancel).await;
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    warn!(source = %self.config.source, "stream dropped, reconnecting");
                }
                Err(error) => {
                    warn!(source = %self.config.source, %error, "stream connect failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medley_types::{EventSink, PlaybackEvent, TransactionId};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Yields one connection per call; each connection carries the scripted
    /// frames then closes.
    struct ScriptedConnector {
        connections: Mutex<Vec<Vec<Value>>>,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(&self) -> anyhow::Result<mpsc::Receiver<Value>> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let mut connections = self.connections.lock().unwrap();
            if connections.is_empty() {
                anyhow::bail!("source offline");
            }
            let frames = connections.remove(0);
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for frame in frames {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<PlaybackEvent>>);

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
    async fn frames_flow_and_reconnects_resume_the_stream() {
        let connector = Arc::new(ScriptedConnector {
            connections: Mutex::new(vec![
                vec![json!({"event": "play", "session_key": "s-1"})],
                vec![json!({"event": "stop", "session_key": "s-1"})],
            ]),
            attempts: AtomicU32::new(0),
        });
        let adapter = Arc::new(SocketAdapter::new(
            Arc::clone(&connector) as Arc<dyn StreamConnector>,
            SocketConfig {
                source: "jellyfin".to_string(),
                server_id: "srv-js".to_string(),
                reconnect_backoff: Duration::from_millis(5),
            },
        ));
        let sink = Arc::new(RecordingSink::default());
        adapter.set_event_publisher(Arc::clone(&sink) as Arc<dyn EventSink>);

        let cancel = CancellationToken::new();
        let run = {
            let adapter = Arc::clone(&adapter);
            let cancel = cancel.clone();
            tokio::spawn(async move { adapter.start(cancel).await })
        };

        for _ in 0..200 {
            if sink.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sink.0.lock().unwrap().len(), 2);
        // Both scripted connections were consumed: one reconnect happened.
        assert!(connector.attempts.load(Ordering::Relaxed) >= 2);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }
}
