#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-push** – Fan-out of pipeline events to connected UI subscribers.
//!
//! The hub tracks subscribers as bounded outbound channels in a
//! mutex-free registry. Broadcast is fire-and-forget: a failed or slow send
//! drops the subscriber after a short timeout, and the UI re-syncs on
//! reconnect. A failed broadcast never blocks acknowledgement upstream.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use medley_broker::Delivery;
use medley_router::EventHandler;
use medley_types::{EventKind, PlaybackEvent};

/// Outbound queue depth per subscriber.
const SUBSCRIBER_BUFFER: usize = 64;

/// How long a send may block before the subscriber is dropped.
const SEND_TIMEOUT: Duration = Duration::from_millis(250);

//─────────────────────────────
//  Messages
//─────────────────────────────

/// UI-visible notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// A playback event happened
    Playback {
        /// Normalized lifecycle kind
        kind: EventKind,
        /// Originating source tag
        source: String,
        /// Subject display name, when known
        username: Option<String>,
        /// Item title, when known
        title: Option<String>,
        /// Player product name
        player: Option<String>,
        /// Session start
        started_at: DateTime<Utc>,
    },
    /// The detection engine raised an alert
    Alert {
        /// Detector kind, e.g. "impossible_travel"
        kind: String,
        /// Subject of the alert
        user_id: Option<String>,
        /// Human-readable description
        detail: String,
        /// When the detector fired
        raised_at: DateTime<Utc>,
    },
}

impl PushMessage {
    /// Build the playback notification for one canonical event.
    pub fn from_event(event: &PlaybackEvent) -> Self {
        PushMessage::Playback {
            kind: event.kind,
            source: event.source.clone(),
            username: event.username.clone(),
            title: event.title.clone(),
            player: event.player.clone(),
            started_at: event.started_at,
        }
    }
}

//─────────────────────────────
//  Hub
//─────────────────────────────

/// Subscriber registry and broadcast fan-out.
#[derive(Debug, Default)]
pub struct PushHub {
    subscribers: DashMap<Uuid, mpsc::Sender<PushMessage>>,
}

impl PushHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber; returns its id and the receiving end.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<PushMessage>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();
        self.subscribers.insert(id, tx);
        debug!(subscriber = %id, "push subscriber attached");
        (id, rx)
    }

    /// Detach a subscriber.
    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.remove(&id);
        debug!(subscriber = %id, "push subscriber detached");
    }

    /// Connected subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Drop every subscriber. Shutdown path; receivers observe channel
    /// closure and re-sync on reconnect.
    pub fn close_all(&self) {
        self.subscribers.clear();
    }

    /// Send to every subscriber. Slow or gone subscribers are dropped; the
    /// survivors' count is returned.
    pub async fn broadcast(&self, message: PushMessage) -> usize {
        let targets: Vec<(Uuid, mpsc::Sender<PushMessage>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            match tokio::time::timeout(SEND_TIMEOUT, tx.send(message.clone())).await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(_)) | Err(_) => {
                    warn!(subscriber = %id, "dropping slow or closed push subscriber");
                    self.subscribers.remove(&id);
                }
            }
        }
        delivered
    }
}

//─────────────────────────────
//  Router handler
//─────────────────────────────

/// Stream consumer that turns deliveries into UI notifications.
pub struct PushHandler {
    hub: std::sync::Arc<PushHub>,
}

impl PushHandler {
    /// Wrap the shared hub.
    pub fn new(hub: std::sync::Arc<PushHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventHandler for PushHandler {
    fn name(&self) -> &str {
        "push"
    }

    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        // Fire-and-forget: an undecodable body or an empty room is not a
        // delivery failure worth a broker redelivery.
        match serde_json::from_slice::<PlaybackEvent>(&delivery.body) {
            Ok(event) => {
                self.hub.broadcast(PushMessage::from_event(&event)).await;
            }
            Err(error) => {
                warn!(seq = delivery.seq, %error, "push handler skipped undecodable body");
            }
        }
        Ok(())
    }
}
