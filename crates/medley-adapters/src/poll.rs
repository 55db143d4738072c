//! Pull-based adapter: polls a source's live-session list on an interval.
//!
//! Session lifecycle is inferred from consecutive polls: a session key that
//! appears emits a start event, one that vanishes emits a stop. The REST
//! client itself is an external collaborator behind [`SessionPoller`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use medley_types::EventKind;

use crate::normalize::normalize_event;
use crate::{PublisherSlot, UpstreamAdapter};

/// Source-specific live-session listing. External collaborator.
#[async_trait]
pub trait SessionPoller: Send + Sync {
    /// Current sessions as raw source payloads. Each payload must carry a
    /// session key; an `event` field is not required (the adapter infers
    /// lifecycle).
    async fn poll_sessions(&self) -> anyhow::Result<Vec<Value>>;
}

/// Polling tuning.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Source tag for emitted events.
    pub source: String,
    /// Upstream instance identifier.
    pub server_id: String,
    /// Base poll cadence.
    pub interval: Duration,
    /// Random extra delay added per poll, spreading load across instances.
    pub jitter: Duration,
}

/// REST-polling upstream adapter.
pub struct PollingAdapter {
    poller: Arc<dyn SessionPoller>,
    config: PollingConfig,
    publisher: PublisherSlot,
}

impl PollingAdapter {
    /// Build over a source-specific poller.
    pub fn new(poller: Arc<dyn SessionPoller>, config: PollingConfig) -> Self {
        Self {
            poller,
            config,
            publisher: PublisherSlot::empty(),
        }
    }

    /// One poll cycle against the given tracked-session state. Returns the
    /// new state. Separated from the loop for testability.
    async fn poll_once(
        &self,
        tracked: &HashMap<String, Value>,
    ) -> anyhow::Result<HashMap<String, Value>> {
        let sessions = self.poller.poll_sessions().await?;

        let mut current: HashMap<String, Value> = HashMap::new();
        for raw in sessions {
            let Some(session_key) = raw
                .get("session_key")
                .or_else(|| raw.get("session_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                warn!(source = %self.config.source, "session payload without a key skipped");
                continue;
            };
            current.insert(session_key, raw);
        }

        // New sessions start. A refused start stays untracked so the next
        // poll retries it.
        let mut refused = Vec::new();
        for (session_key, raw) in &current {
            if tracked.contains_key(session_key) {
                continue;
            }
            let mut tagged = raw.clone();
            ensure_event_tag(&mut tagged, EventKind::Play);
            match normalize_event(&self.config.source, &self.config.server_id, &tagged) {
                Ok(event) => {
                    if let Err(error) = self.publisher.publish(event).await {
                        warn!(%error, session_key, "start event refused, will retry next poll");
                        refused.push(session_key.clone());
                    }
                }
                Err(error) => warn!(%error, session_key, "session payload did not normalize"),
            }
        }
        for session_key in refused {
            current.remove(&session_key);
        }

        // Vanished sessions stop.
        for (session_key, raw) in tracked {
            if current.contains_key(session_key) {
                continue;
            }
            let mut tagged = raw.clone();
            ensure_event_tag(&mut tagged, EventKind::Stop);
            if let Some(map) = tagged.as_object_mut() {
                map.insert(
                    "stopped_at".to_string(),
                    Value::String(Utc::now().to_rfc3339()),
                );
            }
            match normalize_event(&self.config.source, &self.config.server_id, &tagged) {
                Ok(event) => {
                    if let Err(error) = self.publisher.publish(event).await {
                        warn!(%error, session_key, "stop event refused");
                    }
                }
                Err(error) => warn!(%error, session_key, "stop payload did not normalize"),
            }
        }

        debug!(
            source = %self.config.source,
            live = current.len(),
            "poll cycle complete"
        );
        Ok(current)
    }
}

fn ensure_event_tag(raw: &mut Value, kind: EventKind) {
    if let Some(map) = raw.as_object_mut() {
        map.insert(
            "event".to_string(),
            Value::String(format!("playback.{}", kind.as_str())),
        );
    }
}

#[async_trait]
impl UpstreamAdapter for PollingAdapter {
    fn source(&self) -> &str {
        &self.config.source
    }

    fn set_event_publisher(&self, publisher: Arc<dyn medley_types::EventSink>) {
        self.publisher.set(publisher);
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut tracked = HashMap::new();
        loop {
            let jitter = if self.config.jitter.is_zero() {
                Duration::ZERO
            } else {
                rand::thread_rng().gen_range(Duration::ZERO..self.config.jitter)
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.interval + jitter) => {}
            }
            match self.poll_once(&tracked).await {
                Ok(next) => tracked = next,
                Err(error) => {
                    // Transient poll failures keep prior state so sessions
                    // do not spuriously stop.
                    warn!(source = %self.config.source, %error, "poll failed");
                }
            }
        }
    }
}
