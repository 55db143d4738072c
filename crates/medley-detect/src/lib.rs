#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-detect** – Security-anomaly detection over the playback stream.
//!
//! The engine runs an ordered catalog of detectors over each delivered
//! event. Detectors are pure functions of the event plus recent state loaded
//! lazily from the analytics store; they are independent, and an error in
//! one never aborts the others. Alerts fan out three ways: persisted to the
//! analytics store, broadcast through the push hub, and forwarded to the
//! configured notifier sinks, each rate-limited per notifier.
//!
//! The catalog is a tagged-variant configuration built once at boot - there
//! is no runtime plugin discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use medley_broker::Delivery;
use medley_push::{PushHub, PushMessage};
use medley_router::EventHandler;
use medley_types::PlaybackEvent;

pub mod detectors;
pub mod notify;

pub use detectors::{build_detectors, haversine_km, DetectorConfig};
pub use notify::{build_notifiers, Notifier, NotifierConfig, RateLimitedNotifier};

//─────────────────────────────
//  Alerts
//─────────────────────────────

/// One anomaly raised by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Detector kind, e.g. "impossible_travel"
    pub kind: String,
    /// Subject of the alert
    pub user_id: Option<String>,
    /// Event that triggered it
    pub event_id: String,
    /// Source of that event
    pub source: String,
    /// Human-readable description
    pub detail: String,
    /// When the detector fired
    pub raised_at: DateTime<Utc>,
}

//─────────────────────────────
//  Capability ports
//─────────────────────────────

/// Resolved location of a client address. Supplied by the external
/// geolocation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Degrees north
    pub latitude: f64,
    /// Degrees east
    pub longitude: f64,
    /// ISO country code
    pub country: String,
    /// Whether the address belongs to a known VPN/proxy range
    pub is_vpn: bool,
}

/// Lazy recent-state reads and incident bookkeeping, implemented over the
/// analytics store.
#[async_trait]
pub trait DetectionState: Send + Sync {
    /// Recent canonical events for one subject, newest first.
    async fn recent_events(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PlaybackEvent>>;

    /// Bump the subject's incident counter.
    async fn raise_incident(&self, user_id: &str) -> anyhow::Result<()>;

    /// Decrement every incident counter by `amount`, floored at zero.
    /// Returns how many subjects changed.
    async fn decay_incidents(&self, amount: i64) -> anyhow::Result<u64>;
}

/// IP-to-location resolution. External collaborator; interface only.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Resolve an address; `None` when the address is unknown.
    async fn locate(&self, ip: &str) -> anyhow::Result<Option<GeoLocation>>;
}

/// Alert persistence, implemented over the analytics store.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Persist one alert.
    async fn record_alert(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Everything a detector may consult besides the event itself.
pub struct DetectionContext {
    /// Recent-state reads
    pub state: Arc<dyn DetectionState>,
    /// Geolocation lookups
    pub geo: Arc<dyn GeoResolver>,
    /// How far back "recent" reaches
    pub lookback: Duration,
}

impl DetectionContext {
    /// Recent events for the event's subject; empty when the event has no
    /// subject.
    pub async fn recent_for(&self, event: &PlaybackEvent) -> anyhow::Result<Vec<PlaybackEvent>> {
        let Some(user_id) = event.user_id.as_deref() else {
            return Ok(Vec::new());
        };
        let since = Utc::now()
            - chrono::Duration::from_std(self.lookback).unwrap_or_else(|_| chrono::Duration::hours(24));
        self.state.recent_events(user_id, since).await
    }
}

/// One detector in the ordered catalog.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Stable kind tag, also the persisted alert kind.
    fn kind(&self) -> &'static str;

    /// Evaluate one event against recent state. Zero or more alerts.
    async fn evaluate(
        &self,
        event: &PlaybackEvent,
        ctx: &DetectionContext,
    ) -> anyhow::Result<Vec<Alert>>;
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// The `detect` consumer group: detectors plus alert fan-out.
pub struct DetectionEngine {
    detectors: Vec<Box<dyn Detector>>,
    ctx: DetectionContext,
    alert_sink: Arc<dyn AlertSink>,
    hub: Arc<PushHub>,
    notifiers: Vec<Arc<RateLimitedNotifier>>,
}

impl DetectionEngine {
    /// Assemble the engine from an already-built catalog.
    pub fn new(
        detectors: Vec<Box<dyn Detector>>,
        ctx: DetectionContext,
        alert_sink: Arc<dyn AlertSink>,
        hub: Arc<PushHub>,
        notifiers: Vec<Arc<RateLimitedNotifier>>,
    ) -> Self {
        info!(detectors = detectors.len(), notifiers = notifiers.len(), "detection engine built");
        Self {
            detectors,
            ctx,
            alert_sink,
            hub,
            notifiers,
        }
    }

    /// Run every detector over one event and fan out the alerts. Detector
    /// errors are logged and skipped; fan-out errors never fail the event.
    pub async fn evaluate(&self, event: &PlaybackEvent) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for detector in &self.detectors {
            match detector.evaluate(event, &self.ctx).await {
                Ok(mut found) => alerts.append(&mut found),
                Err(error) => {
                    warn!(detector = detector.kind(), %error, "detector errored, continuing");
                }
            }
        }

        for alert in &alerts {
            if let Err(error) = self.alert_sink.record_alert(alert).await {
                warn!(kind = %alert.kind, %error, "alert persistence failed");
            }
            if let Some(user_id) = alert.user_id.as_deref() {
                if let Err(error) = self.ctx.state.raise_incident(user_id).await {
                    warn!(user_id, %error, "incident counter update failed");
                }
            }
            self.hub
                .broadcast(PushMessage::Alert {
                    kind: alert.kind.clone(),
                    user_id: alert.user_id.clone(),
                    detail: alert.detail.clone(),
                    raised_at: alert.raised_at,
                })
                .await;
            for notifier in &self.notifiers {
                notifier.notify(alert).await;
            }
        }
        alerts
    }
}

#[async_trait]
impl EventHandler for DetectionEngine {
    fn name(&self) -> &str {
        "detect"
    }

    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let event: PlaybackEvent = match serde_json::from_slice(&delivery.body) {
            Ok(event) => event,
            Err(error) => {
                warn!(seq = delivery.seq, %error, "detection skipped undecodable body");
                return Ok(());
            }
        };
        let alerts = self.evaluate(&event).await;
        if !alerts.is_empty() {
            debug!(event_id = %event.event_id, count = alerts.len(), "alerts raised");
        }
        Ok(())
    }
}

//─────────────────────────────
//  Trust-score recovery
//─────────────────────────────

/// Daily decrement of every subject's incident counter, floored at zero.
pub fn spawn_trust_recovery(
    state: Arc<dyn DetectionState>,
    amount: i64,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a restart loop does
        // not decay faster than the configured cadence.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match state.decay_incidents(amount).await {
                        Ok(changed) => debug!(changed, "trust-score recovery pass"),
                        Err(error) => warn!(%error, "trust-score recovery failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Canned recent-state source.
    pub struct FakeState {
        pub events: Mutex<Vec<PlaybackEvent>>,
        pub incidents: Mutex<HashMap<String, i64>>,
    }

    impl FakeState {
        pub fn with_events(events: Vec<PlaybackEvent>) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(events),
                incidents: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl DetectionState for FakeState {
        async fn recent_events(
            &self,
            user_id: &str,
            _since: DateTime<Utc>,
        ) -> anyhow::Result<Vec<PlaybackEvent>> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| event.user_id.as_deref() == Some(user_id))
                .cloned()
                .collect())
        }

        async fn raise_incident(&self, user_id: &str) -> anyhow::Result<()> {
            *self
                .incidents
                .lock()
                .unwrap()
                .entry(user_id.to_string())
                .or_insert(0) += 1;
            Ok(())
        }

        async fn decay_incidents(&self, amount: i64) -> anyhow::Result<u64> {
            let mut incidents = self.incidents.lock().unwrap();
            let mut changed = 0;
            for count in incidents.values_mut() {
                if *count > 0 {
                    *count = (*count - amount).max(0);
                    changed += 1;
                }
            }
            Ok(changed)
        }
    }

    /// Canned geolocation table.
    pub struct FakeGeo {
        pub table: HashMap<String, GeoLocation>,
    }

    impl FakeGeo {
        pub fn with(entries: &[(&str, f64, f64, &str, bool)]) -> Arc<Self> {
            let table = entries
                .iter()
                .map(|(ip, lat, lon, country, vpn)| {
                    (
                        ip.to_string(),
                        GeoLocation {
                            latitude: *lat,
                            longitude: *lon,
                            country: country.to_string(),
                            is_vpn: *vpn,
                        },
                    )
                })
                .collect();
            Arc::new(Self { table })
        }
    }

    #[async_trait]
    impl GeoResolver for FakeGeo {
        async fn locate(&self, ip: &str) -> anyhow::Result<Option<GeoLocation>> {
            Ok(self.table.get(ip).cloned())
        }
    }

    /// Collects persisted alerts.
    #[derive(Default)]
    pub struct RecordingAlertSink(pub Mutex<Vec<Alert>>);

    #[async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn record_alert(&self, alert: &Alert) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }
}
