//! Capability-trait adapters wired at assembly time.
//!
//! Each adapter is a thin newtype that lets one crate's port be served by
//! the analytics store (or another component) without the two crates
//! knowing each other.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use medley_analytics::{AlertRow, AnalyticsStore, ImportProgress};
use medley_broker::Delivery;
use medley_detect::{Alert, AlertSink, DetectionState, GeoLocation, GeoResolver};
use medley_import::{ImportCheckpoint, ProgressStore};
use medley_router::EventHandler;
use medley_types::PlaybackEvent;
use medley_wal::consumer::ConsumerWal;

/// Most rows a detector will ever need from one subject's history.
const DETECTION_EVENT_LIMIT: i64 = 200;

//─────────────────────────────
//  Detection over the analytics store
//─────────────────────────────

/// [`DetectionState`] served by the analytics store.
pub struct StoreDetectionState {
    store: AnalyticsStore,
}

impl StoreDetectionState {
    /// Wrap a shared store handle.
    pub fn new(store: AnalyticsStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DetectionState for StoreDetectionState {
    async fn recent_events(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PlaybackEvent>> {
        Ok(self
            .store
            .recent_events_for_user(user_id, since, DETECTION_EVENT_LIMIT)
            .await?)
    }

    async fn raise_incident(&self, user_id: &str) -> anyhow::Result<()> {
        Ok(self.store.raise_incident(user_id).await?)
    }

    async fn decay_incidents(&self, amount: i64) -> anyhow::Result<u64> {
        Ok(self.store.decay_incidents(amount).await?)
    }
}

/// [`AlertSink`] served by the analytics store.
pub struct StoreAlertSink {
    store: AnalyticsStore,
}

impl StoreAlertSink {
    /// Wrap a shared store handle.
    pub fn new(store: AnalyticsStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AlertSink for StoreAlertSink {
    async fn record_alert(&self, alert: &Alert) -> anyhow::Result<()> {
        self.store
            .insert_alert(&AlertRow {
                kind: alert.kind.clone(),
                user_id: alert.user_id.clone(),
                event_id: alert.event_id.clone(),
                source: alert.source.clone(),
                detail: alert.detail.clone(),
                raised_at: alert.raised_at,
            })
            .await?;
        Ok(())
    }
}

/// Geolocation stub used until a real resolver is injected. Every lookup
/// misses, which quiets the geo-dependent detectors.
pub struct NullGeoResolver;

#[async_trait]
impl GeoResolver for NullGeoResolver {
    async fn locate(&self, _ip: &str) -> anyhow::Result<Option<GeoLocation>> {
        Ok(None)
    }
}

//─────────────────────────────
//  Import progress over the analytics store
//─────────────────────────────

/// [`ProgressStore`] served by the `import_progress` table.
pub struct StoreProgress {
    store: AnalyticsStore,
}

impl StoreProgress {
    /// Wrap a shared store handle.
    pub fn new(store: AnalyticsStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProgressStore for StoreProgress {
    async fn load(&self, source_id: &str) -> anyhow::Result<Option<ImportCheckpoint>> {
        Ok(self
            .store
            .load_import_progress(source_id)
            .await?
            .map(|progress| ImportCheckpoint {
                source_id: progress.source_id,
                last_row_id: progress.last_row_id,
                total_processed: progress.total_processed,
                started_at: progress.started_at,
                updated_at: progress.updated_at,
            }))
    }

    async fn save(&self, checkpoint: &ImportCheckpoint) -> anyhow::Result<()> {
        self.store
            .save_import_progress(&ImportProgress {
                source_id: checkpoint.source_id.clone(),
                last_row_id: checkpoint.last_row_id,
                total_processed: checkpoint.total_processed,
                started_at: checkpoint.started_at,
                updated_at: checkpoint.updated_at,
            })
            .await?;
        Ok(())
    }
}

//─────────────────────────────
//  Analytics consumer handler
//─────────────────────────────

/// The `analytics` consumer group: bridges deliveries into the consumer
/// WAL. Returning `Ok` acks the broker, which is only safe because
/// `handle_delivery` persists the entry first.
pub struct AnalyticsBridgeHandler {
    wal: Arc<ConsumerWal>,
}

impl AnalyticsBridgeHandler {
    /// Wrap the shared consumer WAL.
    pub fn new(wal: Arc<ConsumerWal>) -> Self {
        Self { wal }
    }
}

#[async_trait]
impl EventHandler for AnalyticsBridgeHandler {
    fn name(&self) -> &str {
        "analytics"
    }

    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let transaction_id = delivery
            .headers
            .transaction_id
            .parse()
            .map_err(|_| anyhow::anyhow!("delivery without a parseable transaction id"))?;
        self.wal.handle_delivery(transaction_id, &delivery.body).await?;
        Ok(())
    }
}
