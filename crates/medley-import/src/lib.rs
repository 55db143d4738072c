#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-import** – Historical import from a legacy source.
//!
//! The importer pages rows out of a legacy source, converts each to a
//! canonical event, publishes it through the pipeline's durable front door,
//! and persists a progress checkpoint after every page. On restart it
//! resumes from the last checkpoint; rows replayed across the checkpoint
//! gap are deduplicated at commit by the analytics store's
//! `(source, event_id)` key, so a crash never produces duplicate rows.
//!
//! Dry-run mode disables publishing but still walks the source and persists
//! progress, which lets operators validate a source before committing to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use medley_types::{EventError, EventSink, PlaybackEvent};

//─────────────────────────────
//  Ports
//─────────────────────────────

/// One row streamed from the legacy source.
#[derive(Debug, Clone)]
pub struct LegacyRow {
    /// Monotonic row id within the source; drives checkpoint resume
    pub row_id: i64,
    /// The row converted to the canonical shape
    pub event: PlaybackEvent,
}

/// A pageable legacy source of historical playback rows.
#[async_trait]
pub trait LegacySource: Send + Sync {
    /// Stable identifier; keys the progress checkpoint.
    fn id(&self) -> &str;

    /// Up to `limit` rows with `row_id > after_row_id`, ascending.
    async fn fetch_page(&self, after_row_id: i64, limit: u32) -> anyhow::Result<Vec<LegacyRow>>;
}

/// Durable checkpoint persistence, implemented over the analytics store.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load the checkpoint for a source, if one exists.
    async fn load(&self, source_id: &str) -> anyhow::Result<Option<ImportCheckpoint>>;

    /// Persist (upsert) a checkpoint.
    async fn save(&self, checkpoint: &ImportCheckpoint) -> anyhow::Result<()>;
}

/// Resume state persisted after every page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportCheckpoint {
    /// Legacy source identifier
    pub source_id: String,
    /// Highest row id already processed
    pub last_row_id: i64,
    /// Rows processed across all runs
    pub total_processed: i64,
    /// When the import first started
    pub started_at: DateTime<Utc>,
    /// Last checkpoint write
    pub updated_at: DateTime<Utc>,
}

//─────────────────────────────
//  Configuration and status
//─────────────────────────────

/// Import tuning.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Rows per page; also the checkpoint cadence.
    pub batch_size: u32,
    /// Walk the source without publishing.
    pub dry_run: bool,
    /// Pause between pages, to keep a large import from starving the live
    /// path.
    pub page_delay: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            dry_run: false,
            page_delay: Duration::from_millis(0),
        }
    }
}

/// Where an import run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    /// Not started yet
    Idle,
    /// Walking the source
    Running,
    /// Stopped by the operator before the source was exhausted
    Stopped,
    /// Source exhausted
    Completed,
    /// Aborted on an unrecoverable error
    Failed,
}

/// Status answered to the external `/import/status` surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStatus {
    /// Run state
    pub state: ImportState,
    /// Highest row id processed
    pub last_row_id: i64,
    /// Rows processed across all runs
    pub total_processed: i64,
    /// Rows skipped because they violated event invariants
    pub skipped: i64,
    /// When the import first started, if it has
    pub started_at: Option<DateTime<Utc>>,
}

impl ImportStatus {
    fn idle() -> Self {
        Self {
            state: ImportState::Idle,
            last_row_id: 0,
            total_processed: 0,
            skipped: 0,
            started_at: None,
        }
    }
}

//─────────────────────────────
//  Importer
//─────────────────────────────

/// Pages a legacy source into the pipeline with checkpointed progress.
pub struct HistoricalImporter {
    source: Arc<dyn LegacySource>,
    sink: Arc<dyn EventSink>,
    progress: Arc<dyn ProgressStore>,
    config: ImportConfig,
    status: Arc<RwLock<ImportStatus>>,
    cancel: CancellationToken,
}

impl HistoricalImporter {
    /// Assemble an importer. Nothing runs until [`Self::run`] or
    /// [`Self::spawn`].
    pub fn new(
        source: Arc<dyn LegacySource>,
        sink: Arc<dyn EventSink>,
        progress: Arc<dyn ProgressStore>,
        config: ImportConfig,
    ) -> Self {
        Self {
            source,
            sink,
            progress,
            config,
            status: Arc::new(RwLock::new(ImportStatus::idle())),
            cancel: CancellationToken::new(),
        }
    }

    /// Current status snapshot, for the external stop/status surface.
    pub async fn status(&self) -> ImportStatus {
        self.status.read().await.clone()
    }

    /// Request a stop; the run finishes its current page, checkpoints, and
    /// returns.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run on a background task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<anyhow::Result<ImportStatus>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Walk the source to exhaustion (or stop/cancel), checkpointing after
    /// every page. Resumes from the persisted checkpoint when one exists.
    pub async fn run(&self) -> anyhow::Result<ImportStatus> {
        let source_id = self.source.id().to_string();
        let existing = self.progress.load(&source_id).await?;
        let started_at = existing
            .as_ref()
            .map(|checkpoint| checkpoint.started_at)
            .unwrap_or_else(Utc::now);
        let mut last_row_id = existing
            .as_ref()
            .map(|checkpoint| checkpoint.last_row_id)
            .unwrap_or(0);
        let mut total_processed = existing
            .as_ref()
            .map(|checkpoint| checkpoint.total_processed)
            .unwrap_or(0);

        info!(
            source = %source_id,
            resume_from = last_row_id,
            dry_run = self.config.dry_run,
            "historical import starting"
        );
        {
            let mut status = self.status.write().await;
            status.state = ImportState::Running;
            status.last_row_id = last_row_id;
            status.total_processed = total_processed;
            status.started_at = Some(started_at);
        }

        loop {
            if self.cancel.is_cancelled() {
                self.finish(ImportState::Stopped).await;
                return Ok(self.status().await);
            }

            let page = match self
                .source
                .fetch_page(last_row_id, self.config.batch_size)
                .await
            {
                Ok(page) => page,
                Err(error) => {
                    warn!(source = %source_id, %error, "legacy source read failed");
                    self.finish(ImportState::Failed).await;
                    return Err(error);
                }
            };
            if page.is_empty() {
                self.finish(ImportState::Completed).await;
                info!(source = %source_id, total_processed, "historical import complete");
                return Ok(self.status().await);
            }

            for row in &page {
                if !self.config.dry_run {
                    match self.sink.publish(row.event.clone()).await {
                        Ok(_) => {}
                        Err(
                            error @ (EventError::MissingEventId
                            | EventError::MissingSource
                            | EventError::MissingCorrelationKey
                            | EventError::Unparseable(_)),
                        ) => {
                            // Invariant-violating legacy rows are skipped,
                            // not fatal; the source cannot repair them.
                            warn!(row_id = row.row_id, %error, "legacy row rejected, skipping");
                            self.status.write().await.skipped += 1;
                            continue;
                        }
                        Err(error) => {
                            // The WAL refused the append; nothing past this
                            // row is safe to claim as processed.
                            warn!(row_id = row.row_id, %error, "durable front door refused the row");
                            self.finish(ImportState::Failed).await;
                            return Err(error.into());
                        }
                    }
                }
                last_row_id = row.row_id;
                total_processed += 1;
            }

            let checkpoint = ImportCheckpoint {
                source_id: source_id.clone(),
                last_row_id,
                total_processed,
                started_at,
                updated_at: Utc::now(),
            };
            self.progress.save(&checkpoint).await?;
            {
                let mut status = self.status.write().await;
                status.last_row_id = last_row_id;
                status.total_processed = total_processed;
            }

            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }
    }

    async fn finish(&self, state: ImportState) {
        self.status.write().await.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medley_types::{EventKind, TransactionId};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn legacy_event(row: i64) -> PlaybackEvent {
        PlaybackEvent {
            event_id: format!("legacy-{row}"),
            correlation_key: format!("corr-{row}"),
            transaction_id: None,
            source: "legacy".to_string(),
            server_id: "srv-old".to_string(),
            session_key: None,
            user_id: Some("42".to_string()),
            username: None,
            ip_address: None,
            media_type: None,
            title: None,
            parent_title: None,
            grandparent_title: None,
            rating_key: None,
            machine_id: None,
            platform: None,
            player: None,
            kind: EventKind::Play,
            started_at: Utc::now(),
            stopped_at: None,
            raw: serde_json::Value::Null,
        }
    }

    struct VecSource {
        rows: Vec<LegacyRow>,
    }

    impl VecSource {
        fn with_rows(count: i64) -> Arc<Self> {
            Arc::new(Self {
                rows: (1..=count)
                    .map(|row_id| LegacyRow {
                        row_id,
                        event: legacy_event(row_id),
                    })
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl LegacySource for VecSource {
        fn id(&self) -> &str {
            "legacy"
        }

        async fn fetch_page(
            &self,
            after_row_id: i64,
            limit: u32,
        ) -> anyhow::Result<Vec<LegacyRow>> {
            Ok(self
                .rows
                .iter()
                .filter(|row| row.row_id > after_row_id)
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct MemoryProgress(Mutex<Option<ImportCheckpoint>>);

    #[async_trait]
    impl ProgressStore for MemoryProgress {
        async fn load(&self, _source_id: &str) -> anyhow::Result<Option<ImportCheckpoint>> {
            Ok(self.0.lock().unwrap().clone())
        }

        async fn save(&self, checkpoint: &ImportCheckpoint) -> anyhow::Result<()> {
            *self.0.lock().unwrap() = Some(checkpoint.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<String>>);

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, event: PlaybackEvent) -> Result<TransactionId, EventError> {
            event.validate()?;
            self.0.lock().unwrap().push(event.event_id);
            Ok(Uuid::new_v4())
        }
    }

    #[tokio::test]
    async fn imports_everything_and_checkpoints_per_page() {
        let source = VecSource::with_rows(1200);
        let sink = Arc::new(RecordingSink::default());
        let progress = Arc::new(MemoryProgress::default());
        let importer = HistoricalImporter::new(
            source,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Arc::clone(&progress) as Arc<dyn ProgressStore>,
            ImportConfig {
                batch_size: 500,
                ..ImportConfig::default()
            },
        );

        let status = importer.run().await.unwrap();
        assert_eq!(status.state, ImportState::Completed);
        assert_eq!(status.total_processed, 1200);
        assert_eq!(sink.0.lock().unwrap().len(), 1200);

        let checkpoint = progress.0.lock().unwrap().clone().unwrap();
        assert_eq!(checkpoint.last_row_id, 1200);
    }

    #[tokio::test]
    async fn resumes_from_the_persisted_checkpoint() {
        let source = VecSource::with_rows(1000);
        let sink = Arc::new(RecordingSink::default());
        let progress = Arc::new(MemoryProgress::default());
        // A previous run died after checkpointing row 500.
        let started = Utc::now() - chrono::Duration::hours(1);
        *progress.0.lock().unwrap() = Some(ImportCheckpoint {
            source_id: "legacy".to_string(),
            last_row_id: 500,
            total_processed: 500,
            started_at: started,
            updated_at: started,
        });

        let importer = HistoricalImporter::new(
            source,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Arc::clone(&progress) as Arc<dyn ProgressStore>,
            ImportConfig {
                batch_size: 500,
                ..ImportConfig::default()
            },
        );
        let status = importer.run().await.unwrap();

        assert_eq!(status.state, ImportState::Completed);
        assert_eq!(status.total_processed, 1000);
        let published = sink.0.lock().unwrap();
        assert_eq!(published.len(), 500);
        assert_eq!(published[0], "legacy-501");
        // The original start time survives resume.
        assert_eq!(status.started_at, Some(started));
    }

    #[tokio::test]
    async fn dry_run_walks_and_checkpoints_without_publishing() {
        let source = VecSource::with_rows(300);
        let sink = Arc::new(RecordingSink::default());
        let progress = Arc::new(MemoryProgress::default());
        let importer = HistoricalImporter::new(
            source,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Arc::clone(&progress) as Arc<dyn ProgressStore>,
            ImportConfig {
                batch_size: 100,
                dry_run: true,
                ..ImportConfig::default()
            },
        );

        let status = importer.run().await.unwrap();
        assert_eq!(status.state, ImportState::Completed);
        assert_eq!(status.total_processed, 300);
        assert!(sink.0.lock().unwrap().is_empty());
        assert!(progress.0.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn stop_request_checkpoints_and_halts() {
        let source = VecSource::with_rows(10_000);
        let sink = Arc::new(RecordingSink::default());
        let progress = Arc::new(MemoryProgress::default());
        let importer = Arc::new(HistoricalImporter::new(
            source,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Arc::clone(&progress) as Arc<dyn ProgressStore>,
            ImportConfig {
                batch_size: 100,
                page_delay: Duration::from_millis(5),
                ..ImportConfig::default()
            },
        ));

        let task = Arc::clone(&importer).spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        importer.stop();
        let status = task.await.unwrap().unwrap();

        assert_eq!(status.state, ImportState::Stopped);
        assert!(status.total_processed > 0);
        assert!(status.total_processed < 10_000);
        // The checkpoint matches what was actually processed.
        let checkpoint = progress.0.lock().unwrap().clone().unwrap();
        assert_eq!(checkpoint.last_row_id, status.last_row_id);
    }

    #[tokio::test]
    async fn invariant_violating_rows_are_skipped_not_fatal() {
        let mut source = VecSource::with_rows(3);
        Arc::get_mut(&mut source).unwrap().rows[1].event.event_id = String::new();
        let sink = Arc::new(RecordingSink::default());
        let progress = Arc::new(MemoryProgress::default());
        let importer = HistoricalImporter::new(
            source,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Arc::clone(&progress) as Arc<dyn ProgressStore>,
            ImportConfig::default(),
        );

        let status = importer.run().await.unwrap();
        assert_eq!(status.state, ImportState::Completed);
        assert_eq!(status.skipped, 1);
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }
}
