//! Batched appender: amortizes analytics inserts into one transaction per
//! flush.
//!
//! A flush happens on the first of: batch full, flush interval elapsed, or
//! an explicit [`Flusher::flush`] barrier. Every waiter in the batch learns
//! its own outcome; a failed transaction fails the whole batch and the
//! consumer WAL retries the entries individually.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use medley_types::metrics::PipelineMetrics;
use medley_types::traits::Flusher;
use medley_types::{PlaybackEvent, TransactionId};
use medley_wal::ports::{CommitError, CommitOutcome, EventCommitter};

use crate::store::AnalyticsStore;
use crate::AnalyticsError;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Appender tuning.
#[derive(Debug, Clone)]
pub struct AppenderConfig {
    /// Flush when this many inserts are queued.
    pub batch_size: usize,
    /// Flush at least this often.
    pub flush_interval: Duration,
}

impl Default for AppenderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

struct PendingInsert {
    event: PlaybackEvent,
    done: oneshot::Sender<Result<CommitOutcome, CommitError>>,
}

//─────────────────────────────
//  Appender
//─────────────────────────────

/// Buffering front of the analytics store.
pub struct EventAppender {
    store: AnalyticsStore,
    queue: Mutex<Vec<PendingInsert>>,
    batch_ready: Notify,
    metrics: Arc<PipelineMetrics>,
    config: AppenderConfig,
}

impl EventAppender {
    /// Build over an open store.
    pub fn new(store: AnalyticsStore, metrics: Arc<PipelineMetrics>, config: AppenderConfig) -> Self {
        Self {
            store,
            queue: Mutex::new(Vec::new()),
            batch_ready: Notify::new(),
            metrics,
            config,
        }
    }

    /// Queue one insert. The returned receiver resolves with the insert's
    /// outcome when its batch flushes.
    pub async fn submit(
        &self,
        event: PlaybackEvent,
    ) -> oneshot::Receiver<Result<CommitOutcome, CommitError>> {
        let (done, outcome) = oneshot::channel();
        let depth = {
            let mut queue = self.queue.lock().await;
            queue.push(PendingInsert { event, done });
            queue.len()
        };
        if depth >= self.config.batch_size {
            self.batch_ready.notify_one();
        }
        outcome
    }

    /// Drain the queue in one transaction and resolve every waiter.
    pub async fn flush_now(&self) -> Result<(), AnalyticsError> {
        let batch: Vec<PendingInsert> = {
            let mut queue = self.queue.lock().await;
            std::mem::take(&mut *queue)
        };
        if batch.is_empty() {
            return Ok(());
        }
        let size = batch.len();

        match self.flush_batch(&batch).await {
            Ok(outcomes) => {
                for (pending, outcome) in batch.into_iter().zip(outcomes) {
                    let _ = pending.done.send(Ok(outcome));
                }
                self.metrics
                    .batches_flushed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.metrics
                    .events_appended
                    .fetch_add(size as u64, std::sync::atomic::Ordering::Relaxed);
                debug!(size, "appender batch flushed");
                Ok(())
            }
            Err(error) => {
                // Whole-batch failure: each entry stays in its WAL and
                // retries individually.
                warn!(size, %error, "appender batch failed");
                let detail = error.to_string();
                for pending in batch {
                    let _ = pending
                        .done
                        .send(Err(CommitError::Unavailable(detail.clone())));
                }
                Err(error)
            }
        }
    }

    async fn flush_batch(
        &self,
        batch: &[PendingInsert],
    ) -> Result<Vec<CommitOutcome>, AnalyticsError> {
        let mut tx = self.store.pool().begin().await?;
        let mut outcomes = Vec::with_capacity(batch.len());
        for pending in batch {
            let event = &pending.event;
            let payload = serde_json::to_string(event)
                .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?;
            let correlation_key = match event.kind {
                medley_types::EventKind::Play => Some(event.correlation_key.as_str()),
                _ => None,
            };
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO playback_events
                    (session_key, correlation_key, transaction_id, event_id, source,
                     server_id, user_id, username, ip_address, media_type, title,
                     kind, started_at, stopped_at, payload)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.session_key)
            .bind(correlation_key)
            .bind(event.transaction_id.map(|id| id.to_string()))
            .bind(&event.event_id)
            .bind(&event.source)
            .bind(&event.server_id)
            .bind(&event.user_id)
            .bind(&event.username)
            .bind(&event.ip_address)
            .bind(&event.media_type)
            .bind(&event.title)
            .bind(event.kind.as_str())
            .bind(event.started_at.to_rfc3339())
            .bind(event.stopped_at.map(|ts| ts.to_rfc3339()))
            .bind(payload)
            .execute(&mut *tx)
            .await?;
            outcomes.push(if result.rows_affected() == 0 {
                CommitOutcome::AlreadyPresent
            } else {
                CommitOutcome::Inserted
            });
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    /// Run interval/size-triggered flushing until cancelled; the final act
    /// is one last flush so shutdown never strands a batch.
    pub fn spawn_flush_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let appender = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(appender.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = appender.batch_ready.notified() => {}
                }
                if let Err(error) = appender.flush_now().await {
                    warn!(%error, "interval flush failed");
                }
            }
            if let Err(error) = appender.flush_now().await {
                warn!(%error, "final flush on shutdown failed");
            }
            info!("appender flush loop stopped");
        })
    }
}

#[async_trait]
impl Flusher for EventAppender {
    async fn flush(&self) -> anyhow::Result<()> {
        self.flush_now().await?;
        Ok(())
    }
}

#[async_trait]
impl EventCommitter for EventAppender {
    async fn commit_event(&self, event: &PlaybackEvent) -> Result<CommitOutcome, CommitError> {
        let outcome = self.submit(event.clone()).await;
        outcome
            .await
            .map_err(|_| CommitError::Unavailable("appender dropped the batch".to_string()))?
    }

    async fn transaction_exists(
        &self,
        transaction_id: TransactionId,
    ) -> Result<bool, CommitError> {
        self.store.transaction_exists(transaction_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_event(event_id: &str) -> PlaybackEvent {
        PlaybackEvent {
            event_id: event_id.to_string(),
            correlation_key: format!("corr-{event_id}"),
            transaction_id: Some(Uuid::new_v4()),
            source: "plex".to_string(),
            server_id: "srv".to_string(),
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
            kind: medley_types::EventKind::Play,
            started_at: Utc::now(),
            stopped_at: None,
            raw: serde_json::Value::Null,
        }
    }

    async fn appender_with(config: AppenderConfig) -> (Arc<EventAppender>, AnalyticsStore) {
        let store = AnalyticsStore::in_memory().await.unwrap();
        let appender = Arc::new(EventAppender::new(
            store.clone(),
            Arc::new(PipelineMetrics::new()),
            config,
        ));
        (appender, store)
    }

    #[tokio::test]
    async fn explicit_flush_is_a_write_barrier() {
        let (appender, store) = appender_with(AppenderConfig::default()).await;

        let rx1 = appender.submit(sample_event("e-1")).await;
        let rx2 = appender.submit(sample_event("e-2")).await;
        assert_eq!(store.event_count().await.unwrap(), 0);

        Flusher::flush(appender.as_ref()).await.unwrap();
        assert_eq!(store.event_count().await.unwrap(), 2);
        assert_eq!(rx1.await.unwrap().unwrap(), CommitOutcome::Inserted);
        assert_eq!(rx2.await.unwrap().unwrap(), CommitOutcome::Inserted);
    }

    #[tokio::test]
    async fn full_batch_triggers_flush_without_interval() {
        let (appender, store) = appender_with(AppenderConfig {
            batch_size: 2,
            flush_interval: Duration::from_secs(3600),
        })
        .await;
        let cancel = CancellationToken::new();
        let task = appender.spawn_flush_loop(cancel.clone());

        let rx1 = appender.submit(sample_event("e-1")).await;
        let rx2 = appender.submit(sample_event("e-2")).await;
        assert_eq!(rx1.await.unwrap().unwrap(), CommitOutcome::Inserted);
        assert_eq!(rx2.await.unwrap().unwrap(), CommitOutcome::Inserted);
        assert_eq!(store.event_count().await.unwrap(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn duplicates_in_one_batch_collapse() {
        let (appender, store) = appender_with(AppenderConfig::default()).await;
        let event = sample_event("e-dup");

        let rx1 = appender.submit(event.clone()).await;
        let rx2 = appender.submit(event).await;
        appender.flush_now().await.unwrap();

        assert_eq!(rx1.await.unwrap().unwrap(), CommitOutcome::Inserted);
        assert_eq!(rx2.await.unwrap().unwrap(), CommitOutcome::AlreadyPresent);
        assert_eq!(store.event_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_the_remaining_batch() {
        let (appender, store) = appender_with(AppenderConfig {
            batch_size: 1000,
            flush_interval: Duration::from_secs(3600),
        })
        .await;
        let cancel = CancellationToken::new();
        let task = appender.spawn_flush_loop(cancel.clone());

        let _rx = appender.submit(sample_event("e-1")).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(store.event_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn committer_path_round_trips() {
        let (appender, _store) = appender_with(AppenderConfig {
            batch_size: 1,
            flush_interval: Duration::from_secs(3600),
        })
        .await;
        let cancel = CancellationToken::new();
        let task = appender.spawn_flush_loop(cancel.clone());

        let event = sample_event("e-1");
        let txid = event.transaction_id.unwrap();
        let outcome = appender.commit_event(&event).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Inserted);
        assert!(appender.transaction_exists(txid).await.unwrap());

        cancel.cancel();
        task.await.unwrap();
    }
}
