//! Producer-side write-ahead log: the durable front door of the pipeline.
//!
//! `append` persists an entry and assigns the transaction id before anything
//! is acknowledged upstream; `publish` pushes the entry to the broker and
//! deletes it on ack. Entries that keep failing are retried by a
//! lease-guarded background loop and eventually promoted to the
//! failed-events table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use medley_broker::{Broker, RecordHeaders};
use medley_store::KvStore;
use medley_types::metrics::PipelineMetrics;
use medley_types::{
    EventError, EventSink, FailedEventRecord, FailureLayer, PlaybackEvent, TransactionId,
};

use crate::entries::{decode, encode, producer_key, ProducerEntry, ProducerEntryState, PRODUCER_PREFIX};
use crate::lease::LeaseKeeper;
use crate::ports::FailedEventSink;
use crate::{retry_backoff, WalError};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tuning for the producer WAL.
#[derive(Debug, Clone)]
pub struct ProducerWalConfig {
    /// Publish attempts before an entry is promoted to failed-events.
    pub max_retries: u32,
    /// Backoff base; attempts are spaced `min(attempts * base, 5 min)`.
    pub retry_base: Duration,
    /// How often the retry loop scans for pending entries.
    pub retry_interval: Duration,
    /// How often the compactor runs on the underlying store.
    pub compaction_interval: Duration,
    /// Durable lease time-to-live for retry claims.
    pub lease_ttl: Duration,
}

impl Default for ProducerWalConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_base: Duration::from_secs(2),
            retry_interval: Duration::from_secs(10),
            compaction_interval: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(60),
        }
    }
}

/// What startup recovery did with the backlog.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries republished successfully
    pub recovered: u64,
    /// Entries that stayed pending (broker still unavailable)
    pub expired: u64,
    /// Entries promoted to the failed-events table
    pub failed: u64,
}

//─────────────────────────────
//  Producer WAL
//─────────────────────────────

/// Durable outbound log in front of the broker.
pub struct ProducerWal {
    store: Arc<dyn KvStore>,
    broker: Arc<dyn Broker>,
    failed_sink: Arc<dyn FailedEventSink>,
    leases: LeaseKeeper,
    metrics: Arc<PipelineMetrics>,
    config: ProducerWalConfig,
    holder: String,
    closed: AtomicBool,
}

impl ProducerWal {
    /// Build over an open keyspace. `holder` tags durable lease claims and
    /// is unique per process.
    pub fn new(
        store: Arc<dyn KvStore>,
        broker: Arc<dyn Broker>,
        failed_sink: Arc<dyn FailedEventSink>,
        metrics: Arc<PipelineMetrics>,
        config: ProducerWalConfig,
    ) -> Self {
        let leases = LeaseKeeper::new(Arc::clone(&store), config.lease_ttl);
        Self {
            store,
            broker,
            failed_sink,
            leases,
            metrics,
            config,
            holder: format!("pwal-{}", Uuid::new_v4()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of pending entries.
    pub async fn depth(&self) -> Result<u64, WalError> {
        Ok(self.store.count_prefix(PRODUCER_PREFIX.as_bytes()).await?)
    }

    /// Synchronously persist one outbound event and assign its transaction
    /// id. The entry is durable when this returns.
    pub async fn append(&self, mut event: PlaybackEvent) -> Result<TransactionId, WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        event.validate()?;

        let transaction_id = Uuid::new_v4();
        event.transaction_id = Some(transaction_id);
        let payload = serde_json::to_vec(&event)
            .map_err(|error| WalError::Corrupt(error.to_string()))?;
        let entry = ProducerEntry {
            transaction_id,
            subject: event.subject(),
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
            lease_holder: None,
            lease_expires_at: None,
            state: ProducerEntryState::Pending,
        };
        self.store
            .put(&producer_key(transaction_id), &encode(&entry)?)
            .await?;
        self.store.flush().await?;
        self.update_depth_gauge().await;
        debug!(%transaction_id, subject = %entry.subject, "producer entry appended");
        Ok(transaction_id)
    }

    /// Attempt broker publish of a pending entry. On ack the entry is
    /// deleted; on failure it stays pending with `attempts` incremented.
    /// Returns `true` when the broker acked (an already-deleted entry counts
    /// as published - someone else finished it).
    #[instrument(skip(self), fields(txid = %transaction_id))]
    pub async fn publish(&self, transaction_id: TransactionId) -> Result<bool, WalError> {
        let key = producer_key(transaction_id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(true);
        };
        let mut entry: ProducerEntry = decode(&key, &bytes)?;

        let event: PlaybackEvent = serde_json::from_slice(&entry.payload)
            .map_err(|error| WalError::Corrupt(error.to_string()))?;
        let headers = RecordHeaders {
            event_id: event.event_id.clone(),
            transaction_id: transaction_id.to_string(),
            correlation_key: event.correlation_key.clone(),
            source: event.source.clone(),
            server_id: event.server_id.clone(),
        };

        match self
            .broker
            .publish(&entry.subject, headers, entry.payload.clone())
            .await
        {
            Ok(seq) => {
                self.store.remove(&key).await?;
                self.store.flush().await?;
                self.leases.clear(transaction_id).await?;
                self.update_depth_gauge().await;
                debug!(seq, "producer entry published and deleted");
                Ok(true)
            }
            Err(error) => {
                entry.attempts += 1;
                entry.last_error = Some(error.to_string());
                self.store.put(&key, &encode(&entry)?).await?;
                self.store.flush().await?;
                warn!(attempts = entry.attempts, %error, "broker publish failed, entry stays pending");
                Ok(false)
            }
        }
    }

    /// Replay the backlog left by a previous run. Every pending entry is
    /// either republished, left for the retry loop, or promoted.
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport, WalError> {
        let mut report = RecoveryReport::default();
        for (key, bytes) in self.store.scan_prefix(PRODUCER_PREFIX.as_bytes()).await? {
            let entry: ProducerEntry = decode(&key, &bytes)?;
            if entry.attempts >= self.config.max_retries {
                self.promote(entry, "max_retries").await?;
                report.failed += 1;
                continue;
            }
            if self.publish(entry.transaction_id).await? {
                report.recovered += 1;
            } else {
                report.expired += 1;
            }
        }
        self.update_depth_gauge().await;
        info!(
            recovered = report.recovered,
            still_pending = report.expired,
            failed = report.failed,
            "producer WAL recovery complete"
        );
        Ok(report)
    }

    /// Run the lease-guarded retry scan until cancelled.
    pub fn spawn_retry_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let wal = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(wal.config.retry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = wal.retry_pass().await {
                            error!(%error, "producer WAL retry pass failed");
                        }
                    }
                }
            }
            debug!("producer WAL retry loop stopped");
        })
    }

    /// Run store compaction until cancelled.
    pub fn spawn_compactor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let wal = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(wal.config.compaction_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = wal.store.compact().await {
                            warn!(%error, "producer WAL compaction failed");
                        }
                    }
                }
            }
        })
    }

    /// One pass over pending entries: claim, republish or promote, release.
    pub async fn retry_pass(&self) -> Result<(), WalError> {
        let now = Utc::now();
        for (key, bytes) in self.store.scan_prefix(PRODUCER_PREFIX.as_bytes()).await? {
            let mut entry: ProducerEntry = decode(&key, &bytes)?;

            // Space attempts out; enqueued_at plus cumulative backoff gates
            // the first few scans after a burst of failures.
            if entry.attempts > 0 {
                let wait = retry_backoff(entry.attempts, self.config.retry_base);
                let due = entry.enqueued_at
                    + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::seconds(1));
                if due > now {
                    continue;
                }
            }

            if !self.leases.try_claim(entry.transaction_id, &self.holder).await? {
                continue;
            }
            entry.lease_holder = Some(self.holder.clone());
            entry.lease_expires_at = Some(self.leases.current_expiry());
            self.store.put(&key, &encode(&entry)?).await?;

            let transaction_id = entry.transaction_id;
            if entry.attempts >= self.config.max_retries {
                self.promote(entry, "max_retries").await?;
            } else {
                let _ = self.publish(transaction_id).await?;
            }
            self.leases.release(transaction_id, &self.holder).await?;
        }
        self.update_depth_gauge().await;
        Ok(())
    }

    /// Refuse new appends. The retry loop and compactor keep running until
    /// their cancellation tokens fire; [`Self::shutdown`] finishes the job.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Final step of the ordered teardown: refuse new appends and flush the
    /// backing store. The caller cancels and awaits the retry loop and the
    /// compactor before calling this.
    pub async fn shutdown(&self) -> Result<(), WalError> {
        self.close();
        self.store.flush().await?;
        Ok(())
    }

    async fn promote(&self, entry: ProducerEntry, reason: &str) -> Result<(), WalError> {
        let payload: serde_json::Value =
            serde_json::from_slice(&entry.payload).unwrap_or(serde_json::Value::Null);
        let (event_id, source) = match serde_json::from_slice::<PlaybackEvent>(&entry.payload) {
            Ok(event) => (Some(event.event_id), Some(event.source)),
            Err(_) => (None, None),
        };
        self.failed_sink
            .record_failure(FailedEventRecord {
                transaction_id: Some(entry.transaction_id),
                event_id,
                source,
                payload,
                failure_reason: reason.to_string(),
                failure_layer: FailureLayer::ProducerWal,
                last_error: entry.last_error.clone(),
                retry_count: entry.attempts,
            })
            .await
            .map_err(|error| WalError::FailedSink(error.to_string()))?;
        self.store.remove(&producer_key(entry.transaction_id)).await?;
        self.store.flush().await?;
        self.leases.clear(entry.transaction_id).await?;
        self.metrics
            .failed_events
            .fetch_add(1, Ordering::Relaxed);
        warn!(txid = %entry.transaction_id, reason, "producer entry promoted to failed-events");
        Ok(())
    }

    async fn update_depth_gauge(&self) {
        if let Ok(depth) = self.depth().await {
            self.metrics
                .producer_wal_depth
                .store(depth, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl EventSink for ProducerWal {
    async fn publish(&self, event: PlaybackEvent) -> Result<TransactionId, EventError> {
        let snapshot = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        let transaction_id = match self.append(event).await {
            Ok(id) => id,
            Err(WalError::Invariant(invariant)) => {
                // Rejected immediately, but still visible to operators.
                if let Err(sink_error) = self
                    .failed_sink
                    .record_failure(FailedEventRecord {
                        transaction_id: None,
                        event_id: snapshot
                            .get("event_id")
                            .and_then(|value| value.as_str())
                            .map(str::to_string),
                        source: snapshot
                            .get("source")
                            .and_then(|value| value.as_str())
                            .map(str::to_string),
                        payload: snapshot,
                        failure_reason: "invariant".to_string(),
                        failure_layer: FailureLayer::ProducerWal,
                        last_error: Some(invariant.to_string()),
                        retry_count: 0,
                    })
                    .await
                {
                    warn!(%sink_error, "failed-events row for invariant rejection not written");
                }
                return Err(invariant);
            }
            Err(other) => return Err(EventError::SinkUnavailable(other.to_string())),
        };
        // Best-effort immediate publish; the retry loop owns failures from
        // here, so the adapter is acked regardless.
        match ProducerWal::publish(self, transaction_id).await {
            Ok(true) => {}
            Ok(false) => debug!(%transaction_id, "publish deferred to retry loop"),
            Err(error) => warn!(%transaction_id, %error, "publish errored, entry stays pending"),
        }
        Ok(transaction_id)
    }
}
