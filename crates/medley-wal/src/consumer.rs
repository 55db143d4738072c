//! Consumer-side write-ahead log: the exactly-once bridge into the
//! analytics store.
//!
//! A naive consumer commits then acks (duplicates on crash) or acks then
//! commits (loss on crash). This log splits the hand-off into three steps
//! that are each safe to retry:
//!
//! 1. **Record** - persist the delivery under a fresh entry id; only then is
//!    the broker acked.
//! 2. **Commit** - idempotent insert keyed by the transaction id.
//! 3. **Confirm** - delete the entry. A missing entry means someone else
//!    finished it, which is success.
//!
//! The retry loop claims entries through durable leases, so a crash mid-hold
//! never lets two workers commit the same entry concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use medley_store::KvStore;
use medley_types::metrics::PipelineMetrics;
use medley_types::{EntryId, FailedEventRecord, FailureLayer, PlaybackEvent, TransactionId};

use crate::entries::{
    consumer_key, decode, encode, ConsumerEntry, ConsumerEntryState, CONSUMER_PREFIX,
};
use crate::lease::LeaseKeeper;
use crate::ports::{CommitOutcome, EventCommitter, FailedEventSink};
use crate::{retry_backoff, WalError};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tuning for the consumer WAL.
#[derive(Debug, Clone)]
pub struct ConsumerWalConfig {
    /// Commit attempts before an entry is promoted to failed-events.
    pub max_retries: u32,
    /// Backoff base; attempts are spaced `min(attempts * base, 5 min)`.
    pub retry_base: Duration,
    /// How often the retry loop scans for due entries.
    pub retry_interval: Duration,
    /// Durable lease time-to-live for retry claims.
    pub lease_ttl: Duration,
}

impl Default for ConsumerWalConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_base: Duration::from_secs(5),
            retry_interval: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(60),
        }
    }
}

/// What startup recovery did with the backlog.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerRecoveryReport {
    /// Entries whose transaction was already in the store; confirmed
    pub confirmed: u64,
    /// Entries committed during recovery
    pub committed: u64,
    /// Entries promoted to failed-events
    pub failed: u64,
    /// Entries left pending for the retry loop
    pub pending: u64,
}

//─────────────────────────────
//  Consumer WAL
//─────────────────────────────

/// Durable delivered-message log in front of the analytics store.
pub struct ConsumerWal {
    store: Arc<dyn KvStore>,
    /// Live path: the batched appender, so concurrent deliveries share a
    /// flush.
    live: Arc<dyn EventCommitter>,
    /// Recovery and retry path: direct row-at-a-time inserts.
    direct: Arc<dyn EventCommitter>,
    failed_sink: Arc<dyn FailedEventSink>,
    leases: LeaseKeeper,
    metrics: Arc<PipelineMetrics>,
    config: ConsumerWalConfig,
    holder: String,
    closed: AtomicBool,
}

impl ConsumerWal {
    /// Build over an open keyspace.
    pub fn new(
        store: Arc<dyn KvStore>,
        live: Arc<dyn EventCommitter>,
        direct: Arc<dyn EventCommitter>,
        failed_sink: Arc<dyn FailedEventSink>,
        metrics: Arc<PipelineMetrics>,
        config: ConsumerWalConfig,
    ) -> Self {
        let leases = LeaseKeeper::new(Arc::clone(&store), config.lease_ttl);
        Self {
            store,
            live,
            direct,
            failed_sink,
            leases,
            metrics,
            config,
            holder: format!("cwal-{}", Uuid::new_v4()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of unconfirmed entries.
    pub async fn depth(&self) -> Result<u64, WalError> {
        Ok(self.store.count_prefix(CONSUMER_PREFIX.as_bytes()).await?)
    }

    /// Step 1: durably record a delivery. The caller acks the broker only
    /// after this returns.
    pub async fn record(
        &self,
        transaction_id: TransactionId,
        event_payload: &[u8],
    ) -> Result<EntryId, WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        let entry_id = Uuid::new_v4();
        let entry = ConsumerEntry {
            entry_id,
            transaction_id,
            event_payload: event_payload.to_vec(),
            created_at: Utc::now(),
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            lease_holder: None,
            lease_expires_at: None,
            state: ConsumerEntryState::Pending,
        };
        self.store
            .put(&consumer_key(entry_id), &encode(&entry)?)
            .await?;
        self.store.flush().await?;
        self.update_depth_gauge().await;
        debug!(%entry_id, %transaction_id, "consumer entry recorded");
        Ok(entry_id)
    }

    /// Record a delivery and kick off its commit in the background.
    ///
    /// Returning `Ok` is the signal to ack the broker; the commit itself
    /// rides the batched appender and confirms (or schedules a retry) when
    /// the flush lands. Keeping the commit off the delivery path is what
    /// lets sequential deliveries share one batch.
    pub async fn handle_delivery(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        event_payload: &[u8],
    ) -> Result<EntryId, WalError> {
        let entry_id = self.record(transaction_id, event_payload).await?;
        let wal = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = wal.commit_and_confirm(entry_id, &wal.live).await {
                warn!(%entry_id, %error, "live commit failed, entry stays for retry");
            }
        });
        Ok(entry_id)
    }

    /// Steps 2 and 3 for one entry through the given committer.
    pub async fn commit_and_confirm(
        &self,
        entry_id: EntryId,
        committer: &Arc<dyn EventCommitter>,
    ) -> Result<(), WalError> {
        let key = consumer_key(entry_id);
        let Some(bytes) = self.store.get(&key).await? else {
            // Someone else confirmed it.
            return Ok(());
        };
        let entry: ConsumerEntry = decode(&key, &bytes)?;

        let event: PlaybackEvent = match serde_json::from_slice(&entry.event_payload) {
            Ok(event) => event,
            Err(error) => {
                // Unparseable payloads can never commit; promote immediately.
                self.promote(entry, "invariant", Some(error.to_string())).await?;
                return Ok(());
            }
        };

        match committer.commit_event(&event).await {
            Ok(CommitOutcome::Inserted) | Ok(CommitOutcome::AlreadyPresent) => {
                self.confirm(entry_id).await
            }
            Err(error) if error.is_permanent() => {
                self.promote(entry, "invariant", Some(error.to_string())).await
            }
            Err(error) => {
                self.mark_attempt_failed(entry_id, &error.to_string()).await?;
                Err(WalError::Commit(error))
            }
        }
    }

    /// Step 3: delete a committed entry. Missing entries are success.
    pub async fn confirm(&self, entry_id: EntryId) -> Result<(), WalError> {
        self.store.remove(&consumer_key(entry_id)).await?;
        self.store.flush().await?;
        self.leases.clear(entry_id).await?;
        self.update_depth_gauge().await;
        debug!(%entry_id, "consumer entry confirmed");
        Ok(())
    }

    /// Replay the backlog: confirm what already committed, commit the rest,
    /// promote what ran out of retries.
    pub async fn recover_on_startup(&self) -> Result<ConsumerRecoveryReport, WalError> {
        let mut report = ConsumerRecoveryReport::default();
        for (key, bytes) in self.store.scan_prefix(CONSUMER_PREFIX.as_bytes()).await? {
            let entry: ConsumerEntry = decode(&key, &bytes)?;

            if entry.attempts >= self.config.max_retries {
                self.promote(entry, "max_retries", None).await?;
                report.failed += 1;
                continue;
            }

            match self.direct.transaction_exists(entry.transaction_id).await {
                Ok(true) => {
                    // Crash landed between commit and confirm.
                    self.confirm(entry.entry_id).await?;
                    report.confirmed += 1;
                    continue;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(%error, "existence probe failed during recovery, leaving entry pending");
                    report.pending += 1;
                    continue;
                }
            }

            match self.commit_and_confirm(entry.entry_id, &self.direct).await {
                Ok(()) => report.committed += 1,
                Err(_) => report.pending += 1,
            }
        }
        self.update_depth_gauge().await;
        info!(
            confirmed = report.confirmed,
            committed = report.committed,
            failed = report.failed,
            pending = report.pending,
            "consumer WAL recovery complete"
        );
        Ok(report)
    }

    /// Run the lease-guarded retry ticker until cancelled.
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
                            error!(%error, "consumer WAL retry pass failed");
                        }
                    }
                }
            }
            debug!("consumer WAL retry loop stopped");
        })
    }

    /// One pass over due entries: claim, commit, confirm or re-mark,
    /// release.
    pub async fn retry_pass(&self) -> Result<(), WalError> {
        let now = Utc::now();
        for (key, bytes) in self.store.scan_prefix(CONSUMER_PREFIX.as_bytes()).await? {
            let mut entry: ConsumerEntry = decode(&key, &bytes)?;

            if let Some(last) = entry.last_attempt_at {
                let wait = retry_backoff(entry.attempts, self.config.retry_base);
                let due = last
                    + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::seconds(1));
                if due > now {
                    continue;
                }
            }

            // Only the lease holder may retry. A worker that lost the race
            // observes the lease and skips.
            if !self.leases.try_claim(entry.entry_id, &self.holder).await? {
                continue;
            }
            entry.lease_holder = Some(self.holder.clone());
            entry.lease_expires_at = Some(self.leases.current_expiry());
            self.store.put(&key, &encode(&entry)?).await?;

            if entry.attempts >= self.config.max_retries {
                self.promote(entry, "max_retries", None).await?;
                continue;
            }

            let _ = self.commit_and_confirm(entry.entry_id, &self.direct).await;
            self.leases.release(entry.entry_id, &self.holder).await?;
        }
        self.update_depth_gauge().await;
        Ok(())
    }

    /// Refuse new recordings; in-flight commits finish on their own.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Final step of the ordered teardown: refuse new recordings and flush
    /// the backing store. The caller cancels and awaits the retry loop
    /// before calling this; a commit that misses the flush settles through
    /// the next run's recovery.
    pub async fn shutdown(&self) -> Result<(), WalError> {
        self.close();
        self.store.flush().await?;
        Ok(())
    }

    async fn mark_attempt_failed(&self, entry_id: EntryId, error: &str) -> Result<(), WalError> {
        let key = consumer_key(entry_id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(());
        };
        let mut entry: ConsumerEntry = decode(&key, &bytes)?;
        entry.attempts += 1;
        entry.last_attempt_at = Some(Utc::now());
        entry.last_error = Some(error.to_string());
        entry.state = ConsumerEntryState::Failed;
        self.store.put(&key, &encode(&entry)?).await?;
        self.store.flush().await?;
        self.leases.release(entry_id, &self.holder).await?;
        Ok(())
    }

    async fn promote(
        &self,
        entry: ConsumerEntry,
        reason: &str,
        detail: Option<String>,
    ) -> Result<(), WalError> {
        let payload: serde_json::Value =
            serde_json::from_slice(&entry.event_payload).unwrap_or(serde_json::Value::Null);
        let (event_id, source) = match serde_json::from_slice::<PlaybackEvent>(&entry.event_payload)
        {
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
                failure_layer: FailureLayer::ConsumerWal,
                last_error: detail.or_else(|| entry.last_error.clone()),
                retry_count: entry.attempts,
            })
            .await
            .map_err(|error| WalError::FailedSink(error.to_string()))?;
        self.store.remove(&consumer_key(entry.entry_id)).await?;
        self.store.flush().await?;
        self.leases.clear(entry.entry_id).await?;
        self.metrics.failed_events.fetch_add(1, Ordering::Relaxed);
        warn!(
            entry_id = %entry.entry_id,
            txid = %entry.transaction_id,
            reason,
            "consumer entry promoted to failed-events"
        );
        self.update_depth_gauge().await;
        Ok(())
    }

    async fn update_depth_gauge(&self) {
        if let Ok(depth) = self.depth().await {
            self.metrics
                .consumer_wal_depth
                .store(depth, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::CommitError;
    use async_trait::async_trait;
    use medley_store::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-process stand-in for the analytics store: a set of committed
    /// transaction ids, optionally failing the first N commits.
    struct FakeStore {
        committed: Mutex<HashSet<Uuid>>,
        fail_remaining: Mutex<u32>,
    }

    impl FakeStore {
        fn healthy() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                committed: Mutex::new(HashSet::new()),
                fail_remaining: Mutex::new(times),
            })
        }

        fn count(&self) -> usize {
            self.committed.lock().unwrap().len()
        }

        fn mark_committed(&self, txid: Uuid) {
            self.committed.lock().unwrap().insert(txid);
        }
    }

    #[async_trait]
    impl EventCommitter for FakeStore {
        async fn commit_event(&self, event: &PlaybackEvent) -> Result<CommitOutcome, CommitError> {
            let mut remaining = self.fail_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CommitError::Unavailable("store offline".to_string()));
            }
            let txid = event.transaction_id.expect("committed events carry a txid");
            if self.committed.lock().unwrap().insert(txid) {
                Ok(CommitOutcome::Inserted)
            } else {
                Ok(CommitOutcome::AlreadyPresent)
            }
        }

        async fn transaction_exists(&self, txid: TransactionId) -> Result<bool, CommitError> {
            Ok(self.committed.lock().unwrap().contains(&txid))
        }
    }

    struct RecordingFailedSink {
        records: Mutex<Vec<FailedEventRecord>>,
    }

    #[async_trait]
    impl FailedEventSink for RecordingFailedSink {
        async fn record_failure(&self, record: FailedEventRecord) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn failed_sink() -> Arc<RecordingFailedSink> {
        Arc::new(RecordingFailedSink {
            records: Mutex::new(Vec::new()),
        })
    }

    fn payload_for(txid: Uuid) -> Vec<u8> {
        let event = PlaybackEvent {
            event_id: "e-1".to_string(),
            correlation_key: "corr".to_string(),
            transaction_id: Some(txid),
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
        };
        serde_json::to_vec(&event).unwrap()
    }

    fn wal_over(
        store: Arc<dyn KvStore>,
        committer: Arc<FakeStore>,
        failed: Arc<RecordingFailedSink>,
        config: ConsumerWalConfig,
    ) -> Arc<ConsumerWal> {
        Arc::new(ConsumerWal::new(
            store,
            Arc::clone(&committer) as Arc<dyn EventCommitter>,
            committer as Arc<dyn EventCommitter>,
            failed as Arc<dyn FailedEventSink>,
            Arc::new(PipelineMetrics::new()),
            config,
        ))
    }

    #[tokio::test]
    async fn record_commit_confirm_happy_path() {
        let committer = FakeStore::healthy();
        let wal = wal_over(
            Arc::new(MemoryStore::new()),
            Arc::clone(&committer),
            failed_sink(),
            ConsumerWalConfig::default(),
        );

        let txid = Uuid::new_v4();
        let entry_id = wal.record(txid, &payload_for(txid)).await.unwrap();
        assert_eq!(wal.depth().await.unwrap(), 1);

        wal.commit_and_confirm(entry_id, &wal.direct).await.unwrap();
        assert_eq!(wal.depth().await.unwrap(), 0);
        assert_eq!(committer.count(), 1);
    }

    #[tokio::test]
    async fn crash_before_confirm_is_repaired_without_duplicates() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let committer = FakeStore::healthy();
        let txid = Uuid::new_v4();

        // First life: the commit landed but the process died before confirm.
        {
            let wal = wal_over(
                Arc::clone(&store),
                Arc::clone(&committer),
                failed_sink(),
                ConsumerWalConfig::default(),
            );
            wal.record(txid, &payload_for(txid)).await.unwrap();
            committer.mark_committed(txid);
        }

        // Second life: recovery confirms without touching the store again.
        let wal = wal_over(
            store,
            Arc::clone(&committer),
            failed_sink(),
            ConsumerWalConfig::default(),
        );
        let report = wal.recover_on_startup().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.committed, 0);
        assert_eq!(wal.depth().await.unwrap(), 0);
        assert_eq!(committer.count(), 1);
    }

    #[tokio::test]
    async fn recovery_commits_unfinished_entries() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let committer = FakeStore::healthy();
        let txid = Uuid::new_v4();
        {
            let wal = wal_over(
                Arc::clone(&store),
                Arc::clone(&committer),
                failed_sink(),
                ConsumerWalConfig::default(),
            );
            wal.record(txid, &payload_for(txid)).await.unwrap();
        }

        let wal = wal_over(
            store,
            Arc::clone(&committer),
            failed_sink(),
            ConsumerWalConfig::default(),
        );
        let report = wal.recover_on_startup().await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(committer.count(), 1);
        assert_eq!(wal.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_pass_on_empty_wal_is_a_no_op() {
        let committer = FakeStore::healthy();
        let wal = wal_over(
            Arc::new(MemoryStore::new()),
            Arc::clone(&committer),
            failed_sink(),
            ConsumerWalConfig::default(),
        );
        wal.retry_pass().await.unwrap();
        assert_eq!(committer.count(), 0);
        assert_eq!(wal.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_commits_once() {
        let committer = FakeStore::failing(2);
        let wal = wal_over(
            Arc::new(MemoryStore::new()),
            Arc::clone(&committer),
            failed_sink(),
            ConsumerWalConfig {
                retry_base: Duration::from_millis(0),
                ..ConsumerWalConfig::default()
            },
        );

        let txid = Uuid::new_v4();
        let entry_id = wal.record(txid, &payload_for(txid)).await.unwrap();
        assert!(wal.commit_and_confirm(entry_id, &wal.direct).await.is_err());
        assert_eq!(wal.depth().await.unwrap(), 1);

        wal.retry_pass().await.unwrap(); // second failure
        wal.retry_pass().await.unwrap(); // succeeds
        assert_eq!(wal.depth().await.unwrap(), 0);
        assert_eq!(committer.count(), 1);
    }

    #[tokio::test]
    async fn exhausted_entry_lands_in_failed_events() {
        let committer = FakeStore::failing(u32::MAX);
        let failed = failed_sink();
        let max_retries = 3;
        let wal = wal_over(
            Arc::new(MemoryStore::new()),
            committer,
            Arc::clone(&failed),
            ConsumerWalConfig {
                max_retries,
                retry_base: Duration::from_millis(0),
                ..ConsumerWalConfig::default()
            },
        );

        let txid = Uuid::new_v4();
        wal.record(txid, &payload_for(txid)).await.unwrap();
        for _ in 0..=max_retries {
            wal.retry_pass().await.unwrap();
        }

        assert_eq!(wal.depth().await.unwrap(), 0);
        let records = failed.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failure_layer, FailureLayer::ConsumerWal);
        assert_eq!(records[0].failure_reason, "max_retries");
        assert_eq!(records[0].retry_count, max_retries);
    }

    #[tokio::test]
    async fn duplicate_transaction_confirms_without_second_row() {
        let committer = FakeStore::healthy();
        let wal = wal_over(
            Arc::new(MemoryStore::new()),
            Arc::clone(&committer),
            failed_sink(),
            ConsumerWalConfig::default(),
        );

        let txid = Uuid::new_v4();
        committer.mark_committed(txid);
        let entry_id = wal.record(txid, &payload_for(txid)).await.unwrap();
        wal.commit_and_confirm(entry_id, &wal.direct).await.unwrap();

        assert_eq!(committer.count(), 1);
        assert_eq!(wal.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unparseable_payload_promotes_as_invariant() {
        let committer = FakeStore::healthy();
        let failed = failed_sink();
        let wal = wal_over(
            Arc::new(MemoryStore::new()),
            committer,
            Arc::clone(&failed),
            ConsumerWalConfig::default(),
        );

        let entry_id = wal.record(Uuid::new_v4(), b"not json").await.unwrap();
        wal.commit_and_confirm(entry_id, &wal.direct).await.unwrap();

        assert_eq!(wal.depth().await.unwrap(), 0);
        let records = failed.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failure_reason, "invariant");
    }

    #[tokio::test]
    async fn foreign_lease_blocks_retry() {
        let committer = FakeStore::healthy();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let wal = wal_over(
            Arc::clone(&store),
            Arc::clone(&committer),
            failed_sink(),
            ConsumerWalConfig {
                retry_base: Duration::from_millis(0),
                ..ConsumerWalConfig::default()
            },
        );

        let txid = Uuid::new_v4();
        let entry_id = wal.record(txid, &payload_for(txid)).await.unwrap();

        // Another worker holds the entry.
        let foreign = LeaseKeeper::new(store, Duration::from_secs(60));
        assert!(foreign.try_claim(entry_id, "other-worker").await.unwrap());

        wal.retry_pass().await.unwrap();
        assert_eq!(committer.count(), 0);
        assert_eq!(wal.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_and_refuses_recordings() {
        let committer = FakeStore::healthy();
        let wal = wal_over(
            Arc::new(MemoryStore::new()),
            committer,
            failed_sink(),
            ConsumerWalConfig::default(),
        );
        let txid = Uuid::new_v4();
        wal.record(txid, &payload_for(txid)).await.unwrap();

        wal.shutdown().await.unwrap();
        assert!(matches!(
            wal.record(Uuid::new_v4(), b"{}").await,
            Err(WalError::Closed)
        ));
        // The unconfirmed entry stays for the next run's recovery.
        assert_eq!(wal.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn confirm_of_missing_entry_is_success() {
        let committer = FakeStore::healthy();
        let wal = wal_over(
            Arc::new(MemoryStore::new()),
            committer,
            failed_sink(),
            ConsumerWalConfig::default(),
        );
        wal.confirm(Uuid::new_v4()).await.unwrap();
    }
}
