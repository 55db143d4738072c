//! Sled-backed durable stream with per-group cursors.
//!
//! Three keyspaces over the shared embedded engine:
//!
//! - `stream_records` - big-endian sequence key -> MessagePack [`StreamRecord`]
//! - `stream_cursors` - group name -> MessagePack [`CursorState`]
//! - `stream_meta`    - `next_seq` allocation counter
//!
//! The acknowledgement floor of a group advances over records that are
//! acked, filtered out by subject, or pruned by retention; everything above
//! the floor is redeliverable after a crash.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use medley_store::{KvProvider, KvStore};
use medley_types::StreamSeq;

use crate::{Broker, BrokerError, Delivery, RecordHeaders, StreamRecord, StreamSubscription};

const NEXT_SEQ_KEY: &[u8] = b"next_seq";

/// Fallback wakeup interval for subscribers, so a lost notification can
/// never stall delivery for long.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Retention and delivery tuning for the stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Records older than this are pruned (default 7 days).
    pub retention_max_age: Duration,
    /// Oldest records are pruned once the stream body exceeds this.
    pub retention_max_bytes: u64,
    /// Redeliver an unacknowledged record after this long.
    pub ack_wait: Duration,
    /// Give up on a record for a group after this many deliveries.
    pub max_deliver: u32,
    /// Bounded in-flight window per group; the subscription stops pulling
    /// until acks drain, so one slow consumer never blocks the broker.
    pub max_in_flight: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retention_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            retention_max_bytes: 1024 * 1024 * 1024,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            max_in_flight: 64,
        }
    }
}

//─────────────────────────────
//  Stream
//─────────────────────────────

/// The embedded broker: one durable stream, many durable consumer groups.
pub struct DurableStream {
    records: Arc<dyn KvStore>,
    cursors: Arc<dyn KvStore>,
    meta: Arc<dyn KvStore>,
    notify: Arc<Notify>,
    config: StreamConfig,
    closed: AtomicBool,
}

impl DurableStream {
    /// Open the stream keyspaces through the shared engine.
    pub fn open(provider: &dyn KvProvider, config: StreamConfig) -> Result<Self, BrokerError> {
        Ok(Self {
            records: provider.keyspace("stream_records")?,
            cursors: provider.keyspace("stream_cursors")?,
            meta: provider.keyspace("stream_meta")?,
            notify: Arc::new(Notify::new()),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Non-persistent stream for tests.
    pub fn in_memory(config: StreamConfig) -> Self {
        let provider = medley_store::MemoryStore::new();
        Self::open(&provider, config).expect("memory keyspaces cannot fail")
    }

    /// Number of records currently retained.
    pub async fn record_count(&self) -> Result<u64, BrokerError> {
        Ok(self.records.count_prefix(&[]).await?)
    }

    /// Prune records beyond the age and size bounds. Returns how many were
    /// removed. Cursor floors advance over pruned sequences on their own.
    pub async fn enforce_retention(&self) -> Result<u64, BrokerError> {
        let all = self.records.scan_from(&[], usize::MAX).await?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention_max_age)
                .unwrap_or_else(|_| chrono::Duration::days(7));

        let mut total_bytes: u64 = all.iter().map(|(_, value)| value.len() as u64).sum();
        let mut pruned = 0u64;

        for (key, value) in &all {
            let record: StreamRecord = decode_record(key, value)?;
            let too_old = record.published_at < cutoff;
            let too_big = total_bytes > self.config.retention_max_bytes;
            if !too_old && !too_big {
                break;
            }
            self.records.remove(key).await?;
            total_bytes -= value.len() as u64;
            pruned += 1;
        }

        if pruned > 0 {
            self.records.flush().await?;
            info!(pruned, "stream retention pruned records");
        }
        Ok(pruned)
    }

    /// Run retention enforcement on an interval until cancelled.
    pub fn spawn_retention_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let stream = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = stream.enforce_retention().await {
                            warn!(%error, "stream retention pass failed");
                        }
                    }
                }
            }
        })
    }

    async fn allocate_seq(&self) -> Result<StreamSeq, BrokerError> {
        loop {
            let current = self.meta.get(NEXT_SEQ_KEY).await?;
            let next = match &current {
                Some(bytes) => decode_seq(bytes)?,
                None => 1,
            };
            let new_bytes = next.saturating_add(1).to_be_bytes();
            let swapped = self
                .meta
                .compare_and_swap(NEXT_SEQ_KEY, current.as_deref(), Some(&new_bytes))
                .await?;
            if swapped {
                return Ok(next);
            }
        }
    }

    async fn next_seq(&self) -> Result<StreamSeq, BrokerError> {
        match self.meta.get(NEXT_SEQ_KEY).await? {
            Some(bytes) => decode_seq(&bytes),
            None => Ok(1),
        }
    }
}

#[async_trait]
impl Broker for DurableStream {
    async fn publish(
        &self,
        subject: &str,
        headers: RecordHeaders,
        body: Vec<u8>,
    ) -> Result<StreamSeq, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if subject.is_empty() || subject.split('.').any(|token| token.is_empty()) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }

        let seq = self.allocate_seq().await?;
        let record = StreamRecord {
            seq,
            subject: subject.to_string(),
            headers,
            body,
            published_at: Utc::now(),
        };
        let bytes = rmp_serde::to_vec_named(&record)
            .map_err(|error| BrokerError::Corrupt(error.to_string()))?;
        self.records.put(&seq.to_be_bytes(), &bytes).await?;
        self.records.flush().await?;
        self.notify.notify_waiters();
        debug!(seq, subject, "record published");
        Ok(seq)
    }

    async fn subscribe_durable(
        &self,
        group: &str,
        filter: &str,
    ) -> Result<Box<dyn StreamSubscription>, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let state = match self.cursors.get(group.as_bytes()).await? {
            Some(bytes) => rmp_serde::from_slice(&bytes)
                .map_err(|error| BrokerError::Corrupt(format!("cursor for {group}: {error}")))?,
            None => CursorState::default(),
        };
        info!(group, filter, floor = state.floor, "durable group attached");
        Ok(Box::new(GroupSubscription {
            records: Arc::clone(&self.records),
            cursors: Arc::clone(&self.cursors),
            meta: Arc::clone(&self.meta),
            notify: Arc::clone(&self.notify),
            group: group.to_string(),
            filter: filter.to_string(),
            config: self.config.clone(),
            in_flight: BTreeMap::new(),
            delivered_up_to: state.floor,
            state,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        self.records.flush().await?;
        self.cursors.flush().await?;
        self.meta.flush().await?;
        // Wake idle subscribers so they observe the drained stream instead
        // of sleeping out their poll interval.
        self.notify.notify_waiters();
        info!("embedded broker closed");
        Ok(())
    }
}

//─────────────────────────────
//  Consumer group subscription
//─────────────────────────────

/// Durable per-group cursor state.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CursorState {
    /// Every sequence <= floor is settled for this group.
    floor: StreamSeq,
    /// Acknowledged sequences above the floor (gap-blocked).
    acked: Vec<StreamSeq>,
    /// Delivery counters for unsettled sequences.
    deliveries: BTreeMap<StreamSeq, u32>,
}

struct GroupSubscription {
    records: Arc<dyn KvStore>,
    cursors: Arc<dyn KvStore>,
    meta: Arc<dyn KvStore>,
    notify: Arc<Notify>,
    group: String,
    filter: String,
    config: StreamConfig,
    /// seq -> redelivery deadline, for deliveries awaiting ack
    in_flight: BTreeMap<StreamSeq, Instant>,
    /// High-water mark of fresh deliveries this session
    delivered_up_to: StreamSeq,
    state: CursorState,
}

impl GroupSubscription {
    async fn load_record(&self, seq: StreamSeq) -> Result<Option<StreamRecord>, BrokerError> {
        match self.records.get(&seq.to_be_bytes()).await? {
            Some(bytes) => Ok(Some(decode_record(&seq.to_be_bytes(), &bytes)?)),
            None => Ok(None),
        }
    }

    async fn persist_cursor(&self) -> Result<(), BrokerError> {
        let bytes = rmp_serde::to_vec_named(&self.state)
            .map_err(|error| BrokerError::Corrupt(error.to_string()))?;
        self.cursors.put(self.group.as_bytes(), &bytes).await?;
        self.cursors.flush().await?;
        Ok(())
    }

    /// Advance the floor over settled sequences: acked, subject-filtered,
    /// or pruned by retention. Stops at the first unsettled matching record.
    async fn advance_floor(&mut self) -> Result<(), BrokerError> {
        let next_unallocated = match self.meta.get(NEXT_SEQ_KEY).await? {
            Some(bytes) => decode_seq(&bytes)?,
            None => 1,
        };
        loop {
            let next = self.state.floor + 1;
            if next >= next_unallocated {
                break;
            }
            if let Some(pos) = self.state.acked.iter().position(|&seq| seq == next) {
                self.state.acked.swap_remove(pos);
                self.state.deliveries.remove(&next);
                self.state.floor = next;
                continue;
            }
            match self.load_record(next).await? {
                None => {
                    // Pruned by retention.
                    self.state.deliveries.remove(&next);
                    self.state.floor = next;
                }
                Some(record) if !subject_matches_filter(&self.filter, &record.subject) => {
                    self.state.floor = next;
                }
                Some(_) => break,
            }
        }
        self.persist_cursor().await
    }

    /// Settle a sequence without delivering it (MaxDeliver exceeded or the
    /// record vanished under us).
    async fn settle_undeliverable(&mut self, seq: StreamSeq) -> Result<(), BrokerError> {
        self.in_flight.remove(&seq);
        if !self.state.acked.contains(&seq) {
            self.state.acked.push(seq);
        }
        self.advance_floor().await
    }

    /// First deliverable record at or after `from`: matches the filter and
    /// is not already settled or in flight.
    async fn next_matching(&self, from: StreamSeq) -> Result<Option<StreamRecord>, BrokerError> {
        let mut start = from;
        loop {
            let batch = self.records.scan_from(&start.to_be_bytes(), 64).await?;
            if batch.is_empty() {
                return Ok(None);
            }
            for (key, value) in &batch {
                let record = decode_record(key, value)?;
                if self.state.acked.contains(&record.seq) || self.in_flight.contains_key(&record.seq)
                {
                    continue;
                }
                if subject_matches_filter(&self.filter, &record.subject) {
                    return Ok(Some(record));
                }
                start = record.seq + 1;
            }
            let last = decode_seq(&batch.last().expect("batch not empty").0)?;
            start = start.max(last + 1);
        }
    }

    fn redelivery_due(&self, now: Instant) -> Option<StreamSeq> {
        self.in_flight
            .iter()
            .find(|(_, deadline)| **deadline <= now)
            .map(|(&seq, _)| seq)
    }

    async fn deliver(&mut self, record: StreamRecord) -> Result<Delivery, BrokerError> {
        let seq = record.seq;
        let deliveries = self.state.deliveries.get(&seq).copied().unwrap_or(0) + 1;
        self.state.deliveries.insert(seq, deliveries);
        self.persist_cursor().await?;
        self.in_flight.insert(seq, Instant::now() + self.config.ack_wait);
        Ok(Delivery {
            seq,
            subject: record.subject,
            headers: record.headers,
            body: record.body,
            deliveries,
        })
    }
}

#[async_trait]
impl StreamSubscription for GroupSubscription {
    async fn next(&mut self) -> Result<Delivery, BrokerError> {
        loop {
            // A publish landing between the scan and the wait is picked up
            // by the bounded fallback sleep.
            let notify = Arc::clone(&self.notify);
            let wakeup = notify.notified();
            let now = Instant::now();

            if let Some(seq) = self.redelivery_due(now) {
                let deliveries = self.state.deliveries.get(&seq).copied().unwrap_or(0);
                if deliveries >= self.config.max_deliver {
                    warn!(
                        group = %self.group,
                        seq,
                        deliveries,
                        "record exceeded MaxDeliver, settling without delivery"
                    );
                    self.settle_undeliverable(seq).await?;
                    continue;
                }
                match self.load_record(seq).await? {
                    Some(record) => return self.deliver(record).await,
                    None => {
                        self.settle_undeliverable(seq).await?;
                        continue;
                    }
                }
            }

            if self.in_flight.len() < self.config.max_in_flight {
                let from = self.delivered_up_to.max(self.state.floor) + 1;
                if let Some(record) = self.next_matching(from).await? {
                    if self.state.deliveries.get(&record.seq).copied().unwrap_or(0)
                        >= self.config.max_deliver
                    {
                        // Crashed mid-redelivery storm in an earlier session.
                        let seq = record.seq;
                        self.delivered_up_to = seq;
                        self.settle_undeliverable(seq).await?;
                        continue;
                    }
                    self.delivered_up_to = record.seq;
                    return self.deliver(record).await;
                }
            }

            let sleep_for = self
                .in_flight
                .values()
                .map(|deadline| deadline.saturating_duration_since(now))
                .min()
                .unwrap_or(IDLE_POLL)
                .min(IDLE_POLL);
            tokio::select! {
                _ = wakeup => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn ack(&mut self, seq: StreamSeq) -> Result<(), BrokerError> {
        if seq <= self.state.floor {
            return Ok(());
        }
        self.in_flight.remove(&seq);
        if !self.state.acked.contains(&seq) {
            self.state.acked.push(seq);
        }
        self.advance_floor().await
    }
}

fn subject_matches_filter(filter: &str, subject: &str) -> bool {
    crate::subject::subject_matches(filter, subject)
}

fn decode_record(key: &[u8], value: &[u8]) -> Result<StreamRecord, BrokerError> {
    rmp_serde::from_slice(value).map_err(|error| {
        BrokerError::Corrupt(format!("record {:?}: {error}", key))
    })
}

fn decode_seq(bytes: &[u8]) -> Result<StreamSeq, BrokerError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| BrokerError::Corrupt("sequence key is not 8 bytes".to_string()))?;
    Ok(StreamSeq::from_be_bytes(array))
}
