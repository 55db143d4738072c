//! Sqlite driver: schema, idempotent inserts, failed events, import
//! progress, alerts, and trust scores.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use medley_types::{
    EventKind, FailedEventRecord, PlaybackEvent, TransactionId,
};
use medley_wal::ports::{CommitError, CommitOutcome, EventCommitter, FailedEventSink};

use crate::AnalyticsError;

//─────────────────────────────
//  Row types
//─────────────────────────────

/// One failed-events row, as read back for triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEventRow {
    /// Row id
    pub id: i64,
    /// Transaction id carried by the entry, if any
    pub transaction_id: Option<String>,
    /// Event id from the payload, when decodable
    pub event_id: Option<String>,
    /// Source tag from the payload, when decodable
    pub source: Option<String>,
    /// Original payload
    pub payload: serde_json::Value,
    /// When the promotion happened
    pub failed_at: DateTime<Utc>,
    /// Reason category ("invariant", "max_retries", ...)
    pub failure_reason: String,
    /// Which WAL gave up ("producer_wal" | "consumer_wal")
    pub failure_layer: String,
    /// Last error observed before promotion
    pub last_error: Option<String>,
    /// Attempts consumed
    pub retry_count: i64,
    /// Triage status ("failed" | "requeued")
    pub status: String,
}

/// Historical import checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportProgress {
    /// Legacy source identifier
    pub source_id: String,
    /// Highest row id already processed
    pub last_row_id: i64,
    /// Total rows processed so far
    pub total_processed: i64,
    /// When the import began
    pub started_at: DateTime<Utc>,
    /// Last checkpoint write
    pub updated_at: DateTime<Utc>,
}

/// Persisted detection alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRow {
    /// Detector kind, e.g. "impossible_travel"
    pub kind: String,
    /// Subject the alert is about
    pub user_id: Option<String>,
    /// Event that triggered the alert
    pub event_id: String,
    /// Source of that event
    pub source: String,
    /// Human-readable description
    pub detail: String,
    /// When the detector fired
    pub raised_at: DateTime<Utc>,
}

//─────────────────────────────
//  Store
//─────────────────────────────

/// Sqlite-backed analytics store.
#[derive(Debug, Clone)]
pub struct AnalyticsStore {
    pool: SqlitePool,
}

impl AnalyticsStore {
    /// Open or create the database file and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, AnalyticsError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&url).await?;
        Self::from_pool(pool).await
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self, AnalyticsError> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and ensure the schema is current.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, AnalyticsError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Access the underlying pool (shared with the appender).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool. In-flight queries finish first.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("analytics store closed");
    }

    async fn migrate(&self) -> Result<(), AnalyticsError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS playback_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_key TEXT,
                correlation_key TEXT UNIQUE,
                transaction_id TEXT UNIQUE,
                event_id TEXT NOT NULL,
                source TEXT NOT NULL,
                server_id TEXT,
                user_id TEXT,
                username TEXT,
                ip_address TEXT,
                media_type TEXT,
                title TEXT,
                kind TEXT NOT NULL,
                started_at TEXT NOT NULL,
                stopped_at TEXT,
                payload TEXT NOT NULL,
                UNIQUE(source, event_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failed_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transaction_id TEXT,
                event_id TEXT,
                source TEXT,
                payload TEXT NOT NULL,
                failed_at TEXT NOT NULL,
                failure_reason TEXT NOT NULL,
                failure_layer TEXT NOT NULL,
                last_error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'failed'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_progress (
                source_id TEXT PRIMARY KEY,
                last_row_id INTEGER NOT NULL,
                total_processed INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                user_id TEXT,
                event_id TEXT NOT NULL,
                source TEXT NOT NULL,
                detail TEXT NOT NULL,
                raised_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trust_scores (
                user_id TEXT PRIMARY KEY,
                incidents INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_events_user ON playback_events(user_id, started_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_started ON playback_events(started_at)",
            "CREATE INDEX IF NOT EXISTS idx_failed_status ON failed_events(status)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    //─────────────────────────────
    //  Playback events
    //─────────────────────────────

    /// Idempotent insert of one canonical event.
    ///
    /// `INSERT OR IGNORE` collapses duplicate transaction ids, duplicate
    /// `(source, event_id)` pairs, and duplicate correlation keys (the
    /// cross-source session dedup; only start events carry the key so a
    /// session's later events never collide with its start).
    pub async fn insert_event(
        &self,
        event: &PlaybackEvent,
    ) -> Result<CommitOutcome, AnalyticsError> {
        let payload = serde_json::to_string(event)
            .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?;
        let correlation_key = match event.kind {
            EventKind::Play => Some(event.correlation_key.as_str()),
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
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(event_id = %event.event_id, "duplicate event ignored");
            Ok(CommitOutcome::AlreadyPresent)
        } else {
            Ok(CommitOutcome::Inserted)
        }
    }

    /// Is a transaction id already durable?
    pub async fn contains_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<bool, AnalyticsError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM playback_events WHERE transaction_id = ?",
        )
        .bind(transaction_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    /// Rows matching a `(source, event_id)` pair. Invariant: at most one.
    pub async fn count_events(
        &self,
        source: &str,
        event_id: &str,
    ) -> Result<i64, AnalyticsError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM playback_events WHERE source = ? AND event_id = ?",
        )
        .bind(source)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    /// Total persisted events.
    pub async fn event_count(&self) -> Result<i64, AnalyticsError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM playback_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    /// Recent canonical events for one user, newest first. Detection state.
    pub async fn recent_events_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PlaybackEvent>, AnalyticsError> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM playback_events
            WHERE user_id = ? AND started_at >= ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(since.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            let event = serde_json::from_str(&payload)
                .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?;
            events.push(event);
        }
        Ok(events)
    }

    //─────────────────────────────
    //  Failed events
    //─────────────────────────────

    /// Persist a promotion from either WAL.
    pub async fn insert_failed_event(
        &self,
        record: &FailedEventRecord,
    ) -> Result<i64, AnalyticsError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO failed_events
                (transaction_id, event_id, source, payload, failed_at,
                 failure_reason, failure_layer, last_error, retry_count, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'failed')
            "#,
        )
        .bind(record.transaction_id.map(|id| id.to_string()))
        .bind(&record.event_id)
        .bind(&record.source)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .bind(&record.failure_reason)
        .bind(record.failure_layer.as_str())
        .bind(&record.last_error)
        .bind(record.retry_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Failed events awaiting triage, oldest first.
    pub async fn failed_events(&self, limit: i64) -> Result<Vec<FailedEventRow>, AnalyticsError> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_id, event_id, source, payload, failed_at,
                   failure_reason, failure_layer, last_error, retry_count, status
            FROM failed_events ORDER BY id ASC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            let failed_at: String = row.get("failed_at");
            out.push(FailedEventRow {
                id: row.get("id"),
                transaction_id: row.get("transaction_id"),
                event_id: row.get("event_id"),
                source: row.get("source"),
                payload: serde_json::from_str(&payload)
                    .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?,
                failed_at: DateTime::parse_from_rfc3339(&failed_at)
                    .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?
                    .with_timezone(&Utc),
                failure_reason: row.get("failure_reason"),
                failure_layer: row.get("failure_layer"),
                last_error: row.get("last_error"),
                retry_count: row.get("retry_count"),
                status: row.get("status"),
            });
        }
        Ok(out)
    }

    /// Operator requeue: re-publish a failed event through the pipeline's
    /// front door and mark the row `requeued`.
    pub async fn requeue_failed_event(
        &self,
        id: i64,
        sink: &dyn medley_types::EventSink,
    ) -> Result<TransactionId, AnalyticsError> {
        let row = sqlx::query(
            "SELECT payload, status FROM failed_events WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AnalyticsError::NotRequeueable(id))?;

        let status: String = row.get("status");
        if status != "failed" {
            return Err(AnalyticsError::NotRequeueable(id));
        }
        let payload: String = row.get("payload");
        let mut event: PlaybackEvent = serde_json::from_str(&payload)
            .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?;
        // The front door assigns a fresh transaction id.
        event.transaction_id = None;

        let transaction_id = sink
            .publish(event)
            .await
            .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?;

        sqlx::query("UPDATE failed_events SET status = 'requeued' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        info!(id, %transaction_id, "failed event requeued");
        Ok(transaction_id)
    }

    //─────────────────────────────
    //  Import progress
    //─────────────────────────────

    /// Load the checkpoint for a legacy source.
    pub async fn load_import_progress(
        &self,
        source_id: &str,
    ) -> Result<Option<ImportProgress>, AnalyticsError> {
        let row = sqlx::query(
            r#"
            SELECT source_id, last_row_id, total_processed, started_at, updated_at
            FROM import_progress WHERE source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let started_at: String = row.get("started_at");
                let updated_at: String = row.get("updated_at");
                Ok(Some(ImportProgress {
                    source_id: row.get("source_id"),
                    last_row_id: row.get("last_row_id"),
                    total_processed: row.get("total_processed"),
                    started_at: DateTime::parse_from_rfc3339(&started_at)
                        .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?
                        .with_timezone(&Utc),
                    updated_at: DateTime::parse_from_rfc3339(&updated_at)
                        .map_err(|error| AnalyticsError::Corrupt(error.to_string()))?
                        .with_timezone(&Utc),
                }))
            }
        }
    }

    /// Upsert the checkpoint for a legacy source.
    pub async fn save_import_progress(
        &self,
        progress: &ImportProgress,
    ) -> Result<(), AnalyticsError> {
        sqlx::query(
            r#"
            INSERT INTO import_progress
                (source_id, last_row_id, total_processed, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                last_row_id = excluded.last_row_id,
                total_processed = excluded.total_processed,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&progress.source_id)
        .bind(progress.last_row_id)
        .bind(progress.total_processed)
        .bind(progress.started_at.to_rfc3339())
        .bind(progress.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    //─────────────────────────────
    //  Alerts and trust scores
    //─────────────────────────────

    /// Persist a detection alert.
    pub async fn insert_alert(&self, alert: &AlertRow) -> Result<(), AnalyticsError> {
        sqlx::query(
            r#"
            INSERT INTO alerts (kind, user_id, event_id, source, detail, raised_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.kind)
        .bind(&alert.user_id)
        .bind(&alert.event_id)
        .bind(&alert.source)
        .bind(&alert.detail)
        .bind(alert.raised_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Alerts of a given kind, for tests and the rules surface.
    pub async fn count_alerts(&self, kind: &str) -> Result<i64, AnalyticsError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM alerts WHERE kind = ?")
            .bind(kind)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    /// Bump a subject's incident counter.
    pub async fn raise_incident(&self, user_id: &str) -> Result<(), AnalyticsError> {
        sqlx::query(
            r#"
            INSERT INTO trust_scores (user_id, incidents, updated_at)
            VALUES (?, 1, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                incidents = incidents + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current incident count for a subject.
    pub async fn incident_count(&self, user_id: &str) -> Result<i64, AnalyticsError> {
        let row = sqlx::query("SELECT incidents FROM trust_scores WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("incidents")).unwrap_or(0))
    }

    /// Daily trust recovery: decrement every counter, floored at zero.
    pub async fn decay_incidents(&self, amount: i64) -> Result<u64, AnalyticsError> {
        let result = sqlx::query(
            r#"
            UPDATE trust_scores
            SET incidents = MAX(0, incidents - ?), updated_at = ?
            WHERE incidents > 0
            "#,
        )
        .bind(amount)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

//─────────────────────────────
//  WAL port implementations
//─────────────────────────────

#[async_trait]
impl EventCommitter for AnalyticsStore {
    async fn commit_event(&self, event: &PlaybackEvent) -> Result<CommitOutcome, CommitError> {
        self.insert_event(event)
            .await
            .map_err(|error| CommitError::Unavailable(error.to_string()))
    }

    async fn transaction_exists(
        &self,
        transaction_id: TransactionId,
    ) -> Result<bool, CommitError> {
        self.contains_transaction(transaction_id)
            .await
            .map_err(|error| CommitError::Unavailable(error.to_string()))
    }
}

#[async_trait]
impl FailedEventSink for AnalyticsStore {
    async fn record_failure(&self, record: FailedEventRecord) -> anyhow::Result<()> {
        match self.insert_failed_event(&record).await {
            Ok(_) => Ok(()),
            Err(error) => {
                warn!(%error, "failed-events insert failed");
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medley_types::FailureLayer;
    use uuid::Uuid;

    fn sample_event(event_id: &str, txid: Option<Uuid>) -> PlaybackEvent {
        PlaybackEvent {
            event_id: event_id.to_string(),
            correlation_key: format!("corr-{event_id}"),
            transaction_id: txid,
            source: "plex".to_string(),
            server_id: "srv".to_string(),
            session_key: Some("sess".to_string()),
            user_id: Some("42".to_string()),
            username: Some("alice".to_string()),
            ip_address: Some("203.0.113.7".to_string()),
            media_type: Some("movie".to_string()),
            title: Some("Film".to_string()),
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

    #[tokio::test]
    async fn insert_is_idempotent_on_transaction_id() {
        let store = AnalyticsStore::in_memory().await.unwrap();
        let txid = Uuid::new_v4();
        let event = sample_event("e-1", Some(txid));

        assert_eq!(
            store.insert_event(&event).await.unwrap(),
            CommitOutcome::Inserted
        );
        assert_eq!(
            store.insert_event(&event).await.unwrap(),
            CommitOutcome::AlreadyPresent
        );
        assert_eq!(store.count_events("plex", "e-1").await.unwrap(), 1);
        assert!(store.contains_transaction(txid).await.unwrap());
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_source_event_pair() {
        let store = AnalyticsStore::in_memory().await.unwrap();
        // Same (source, event_id), different transaction ids - an import
        // replay after a checkpoint gap.
        let first = sample_event("e-dup", Some(Uuid::new_v4()));
        let mut second = sample_event("e-dup", Some(Uuid::new_v4()));
        second.correlation_key = "corr-other".to_string();

        assert_eq!(
            store.insert_event(&first).await.unwrap(),
            CommitOutcome::Inserted
        );
        assert_eq!(
            store.insert_event(&second).await.unwrap(),
            CommitOutcome::AlreadyPresent
        );
        assert_eq!(store.count_events("plex", "e-dup").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn correlation_key_dedups_sessions_across_sources() {
        let store = AnalyticsStore::in_memory().await.unwrap();
        let mut from_poll = sample_event("e-poll", Some(Uuid::new_v4()));
        let mut from_hook = sample_event("e-hook", Some(Uuid::new_v4()));
        from_poll.correlation_key = "same-session".to_string();
        from_hook.correlation_key = "same-session".to_string();

        assert_eq!(
            store.insert_event(&from_poll).await.unwrap(),
            CommitOutcome::Inserted
        );
        assert_eq!(
            store.insert_event(&from_hook).await.unwrap(),
            CommitOutcome::AlreadyPresent
        );
    }

    #[tokio::test]
    async fn non_start_events_do_not_collide_on_correlation_key() {
        let store = AnalyticsStore::in_memory().await.unwrap();
        let mut play = sample_event("e-play", Some(Uuid::new_v4()));
        play.correlation_key = "sess-1".to_string();
        let mut pause = sample_event("e-pause", Some(Uuid::new_v4()));
        pause.correlation_key = "sess-1".to_string();
        pause.kind = EventKind::Pause;
        let mut stop = sample_event("e-stop", Some(Uuid::new_v4()));
        stop.correlation_key = "sess-1".to_string();
        stop.kind = EventKind::Stop;

        assert_eq!(store.insert_event(&play).await.unwrap(), CommitOutcome::Inserted);
        assert_eq!(store.insert_event(&pause).await.unwrap(), CommitOutcome::Inserted);
        assert_eq!(store.insert_event(&stop).await.unwrap(), CommitOutcome::Inserted);
        assert_eq!(store.event_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_events_round_trip_and_requeue_guard() {
        let store = AnalyticsStore::in_memory().await.unwrap();
        let id = store
            .insert_failed_event(&FailedEventRecord {
                transaction_id: Some(Uuid::new_v4()),
                event_id: Some("e-1".to_string()),
                source: Some("plex".to_string()),
                payload: serde_json::json!({"event_id": "e-1"}),
                failure_reason: "max_retries".to_string(),
                failure_layer: FailureLayer::ConsumerWal,
                last_error: Some("store offline".to_string()),
                retry_count: 10,
            })
            .await
            .unwrap();

        let rows = store.failed_events(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].failure_layer, "consumer_wal");
        assert_eq!(rows[0].retry_count, 10);
        assert_eq!(rows[0].status, "failed");
    }

    #[tokio::test]
    async fn import_progress_upserts() {
        let store = AnalyticsStore::in_memory().await.unwrap();
        assert!(store.load_import_progress("legacy").await.unwrap().is_none());

        let started = Utc::now();
        let mut progress = ImportProgress {
            source_id: "legacy".to_string(),
            last_row_id: 500,
            total_processed: 500,
            started_at: started,
            updated_at: started,
        };
        store.save_import_progress(&progress).await.unwrap();

        progress.last_row_id = 1000;
        progress.total_processed = 1000;
        store.save_import_progress(&progress).await.unwrap();

        let loaded = store.load_import_progress("legacy").await.unwrap().unwrap();
        assert_eq!(loaded.last_row_id, 1000);
        assert_eq!(loaded.total_processed, 1000);
    }

    #[tokio::test]
    async fn trust_scores_raise_and_decay_with_floor() {
        let store = AnalyticsStore::in_memory().await.unwrap();
        store.raise_incident("42").await.unwrap();
        store.raise_incident("42").await.unwrap();
        assert_eq!(store.incident_count("42").await.unwrap(), 2);

        store.decay_incidents(5).await.unwrap();
        assert_eq!(store.incident_count("42").await.unwrap(), 0);

        // Decay of a clean ledger is a no-op.
        assert_eq!(store.decay_incidents(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_events_reconstruct_canonical_payloads() {
        let store = AnalyticsStore::in_memory().await.unwrap();
        let event = sample_event("e-1", Some(Uuid::new_v4()));
        store.insert_event(&event).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let recent = store.recent_events_for_user("42", since, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_id, "e-1");
        assert_eq!(recent[0].ip_address.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn alerts_persist() {
        let store = AnalyticsStore::in_memory().await.unwrap();
        store
            .insert_alert(&AlertRow {
                kind: "impossible_travel".to_string(),
                user_id: Some("42".to_string()),
                event_id: "e-2".to_string(),
                source: "plex".to_string(),
                detail: "NYC to Tokyo in 30 minutes".to_string(),
                raised_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(store.count_alerts("impossible_travel").await.unwrap(), 1);
        assert_eq!(store.count_alerts("vpn_usage").await.unwrap(), 0);
    }
}
