#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-types** – Canonical playback event model for the Medley pipeline.
//!
//! This crate sits at the deterministic core layer and defines the normalized
//! event record, its three identity keys, the broker subject namespace, and
//! the small shared registries (health, metrics) that every other crate
//! reports into. It performs no I/O.
//!
//! Three orthogonal identity values travel with every event because three
//! problems need solving at once: deduplication across sources
//! (`correlation_key`), deduplication of redeliveries (`event_id`), and
//! analytics idempotency (`transaction_id`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod health;
pub mod metrics;
pub mod traits;

pub use traits::{EventSink, FailedEventSink, Flusher};

//─────────────────────────────
//  Core type aliases
//─────────────────────────────

/// Identifier assigned at producer-WAL append time, used by the analytics
/// store for idempotent insertion (UUID v4).
pub type TransactionId = Uuid;

/// Identifier for a consumer-WAL entry (UUID v4).
pub type EntryId = Uuid;

/// Monotonic position of a record within the broker stream.
pub type StreamSeq = u64;

//─────────────────────────────
//  Subject namespace
//─────────────────────────────

/// Subject filter matching every playback event.
pub const SUBJECT_WILDCARD: &str = "playback.>";

/// Build the broker subject for an event: `playback.<source>.<kind>`.
pub fn subject_for(source: &str, kind: EventKind) -> String {
    format!("playback.{}.{}", source, kind.as_str())
}

/// Build the dead-letter subject for a handler: `playback.poison.<handler>`.
pub fn poison_subject(handler: &str) -> String {
    format!("playback.poison.{handler}")
}

//─────────────────────────────
//  Event kinds
//─────────────────────────────

/// Playback lifecycle notification kinds, normalized across sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Playback started
    Play,
    /// Playback paused
    Pause,
    /// Playback resumed after a pause
    Resume,
    /// Playback stopped or finished
    Stop,
    /// Player reported a buffering stall
    Buffer,
    /// Player reported a playback error
    Error,
}

impl EventKind {
    /// Subject token for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Play => "play",
            EventKind::Pause => "pause",
            EventKind::Resume => "resume",
            EventKind::Stop => "stop",
            EventKind::Buffer => "buffer",
            EventKind::Error => "error",
        }
    }

    /// Parse a subject token back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "play" => Some(EventKind::Play),
            "pause" => Some(EventKind::Pause),
            "resume" => Some(EventKind::Resume),
            "stop" => Some(EventKind::Stop),
            "buffer" => Some(EventKind::Buffer),
            "error" => Some(EventKind::Error),
            _ => None,
        }
    }
}

//─────────────────────────────
//  Canonical event record
//─────────────────────────────

/// Canonical normalized playback event. Immutable once published.
///
/// Produced by the upstream adapters; every downstream component sees only
/// this shape. The record is fixed at v1 - there is no schema evolution of
/// the persisted form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackEvent {
    /// Stable identifier within a source; primary dedup key.
    pub event_id: String,
    /// Deterministic `source|external_session|started_at_epoch` digest
    /// identifying one playback session across sources.
    pub correlation_key: String,
    /// Assigned exactly once at producer-WAL append time; never mutated.
    /// Absent only before the event has entered the WAL.
    pub transaction_id: Option<TransactionId>,
    /// Tag of the originating upstream adapter.
    pub source: String,
    /// Identifier of the originating upstream instance.
    pub server_id: String,
    /// Upstream's own session identifier, when it has one.
    pub session_key: Option<String>,
    /// Subject identity
    pub user_id: Option<String>,
    /// Display name of the subject
    pub username: Option<String>,
    /// Client address the playback originated from
    pub ip_address: Option<String>,
    /// Media descriptor: movie, episode, track, ...
    pub media_type: Option<String>,
    /// Item title
    pub title: Option<String>,
    /// Parent title (season, album)
    pub parent_title: Option<String>,
    /// Grandparent title (show, artist)
    pub grandparent_title: Option<String>,
    /// Upstream library key of the item
    pub rating_key: Option<String>,
    /// Client machine identifier
    pub machine_id: Option<String>,
    /// Client platform
    pub platform: Option<String>,
    /// Player product name
    pub player: Option<String>,
    /// Normalized lifecycle kind
    pub kind: EventKind,
    /// Session start (UTC)
    pub started_at: DateTime<Utc>,
    /// Session end; absent for live sessions
    pub stopped_at: Option<DateTime<Utc>>,
    /// Opaque upstream payload preserved for replay
    pub raw: serde_json::Value,
}

impl PlaybackEvent {
    /// Reject events that violate the adapter-boundary invariants.
    ///
    /// An empty `event_id` or `source` can never be repaired downstream, so
    /// the adapter must refuse the event before it reaches the producer WAL.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.event_id.trim().is_empty() {
            return Err(EventError::MissingEventId);
        }
        if self.source.trim().is_empty() {
            return Err(EventError::MissingSource);
        }
        if self.correlation_key.trim().is_empty() {
            return Err(EventError::MissingCorrelationKey);
        }
        Ok(())
    }

    /// Broker subject this event publishes under.
    pub fn subject(&self) -> String {
        subject_for(&self.source, self.kind)
    }
}

/// Derive the correlation key for a playback session.
///
/// The same tuple must hash the same way on every call; a mismatch here is a
/// bug, not a data variance. The digest is sha256 over
/// `source|external_session|started_at_epoch`, rendered as lowercase hex and
/// truncated to 32 characters.
pub fn derive_correlation_key(
    source: &str,
    external_session: &str,
    started_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"|");
    hasher.update(external_session.as_bytes());
    hasher.update(b"|");
    hasher.update(started_at.timestamp().to_string().as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

//─────────────────────────────
//  Failure records
//─────────────────────────────

/// The durability layer that gave up on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureLayer {
    /// Producer WAL exhausted its publish retries
    ProducerWal,
    /// Consumer WAL exhausted its commit retries
    ConsumerWal,
    /// A router handler exhausted its retries (poison message)
    Handler,
}

impl FailureLayer {
    /// Column value stored in the analytics store.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureLayer::ProducerWal => "producer_wal",
            FailureLayer::ConsumerWal => "consumer_wal",
            FailureLayer::Handler => "handler",
        }
    }
}

/// A WAL entry promoted to a permanent failed-events row for operator triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEventRecord {
    /// Transaction id the entry carried, if it had reached the WAL
    pub transaction_id: Option<TransactionId>,
    /// Event id from the original payload, when decodable
    pub event_id: Option<String>,
    /// Source tag from the original payload, when decodable
    pub source: Option<String>,
    /// Original payload, verbatim
    pub payload: serde_json::Value,
    /// Operator-facing reason category ("invariant", "max_retries", ...)
    pub failure_reason: String,
    /// Which WAL gave up
    pub failure_layer: FailureLayer,
    /// Last error observed before promotion
    pub last_error: Option<String>,
    /// Attempts consumed before promotion
    pub retry_count: u32,
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Invariant violations detected at the adapter boundary or in the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Event arrived without a usable `event_id`
    #[error("event is missing a non-empty event_id")]
    MissingEventId,
    /// Event arrived without a source tag
    #[error("event is missing a source tag")]
    MissingSource,
    /// Correlation key was neither provided nor derivable
    #[error("event is missing a correlation key")]
    MissingCorrelationKey,
    /// Payload could not be parsed into the canonical shape
    #[error("unparseable event payload: {0}")]
    Unparseable(String),
    /// The durable front door refused the event
    #[error("event sink rejected the event: {0}")]
    SinkUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn sample_event() -> PlaybackEvent {
        let started_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        PlaybackEvent {
            event_id: "e-1".to_string(),
            correlation_key: derive_correlation_key("plex", "sess-9", started_at),
            transaction_id: None,
            source: "plex".to_string(),
            server_id: "srv-1".to_string(),
            session_key: Some("sess-9".to_string()),
            user_id: Some("42".to_string()),
            username: Some("alice".to_string()),
            ip_address: Some("203.0.113.7".to_string()),
            media_type: Some("episode".to_string()),
            title: Some("Pilot".to_string()),
            parent_title: Some("Season 1".to_string()),
            grandparent_title: Some("Some Show".to_string()),
            rating_key: Some("1234".to_string()),
            machine_id: Some("mach-1".to_string()),
            platform: Some("Roku".to_string()),
            player: Some("Living Room".to_string()),
            kind: EventKind::Play,
            started_at,
            stopped_at: None,
            raw: serde_json::json!({"type": "playback.start"}),
        }
    }

    #[test]
    fn validate_accepts_well_formed_event() {
        assert!(sample_event().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_event_id() {
        let mut event = sample_event();
        event.event_id = "  ".to_string();
        assert!(matches!(event.validate(), Err(EventError::MissingEventId)));
    }

    #[test]
    fn validate_rejects_missing_correlation_key() {
        let mut event = sample_event();
        event.correlation_key = String::new();
        assert!(matches!(
            event.validate(),
            Err(EventError::MissingCorrelationKey)
        ));
    }

    #[test]
    fn subject_follows_namespace() {
        assert_eq!(sample_event().subject(), "playback.plex.play");
        assert_eq!(poison_subject("analytics"), "playback.poison.analytics");
    }

    #[test]
    fn event_kind_round_trips_through_subject_token() {
        for kind in [
            EventKind::Play,
            EventKind::Pause,
            EventKind::Resume,
            EventKind::Stop,
            EventKind::Buffer,
            EventKind::Error,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("skip"), None);
    }

    #[test]
    fn event_serializes_round_trip() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let back: PlaybackEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    proptest! {
        #[test]
        fn correlation_key_is_deterministic(
            source in "[a-z]{1,12}",
            session in "[a-zA-Z0-9-]{1,24}",
            secs in 0i64..4_000_000_000,
        ) {
            let ts = Utc.timestamp_opt(secs, 0).unwrap();
            let a = derive_correlation_key(&source, &session, ts);
            let b = derive_correlation_key(&source, &session, ts);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.len(), 32);
        }

        #[test]
        fn correlation_key_separates_sessions(
            source in "[a-z]{1,12}",
            session_a in "[a-z0-9]{8}",
            session_b in "[a-z0-9]{8}",
            secs in 0i64..4_000_000_000,
        ) {
            prop_assume!(session_a != session_b);
            let ts = Utc.timestamp_opt(secs, 0).unwrap();
            let a = derive_correlation_key(&source, &session_a, ts);
            let b = derive_correlation_key(&source, &session_b, ts);
            prop_assert_ne!(a, b);
        }
    }
}
