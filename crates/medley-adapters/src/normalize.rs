//! Source payload normalization.
//!
//! Upstream notifications arrive as loose JSON; this module maps them onto
//! the canonical event, derives the correlation key, and synthesizes a
//! deterministic event id when the source does not provide one - the same
//! upstream notification must always normalize to the same identity, or
//! redelivery dedup falls apart.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use medley_types::{derive_correlation_key, EventError, EventKind, PlaybackEvent};

fn str_field<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| raw.get(*key).and_then(Value::as_str))
        .filter(|value| !value.is_empty())
}

fn parse_timestamp(raw: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    for key in keys {
        match raw.get(*key) {
            Some(Value::String(text)) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                    return Some(parsed.with_timezone(&Utc));
                }
            }
            Some(Value::Number(number)) => {
                if let Some(epoch) = number.as_i64() {
                    if let Some(parsed) = Utc.timestamp_opt(epoch, 0).single() {
                        return Some(parsed);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Map a source's notification-type string onto the canonical kind.
pub(crate) fn parse_kind(tag: &str) -> Option<EventKind> {
    match tag {
        "playback.start" | "media.play" | "play" | "start" => Some(EventKind::Play),
        "playback.pause" | "media.pause" | "pause" => Some(EventKind::Pause),
        "playback.resume" | "media.resume" | "resume" => Some(EventKind::Resume),
        "playback.stop" | "media.stop" | "stop" | "finished" => Some(EventKind::Stop),
        "playback.buffer" | "media.buffer" | "buffer" => Some(EventKind::Buffer),
        "playback.error" | "media.error" | "error" => Some(EventKind::Error),
        _ => None,
    }
}

/// Normalize one upstream notification into the canonical event.
///
/// The correlation key is always derived here, never downstream. A payload
/// without a recognizable kind, or without either an event id or a session
/// to derive one from, is unparseable.
pub fn normalize_event(
    source: &str,
    server_id: &str,
    raw: &Value,
) -> Result<PlaybackEvent, EventError> {
    let kind_tag = str_field(raw, &["event", "type", "notification_type"])
        .ok_or_else(|| EventError::Unparseable("missing event type".to_string()))?;
    let kind = parse_kind(kind_tag)
        .ok_or_else(|| EventError::Unparseable(format!("unknown event type {kind_tag:?}")))?;

    let session_key = str_field(raw, &["session_key", "session_id", "session"]);
    let started_at = parse_timestamp(raw, &["started_at", "start_time", "timestamp"])
        .unwrap_or_else(Utc::now);

    let event_id = match str_field(raw, &["event_id", "id"]) {
        Some(id) => id.to_string(),
        None => {
            // Deterministic synthesis so redeliveries share an identity.
            let session = session_key.ok_or_else(|| {
                EventError::Unparseable("neither event_id nor session present".to_string())
            })?;
            format!(
                "{source}-{session}-{}-{}",
                kind.as_str(),
                started_at.timestamp()
            )
        }
    };

    let correlation_session = session_key.unwrap_or(event_id.as_str());
    let correlation_key = derive_correlation_key(source, correlation_session, started_at);
    let event = PlaybackEvent {
        event_id,
        correlation_key,
        transaction_id: None,
        source: source.to_string(),
        server_id: str_field(raw, &["server_id"]).unwrap_or(server_id).to_string(),
        session_key: session_key.map(str::to_string),
        user_id: str_field(raw, &["user_id", "account_id"]).map(str::to_string),
        username: str_field(raw, &["username", "user", "account_name"]).map(str::to_string),
        ip_address: str_field(raw, &["ip_address", "address", "remote_ip"]).map(str::to_string),
        media_type: str_field(raw, &["media_type"]).map(str::to_string),
        title: str_field(raw, &["title", "full_title"]).map(str::to_string),
        parent_title: str_field(raw, &["parent_title"]).map(str::to_string),
        grandparent_title: str_field(raw, &["grandparent_title"]).map(str::to_string),
        rating_key: str_field(raw, &["rating_key", "item_id"]).map(str::to_string),
        machine_id: str_field(raw, &["machine_id", "device_id"]).map(str::to_string),
        platform: str_field(raw, &["platform"]).map(str::to_string),
        player: str_field(raw, &["player", "player_title"]).map(str::to_string),
        kind,
        started_at,
        stopped_at: parse_timestamp(raw, &["stopped_at", "stop_time"]),
        raw: raw.clone(),
    };
    event.validate()?;
    Ok(event)
}
