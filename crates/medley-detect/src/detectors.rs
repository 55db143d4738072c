//! The detector catalog.
//!
//! Each detector is a pure function of one event plus recent state. The
//! catalog is built once at boot from [`DetectorConfig`] variants; order is
//! evaluation order.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use medley_types::{EventKind, PlaybackEvent};

use crate::{Alert, DetectionContext, Detector};

//─────────────────────────────
//  Configuration catalog
//─────────────────────────────

/// Tagged-variant detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    /// Geographic distance over elapsed time beyond a physical maximum.
    ImpossibleTravel {
        /// Fastest plausible travel, km/h (commercial flight ≈ 900)
        max_speed_kmh: f64,
    },
    /// Too many simultaneously open sessions for one subject.
    ConcurrentStreams {
        /// Open-session cap
        max_streams: usize,
    },
    /// One device hopping addresses too quickly.
    IpVelocity {
        /// Distinct addresses allowed per device in the lookback window
        max_ips: usize,
    },
    /// One subject playing from too many places at once.
    SimultaneousLocations {
        /// Distinct countries allowed among open sessions
        max_locations: usize,
    },
    /// Playback from outside the allowed country list.
    GeoRestriction {
        /// ISO country codes that are allowed
        allowed_countries: Vec<String>,
    },
    /// A platform the subject has never used before.
    UserAgentAnomaly,
    /// Playback through a known VPN/proxy range.
    VpnUsage,
}

/// Build the ordered catalog from configuration.
pub fn build_detectors(configs: &[DetectorConfig]) -> Vec<Box<dyn Detector>> {
    configs
        .iter()
        .map(|config| -> Box<dyn Detector> {
            match config.clone() {
                DetectorConfig::ImpossibleTravel { max_speed_kmh } => {
                    Box::new(ImpossibleTravel { max_speed_kmh })
                }
                DetectorConfig::ConcurrentStreams { max_streams } => {
                    Box::new(ConcurrentStreams { max_streams })
                }
                DetectorConfig::IpVelocity { max_ips } => Box::new(IpVelocity { max_ips }),
                DetectorConfig::SimultaneousLocations { max_locations } => {
                    Box::new(SimultaneousLocations { max_locations })
                }
                DetectorConfig::GeoRestriction { allowed_countries } => {
                    Box::new(GeoRestriction { allowed_countries })
                }
                DetectorConfig::UserAgentAnomaly => Box::new(UserAgentAnomaly),
                DetectorConfig::VpnUsage => Box::new(VpnUsage),
            }
        })
        .collect()
}

/// Great-circle distance between two coordinates, in kilometres.
pub fn haversine_km(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat_b - lat_a).to_radians();
    let d_lon = (lon_b - lon_a).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat_a.to_radians().cos() * lat_b.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

fn alert(kind: &str, event: &PlaybackEvent, detail: String) -> Alert {
    Alert {
        kind: kind.to_string(),
        user_id: event.user_id.clone(),
        event_id: event.event_id.clone(),
        source: event.source.clone(),
        detail,
        raised_at: Utc::now(),
    }
}

/// Sessions in `events` with a start and no stop, grouped by correlation
/// key. The current event counts when it is itself a start.
fn open_sessions<'a>(
    events: &'a [PlaybackEvent],
    current: &'a PlaybackEvent,
) -> Vec<&'a PlaybackEvent> {
    let stopped: HashSet<&str> = events
        .iter()
        .chain(std::iter::once(current))
        .filter(|event| event.kind == EventKind::Stop)
        .map(|event| event.correlation_key.as_str())
        .collect();

    let mut seen = HashSet::new();
    let mut open = Vec::new();
    for event in events.iter().chain(std::iter::once(current)) {
        if event.kind != EventKind::Play && event.kind != EventKind::Resume {
            continue;
        }
        if stopped.contains(event.correlation_key.as_str()) {
            continue;
        }
        if seen.insert(event.correlation_key.as_str()) {
            open.push(event);
        }
    }
    open
}

//─────────────────────────────
//  Detectors
//─────────────────────────────

struct ImpossibleTravel {
    max_speed_kmh: f64,
}

#[async_trait]
impl Detector for ImpossibleTravel {
    fn kind(&self) -> &'static str {
        "impossible_travel"
    }

    async fn evaluate(
        &self,
        event: &PlaybackEvent,
        ctx: &DetectionContext,
    ) -> anyhow::Result<Vec<Alert>> {
        let Some(current_ip) = event.ip_address.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(here) = ctx.geo.locate(current_ip).await? else {
            return Ok(Vec::new());
        };

        // Most recent prior event from a different address.
        let recent = ctx.recent_for(event).await?;
        let Some(previous) = recent.iter().find(|prior| {
            prior.event_id != event.event_id
                && prior.ip_address.as_deref().is_some_and(|ip| ip != current_ip)
        }) else {
            return Ok(Vec::new());
        };
        let Some(prev_ip) = previous.ip_address.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(there) = ctx.geo.locate(prev_ip).await? else {
            return Ok(Vec::new());
        };

        let distance_km = haversine_km(there.latitude, there.longitude, here.latitude, here.longitude);
        let elapsed = event.started_at - previous.started_at;
        let hours = (elapsed.num_seconds().max(1) as f64) / 3600.0;
        let speed = distance_km / hours;
        if speed <= self.max_speed_kmh {
            return Ok(Vec::new());
        }
        Ok(vec![alert(
            self.kind(),
            event,
            format!(
                "{distance_km:.0} km in {:.0} minutes ({speed:.0} km/h) between {prev_ip} and {current_ip}",
                hours * 60.0
            ),
        )])
    }
}

struct ConcurrentStreams {
    max_streams: usize,
}

#[async_trait]
impl Detector for ConcurrentStreams {
    fn kind(&self) -> &'static str {
        "concurrent_streams"
    }

    async fn evaluate(
        &self,
        event: &PlaybackEvent,
        ctx: &DetectionContext,
    ) -> anyhow::Result<Vec<Alert>> {
        let recent = ctx.recent_for(event).await?;
        let open = open_sessions(&recent, event);
        if open.len() <= self.max_streams {
            return Ok(Vec::new());
        }
        Ok(vec![alert(
            self.kind(),
            event,
            format!("{} open sessions exceed the cap of {}", open.len(), self.max_streams),
        )])
    }
}

struct IpVelocity {
    max_ips: usize,
}

#[async_trait]
impl Detector for IpVelocity {
    fn kind(&self) -> &'static str {
        "ip_velocity"
    }

    async fn evaluate(
        &self,
        event: &PlaybackEvent,
        ctx: &DetectionContext,
    ) -> anyhow::Result<Vec<Alert>> {
        let Some(machine_id) = event.machine_id.as_deref() else {
            return Ok(Vec::new());
        };
        let recent = ctx.recent_for(event).await?;
        let addresses: HashSet<&str> = recent
            .iter()
            .chain(std::iter::once(event))
            .filter(|candidate| candidate.machine_id.as_deref() == Some(machine_id))
            .filter_map(|candidate| candidate.ip_address.as_deref())
            .collect();
        if addresses.len() <= self.max_ips {
            return Ok(Vec::new());
        }
        Ok(vec![alert(
            self.kind(),
            event,
            format!(
                "device {machine_id} used {} addresses in the lookback window",
                addresses.len()
            ),
        )])
    }
}

struct SimultaneousLocations {
    max_locations: usize,
}

#[async_trait]
impl Detector for SimultaneousLocations {
    fn kind(&self) -> &'static str {
        "simultaneous_locations"
    }

    async fn evaluate(
        &self,
        event: &PlaybackEvent,
        ctx: &DetectionContext,
    ) -> anyhow::Result<Vec<Alert>> {
        let recent = ctx.recent_for(event).await?;
        let open = open_sessions(&recent, event);

        let mut countries = HashSet::new();
        for session in open {
            if let Some(ip) = session.ip_address.as_deref() {
                if let Some(location) = ctx.geo.locate(ip).await? {
                    countries.insert(location.country);
                }
            }
        }
        if countries.len() <= self.max_locations {
            return Ok(Vec::new());
        }
        Ok(vec![alert(
            self.kind(),
            event,
            format!("open sessions span {} countries", countries.len()),
        )])
    }
}

struct GeoRestriction {
    allowed_countries: Vec<String>,
}

#[async_trait]
impl Detector for GeoRestriction {
    fn kind(&self) -> &'static str {
        "geo_restriction"
    }

    async fn evaluate(
        &self,
        event: &PlaybackEvent,
        ctx: &DetectionContext,
    ) -> anyhow::Result<Vec<Alert>> {
        let Some(ip) = event.ip_address.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(location) = ctx.geo.locate(ip).await? else {
            return Ok(Vec::new());
        };
        if self.allowed_countries.iter().any(|c| c == &location.country) {
            return Ok(Vec::new());
        }
        Ok(vec![alert(
            self.kind(),
            event,
            format!("playback from {} is outside the allowed regions", location.country),
        )])
    }
}

struct UserAgentAnomaly;

#[async_trait]
impl Detector for UserAgentAnomaly {
    fn kind(&self) -> &'static str {
        "user_agent_anomaly"
    }

    async fn evaluate(
        &self,
        event: &PlaybackEvent,
        ctx: &DetectionContext,
    ) -> anyhow::Result<Vec<Alert>> {
        let Some(platform) = event.platform.as_deref() else {
            return Ok(Vec::new());
        };
        let recent = ctx.recent_for(event).await?;
        let history: HashSet<&str> = recent
            .iter()
            .filter(|prior| prior.event_id != event.event_id)
            .filter_map(|prior| prior.platform.as_deref())
            .collect();
        // A first-ever event is not an anomaly; an unseen platform amid an
        // established history is.
        if history.is_empty() || history.contains(platform) {
            return Ok(Vec::new());
        }
        Ok(vec![alert(
            self.kind(),
            event,
            format!("first sighting of platform {platform} for this subject"),
        )])
    }
}

struct VpnUsage;

#[async_trait]
impl Detector for VpnUsage {
    fn kind(&self) -> &'static str {
        "vpn_usage"
    }

    async fn evaluate(
        &self,
        event: &PlaybackEvent,
        ctx: &DetectionContext,
    ) -> anyhow::Result<Vec<Alert>> {
        let Some(ip) = event.ip_address.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(location) = ctx.geo.locate(ip).await? else {
            return Ok(Vec::new());
        };
        if !location.is_vpn {
            return Ok(Vec::new());
        }
        Ok(vec![alert(
            self.kind(),
            event,
            format!("address {ip} belongs to a known VPN range"),
        )])
    }
}
