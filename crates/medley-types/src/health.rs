//! Component health registry.
//!
//! Each long-running component reports its own status; the aggregate exposed
//! to operational probes is the minimum of the children. The registry is
//! constructed once by the runtime and threaded through constructors - there
//! is no global singleton.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Health of a single component, ordered worst-first so that the aggregate
/// is simply the minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Component cannot do its job
    Unhealthy,
    /// Component is limping (retrying, backlogged) but making progress
    Degraded,
    /// Component is operating normally
    Healthy,
}

/// One component's report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Current state
    pub state: HealthState,
    /// Human-readable detail, e.g. "wal depth 1204"
    pub detail: String,
}

/// Aggregated snapshot served through the operational surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Minimum of all component states
    pub state: HealthState,
    /// Per-component reports, keyed by component name
    pub components: Vec<(String, HealthReport)>,
}

/// Mutex-free registry of component health reports.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    components: DashMap<String, HealthReport>,
}

impl HealthRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or replace a component's report.
    pub fn report(&self, component: &str, state: HealthState, detail: impl Into<String>) {
        self.components.insert(
            component.to_string(),
            HealthReport {
                state,
                detail: detail.into(),
            },
        );
    }

    /// Remove a component (it stopped cleanly and should not count).
    pub fn retire(&self, component: &str) {
        self.components.remove(component);
    }

    /// Aggregate snapshot: the overall state is the minimum of the children.
    /// An empty registry reports healthy - nothing has failed yet.
    pub fn snapshot(&self) -> HealthSnapshot {
        let mut components: Vec<(String, HealthReport)> = self
            .components
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        components.sort_by(|a, b| a.0.cmp(&b.0));
        let state = components
            .iter()
            .map(|(_, report)| report.state)
            .min()
            .unwrap_or(HealthState::Healthy);
        HealthSnapshot { state, components }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.snapshot().state, HealthState::Healthy);
    }

    #[test]
    fn aggregate_is_minimum_of_children() {
        let registry = HealthRegistry::new();
        registry.report("broker", HealthState::Healthy, "ok");
        registry.report("producer_wal", HealthState::Degraded, "depth 300");
        assert_eq!(registry.snapshot().state, HealthState::Degraded);

        registry.report("analytics", HealthState::Unhealthy, "pool closed");
        assert_eq!(registry.snapshot().state, HealthState::Unhealthy);
    }

    #[test]
    fn retired_component_no_longer_counts() {
        let registry = HealthRegistry::new();
        registry.report("import", HealthState::Unhealthy, "source gone");
        registry.retire("import");
        assert_eq!(registry.snapshot().state, HealthState::Healthy);
    }

    #[test]
    fn snapshot_serializes_for_probe_endpoint() {
        let registry = HealthRegistry::new();
        registry.report("router", HealthState::Healthy, "4 handlers");
        let json = serde_json::to_string(&registry.snapshot()).unwrap();
        assert!(json.contains("router"));
        assert!(json.contains("healthy"));
    }
}
