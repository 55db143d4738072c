//! In-memory event-id dedup with a TTL.
//!
//! Each dispatch task owns its own set, sized by the TTL: entries older than
//! the TTL are swept on a cadence so the set stays bounded under sustained
//! traffic.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// TTL-bounded set of recently seen event ids.
#[derive(Debug)]
pub struct DedupSet {
    ttl: Duration,
    seen: HashMap<String, Instant>,
    last_sweep: Instant,
}

impl DedupSet {
    /// Remember ids for `ttl` after their first sighting.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Record a sighting. Returns `false` for a repeat within the TTL.
    pub fn observe(&mut self, event_id: &str) -> bool {
        self.maybe_sweep();
        let now = Instant::now();
        match self.seen.get(event_id) {
            Some(&first_seen) if now.duration_since(first_seen) < self.ttl => false,
            _ => {
                self.seen.insert(event_id.to_string(), now);
                true
            }
        }
    }

    /// Entries currently tracked (post-sweep count may be lower).
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn maybe_sweep(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < self.ttl {
            return;
        }
        self.seen
            .retain(|_, first_seen| now.duration_since(*first_seen) < self.ttl);
        self.last_sweep = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeats_within_ttl_are_dropped() {
        let mut dedup = DedupSet::new(Duration::from_secs(60));
        assert!(dedup.observe("e-dup"));
        assert!(!dedup.observe("e-dup"));
        assert!(dedup.observe("e-other"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_ids_are_fresh_again() {
        let mut dedup = DedupSet::new(Duration::from_secs(1));
        assert!(dedup.observe("e-1"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(dedup.observe("e-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_bounds_the_set() {
        let mut dedup = DedupSet::new(Duration::from_secs(1));
        for i in 0..100 {
            assert!(dedup.observe(&format!("e-{i}")));
        }
        assert_eq!(dedup.len(), 100);
        tokio::time::advance(Duration::from_secs(2)).await;
        // The next observation triggers the sweep.
        assert!(dedup.observe("e-new"));
        assert_eq!(dedup.len(), 1);
    }
}
