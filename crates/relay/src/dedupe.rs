//! Replay filter for inbound events.
//!
//! Chat transports redeliver events when an acknowledgement is slow. The
//! cache remembers event ids for a short TTL so a replay is dropped instead of
//! starting a second task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;

use crate::clock::{Clock, SystemClock};

/// Default time an event id is remembered (5 minutes).
pub const DEFAULT_DEDUPE_TTL_SECS: u64 = 300;

pub struct DedupeCache {
    seen: DashMap<String, DateTime<Utc>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl DedupeCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    /// Record `id`. Returns `true` the first time an id is seen within the TTL.
    pub fn check_and_insert(&self, id: &str) -> bool {
        let now = self.clock.now();
        match self.seen.entry(id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
            Entry::Occupied(mut entry) => {
                if now.signed_duration_since(*entry.get()) > self.ttl {
                    entry.insert(now);
                    true
                } else {
                    debug!("Dropping replayed event {}", id);
                    false
                }
            }
        }
    }

    /// Remove every expired id. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.seen.len();
        self.seen
            .retain(|_, first_seen| now.signed_duration_since(*first_seen) <= self.ttl);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_replay_is_rejected_within_ttl() {
        let clock = ManualClock::default();
        let cache = DedupeCache::with_clock(Duration::from_secs(300), Arc::new(clock.clone()));

        assert!(cache.check_and_insert("evt-1"));
        assert!(!cache.check_and_insert("evt-1"));
        assert!(cache.check_and_insert("evt-2"));

        clock.advance(chrono::Duration::seconds(301));
        assert!(cache.check_and_insert("evt-1"));
    }

    #[test]
    fn test_sweep_expires_entries() {
        let clock = ManualClock::default();
        let cache = DedupeCache::with_clock(Duration::from_secs(60), Arc::new(clock.clone()));
        cache.check_and_insert("a");
        clock.advance(chrono::Duration::seconds(30));
        cache.check_and_insert("b");
        clock.advance(chrono::Duration::seconds(31));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.check_and_insert("b"));
    }
}
