//! Per-channel agent sessions.
//!
//! Each channel remembers the session id the agent reported on its last
//! successful task, so the next request can resume the same conversation.
//! Entries expire after a TTL of inactivity. Expiry is checked lazily on
//! `get` and proactively by a periodic sweep so channels that go quiet do
//! not pin memory.
//!
//! Nothing here survives a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};

use crate::clock::{Clock, SystemClock};

/// Default session TTL (10 hours).
pub const DEFAULT_SESSION_TTL_HOURS: u64 = 10;

/// A resumable agent session bound to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub channel: String,
    pub session_id: String,
    pub last_active: DateTime<Utc>,
}

/// Channel key -> session, with inactivity expiry.
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    /// Create a store using the wall clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(session.last_active) > self.ttl
    }

    /// Look up the channel's session.
    ///
    /// Expired entries are removed and reported as absent; live entries have
    /// their activity time refreshed.
    pub fn get(&self, channel: &str) -> Option<Session> {
        let now = self.clock.now();
        match self.sessions.entry(channel.to_string()) {
            Entry::Vacant(_) => None,
            Entry::Occupied(mut entry) => {
                if self.is_expired(entry.get(), now) {
                    let expired = entry.remove();
                    info!(
                        "Session {} for channel {} expired (idle since {})",
                        expired.session_id, channel, expired.last_active
                    );
                    None
                } else {
                    entry.get_mut().last_active = now;
                    Some(entry.get().clone())
                }
            }
        }
    }

    /// Insert or replace the channel's session.
    pub fn save(&self, channel: &str, session_id: &str) {
        let now = self.clock.now();
        debug!("Saving session {} for channel {}", session_id, channel);
        self.sessions.insert(
            channel.to_string(),
            Session {
                channel: channel.to_string(),
                session_id: session_id.to_string(),
                last_active: now,
            },
        );
    }

    /// Forget the channel's session. Returns whether one existed.
    pub fn clear(&self, channel: &str) -> bool {
        self.sessions.remove(channel).is_some()
    }

    /// Whether the channel has a session, without touching its activity time.
    pub fn contains(&self, channel: &str) -> bool {
        let now = self.clock.now();
        self.sessions
            .get(channel)
            .is_some_and(|s| !self.is_expired(&s, now))
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !self.is_expired(s, now));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!("Swept {} expired session(s)", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store(ttl_hours: u64) -> (SessionStore, ManualClock) {
        let clock = ManualClock::default();
        let store = SessionStore::with_clock(
            Duration::from_secs(ttl_hours * 3600),
            Arc::new(clock.clone()),
        );
        (store, clock)
    }

    #[test]
    fn test_save_and_get() {
        let (store, _clock) = store(10);
        store.save("chat-1", "sess-a");
        let session = store.get("chat-1").unwrap();
        assert_eq!(session.session_id, "sess-a");
        assert!(store.get("chat-2").is_none());
    }

    #[test]
    fn test_save_replaces_previous_session() {
        let (store, _clock) = store(10);
        store.save("chat-1", "sess-a");
        store.save("chat-1", "sess-b");
        assert_eq!(store.get("chat-1").unwrap().session_id, "sess-b");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_session_is_removed_on_get() {
        let (store, clock) = store(10);
        store.save("chat-1", "sess-a");
        clock.advance(chrono::Duration::hours(11));

        assert!(store.get("chat-1").is_none());
        assert!(store.is_empty());
        assert!(store.get("chat-1").is_none());
    }

    #[test]
    fn test_get_refreshes_activity() {
        let (store, clock) = store(10);
        store.save("chat-1", "sess-a");
        clock.advance(chrono::Duration::hours(6));
        assert!(store.get("chat-1").is_some());
        clock.advance(chrono::Duration::hours(6));
        // 12h since save, but only 6h since the last read.
        assert!(store.get("chat-1").is_some());
    }

    #[test]
    fn test_clear() {
        let (store, _clock) = store(10);
        store.save("chat-1", "sess-a");
        assert!(store.clear("chat-1"));
        assert!(!store.clear("chat-1"));
        assert!(store.get("chat-1").is_none());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (store, clock) = store(10);
        store.save("old", "sess-old");
        clock.advance(chrono::Duration::hours(9));
        store.save("new", "sess-new");
        clock.advance(chrono::Duration::hours(2));

        assert_eq!(store.sweep(), 1);
        assert!(!store.contains("old"));
        assert!(store.contains("new"));
    }
}
