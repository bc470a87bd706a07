use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use parley_types::models::PresenceStatus;

/// A typing indicator that was cleared without an explicit stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredTyping {
    pub room_id: String,
    pub user_id: Uuid,
    pub username: String,
}

struct TypingEntry {
    username: String,
    expires_at: Instant,
}

/// Ephemeral presence and typing state. Never persisted.
pub struct PresenceTracker {
    ttl: Duration,
    statuses: Mutex<HashMap<Uuid, PresenceStatus>>,
    typing: Mutex<HashMap<(String, Uuid), TypingEntry>>,
}

impl PresenceTracker {
    pub fn new(typing_ttl: Duration) -> Self {
        Self {
            ttl: typing_ttl,
            statuses: Mutex::new(HashMap::new()),
            typing: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the previous status.
    pub fn set_status(&self, user_id: Uuid, status: PresenceStatus) -> Option<PresenceStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, status)
    }

    /// What the user set, or offline if they have no live session.
    pub fn status(&self, user_id: Uuid) -> PresenceStatus {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .copied()
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn remove(&self, user_id: Uuid) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id);
    }

    /// Registers or refreshes a typing entry. True if the user was not
    /// already typing in that room.
    pub fn start_typing(&self, room_id: &str, user_id: Uuid, username: &str, now: Instant) -> bool {
        let mut typing = self.typing.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = TypingEntry {
            username: username.to_string(),
            expires_at: now + self.ttl,
        };
        typing
            .insert((room_id.to_string(), user_id), entry)
            .is_none()
    }

    /// True if an entry was removed.
    pub fn stop_typing(&self, room_id: &str, user_id: Uuid) -> bool {
        self.typing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(room_id.to_string(), user_id))
            .is_some()
    }

    /// Drop every typing entry of a user, e.g. on disconnect.
    pub fn clear_user(&self, user_id: Uuid) -> Vec<ExpiredTyping> {
        self.drain_where(|(_, uid), _| *uid == user_id)
    }

    pub fn is_typing(&self, room_id: &str, user_id: Uuid) -> bool {
        self.typing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(room_id.to_string(), user_id))
    }

    /// Entries whose expiry has passed.
    pub fn sweep(&self, now: Instant) -> Vec<ExpiredTyping> {
        self.drain_where(|_, entry| entry.expires_at <= now)
    }

    fn drain_where<F>(&self, mut pred: F) -> Vec<ExpiredTyping>
    where
        F: FnMut(&(String, Uuid), &TypingEntry) -> bool,
    {
        let mut typing = self.typing.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<(String, Uuid)> = typing
            .iter()
            .filter(|&(k, v)| pred(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                let entry = typing.remove(&key)?;
                Some(ExpiredTyping {
                    room_id: key.0,
                    user_id: key.1,
                    username: entry.username,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_expires_after_ttl() {
        let tracker = PresenceTracker::new(Duration::from_secs(5));
        let alice = Uuid::new_v4();
        let t0 = Instant::now();

        assert!(tracker.start_typing("global", alice, "alice", t0));
        assert!(!tracker.start_typing("global", alice, "alice", t0 + Duration::from_secs(2)));

        // refreshed at t0+2, so still alive at t0+6
        assert!(tracker.sweep(t0 + Duration::from_secs(6)).is_empty());
        let expired = tracker.sweep(t0 + Duration::from_secs(8));
        assert_eq!(
            expired,
            vec![ExpiredTyping {
                room_id: "global".into(),
                user_id: alice,
                username: "alice".into(),
            }]
        );
        assert!(!tracker.is_typing("global", alice));
    }

    #[test]
    fn clear_user_drops_all_rooms() {
        let tracker = PresenceTracker::new(Duration::from_secs(5));
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Instant::now();
        tracker.start_typing("a", alice, "alice", now);
        tracker.start_typing("b", alice, "alice", now);
        tracker.start_typing("a", bob, "bob", now);

        assert_eq!(tracker.clear_user(alice).len(), 2);
        assert!(tracker.is_typing("a", bob));
        assert!(!tracker.stop_typing("a", alice));
        assert!(tracker.stop_typing("a", bob));
    }

    #[test]
    fn unknown_user_is_offline() {
        let tracker = PresenceTracker::new(Duration::from_secs(5));
        let alice = Uuid::new_v4();
        assert_eq!(tracker.status(alice), PresenceStatus::Offline);
        tracker.set_status(alice, PresenceStatus::Dnd);
        assert_eq!(tracker.status(alice), PresenceStatus::Dnd);
        tracker.remove(alice);
        assert_eq!(tracker.status(alice), PresenceStatus::Offline);
    }
}
