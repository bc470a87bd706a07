use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{GatewayResult, denied, not_found, validation};

const MAX_PENDING_PER_USER: usize = 20;

/// A chat message held back until its due time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledMessage {
    pub id: String,
    pub room_id: String,
    pub user_id: Uuid,
    pub username: String,
    pub content: String,
    pub due: Instant,
}

impl ScheduledMessage {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.due.saturating_duration_since(now)
    }
}

/// Pending scheduled messages, in memory only. A restart drops them.
#[derive(Default)]
pub struct Scheduler {
    pending: Mutex<Vec<ScheduledMessage>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &self,
        room_id: &str,
        user_id: Uuid,
        username: &str,
        content: String,
        due: Instant,
    ) -> GatewayResult<ScheduledMessage> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.iter().filter(|m| m.user_id == user_id).count() >= MAX_PENDING_PER_USER {
            return Err(validation(format!(
                "at most {} scheduled messages per user",
                MAX_PENDING_PER_USER
            )));
        }
        let simple = Uuid::new_v4().simple().to_string();
        let message = ScheduledMessage {
            id: format!("sched_{}", &simple[..12]),
            room_id: room_id.to_string(),
            user_id,
            username: username.to_string(),
            content,
            due,
        };
        pending.push(message.clone());
        Ok(message)
    }

    /// The user's pending messages, soonest first.
    pub fn pending_for(&self, user_id: Uuid) -> Vec<ScheduledMessage> {
        let mut mine: Vec<ScheduledMessage> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by_key(|m| m.due);
        mine
    }

    /// Only the author may cancel.
    pub fn cancel(&self, id: &str, user_id: Uuid) -> GatewayResult<ScheduledMessage> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let pos = pending
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| not_found(format!("no scheduled message {}", id)))?;
        if pending[pos].user_id != user_id {
            return Err(denied("only the author can cancel a scheduled message"));
        }
        Ok(pending.remove(pos))
    }

    /// Remove and return everything due at `now`, oldest due first.
    pub fn take_due(&self, now: Instant) -> Vec<ScheduledMessage> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut due, rest): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|m| m.due <= now);
        *pending = rest;
        due.sort_by_key(|m| m.due);
        due
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_messages_leave_the_queue_in_due_order() {
        let scheduler = Scheduler::new();
        let user = Uuid::new_v4();
        let now = Instant::now();
        let later = scheduler
            .schedule("global", user, "alice", "second".into(), now + Duration::from_secs(20))
            .unwrap();
        scheduler
            .schedule("global", user, "alice", "first".into(), now + Duration::from_secs(10))
            .unwrap();
        scheduler
            .schedule("global", user, "alice", "never".into(), now + Duration::from_secs(3600))
            .unwrap();

        assert!(scheduler.take_due(now).is_empty());
        let due = scheduler.take_due(now + Duration::from_secs(30));
        let contents: Vec<&str> = due.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(due[1].id, later.id);
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.take_due(now + Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn only_the_author_cancels() {
        let scheduler = Scheduler::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let due = Instant::now() + Duration::from_secs(60);
        let msg = scheduler
            .schedule("global", alice, "alice", "hi".into(), due)
            .unwrap();
        assert!(msg.id.starts_with("sched_"));

        let err = scheduler.cancel(&msg.id, bob).unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
        assert_eq!(scheduler.pending_for(alice).len(), 1);
        assert!(scheduler.pending_for(bob).is_empty());

        scheduler.cancel(&msg.id, alice).unwrap();
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.cancel(&msg.id, alice).unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn pending_is_capped_per_user() {
        let scheduler = Scheduler::new();
        let user = Uuid::new_v4();
        let due = Instant::now() + Duration::from_secs(60);
        for _ in 0..MAX_PENDING_PER_USER {
            scheduler
                .schedule("global", user, "alice", "x".into(), due)
                .unwrap();
        }
        assert!(
            scheduler
                .schedule("global", user, "alice", "x".into(), due)
                .is_err()
        );
        assert!(
            scheduler
                .schedule("global", Uuid::new_v4(), "bob", "x".into(), due)
                .is_ok()
        );
    }
}
