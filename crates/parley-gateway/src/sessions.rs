use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use parley_types::frames::ServerFrame;

use crate::fanout::encode;

/// An authenticated identity bound to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub authenticated_at: i64,
    pub last_seen: i64,
}

/// Write half of a connection's outbound queue.
///
/// The queue is bounded. A consumer that falls behind is disconnected rather
/// than allowed to stall whoever is publishing.
#[derive(Clone)]
pub struct Outbound {
    conn_id: Uuid,
    tx: mpsc::Sender<Utf8Bytes>,
    cancel: CancellationToken,
}

impl Outbound {
    pub fn new(conn_id: Uuid, tx: mpsc::Sender<Utf8Bytes>, cancel: CancellationToken) -> Self {
        Self {
            conn_id,
            tx,
            cancel,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queue an already-serialized payload. Returns false if the connection
    /// is gone or was just dropped for overflowing.
    pub fn push(&self, payload: Utf8Bytes) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue full for connection {}, dropping it",
                    self.conn_id
                );
                self.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn send(&self, frame: &ServerFrame) -> bool {
        match encode(frame) {
            Some(payload) => self.push(payload),
            None => false,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

struct Entry {
    session: Session,
    outbound: Outbound,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<Uuid, Entry>,
    /// user_id -> live conn_ids (multi-device)
    by_user: HashMap<Uuid, HashSet<Uuid>>,
}

/// Live authenticated connections, by connection id and by user.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session to its connection. Returns true if this is the user's
    /// first live session.
    pub fn register(&self, session: Session, outbound: Outbound) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let conns = inner.by_user.entry(session.user_id).or_default();
        conns.insert(session.conn_id);
        let first = conns.len() == 1;
        inner
            .sessions
            .insert(session.conn_id, Entry { session, outbound });
        first
    }

    pub fn lookup(&self, conn_id: Uuid) -> Option<Session> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.sessions.get(&conn_id).map(|e| e.session.clone())
    }

    /// Remove a session. The flag is true when it was the user's last one.
    pub fn terminate(&self, conn_id: Uuid) -> Option<(Session, bool)> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let entry = inner.sessions.remove(&conn_id)?;
        let user_id = entry.session.user_id;
        let last = match inner.by_user.get_mut(&user_id) {
            Some(conns) => {
                conns.remove(&conn_id);
                conns.is_empty()
            }
            None => true,
        };
        if last {
            inner.by_user.remove(&user_id);
        }
        Some((entry.session, last))
    }

    pub fn touch(&self, conn_id: Uuid, now: i64) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = inner.sessions.get_mut(&conn_id) {
            entry.session.last_seen = now;
        }
    }

    /// Outbound queues of every live connection belonging to `users`.
    pub fn outbounds_for<'a>(&self, users: impl IntoIterator<Item = &'a Uuid>) -> Vec<Outbound> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        for user_id in users {
            if let Some(conns) = inner.by_user.get(user_id) {
                for conn_id in conns {
                    if let Some(entry) = inner.sessions.get(conn_id) {
                        out.push(entry.outbound.clone());
                    }
                }
            }
        }
        out
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_user.contains_key(&user_id)
    }

    /// One entry per online user.
    pub fn online_users(&self) -> Vec<(Uuid, String)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_user
            .iter()
            .filter_map(|(user_id, conns)| {
                let conn_id = conns.iter().next()?;
                let entry = inner.sessions.get(conn_id)?;
                Some((*user_id, entry.session.username.clone()))
            })
            .collect()
    }

    /// Online user with this name, compared case-insensitively.
    pub fn find_online_by_name(&self, username: &str) -> Option<Uuid> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .sessions
            .values()
            .find(|e| e.session.username.eq_ignore_ascii_case(username))
            .map(|e| e.session.user_id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        for entry in inner.sessions.values() {
            entry.outbound.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user_id: Uuid, name: &str) -> (Session, Outbound, mpsc::Receiver<Utf8Bytes>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(2);
        let session = Session {
            conn_id,
            user_id,
            username: name.to_string(),
            authenticated_at: 0,
            last_seen: 0,
        };
        (session, Outbound::new(conn_id, tx, CancellationToken::new()), rx)
    }

    #[test]
    fn tracks_multiple_sessions_per_user() {
        let registry = SessionRegistry::new();
        let alice = Uuid::new_v4();
        let (s1, o1, _r1) = session(alice, "alice");
        let (s2, o2, _r2) = session(alice, "alice");
        let (c1, c2) = (s1.conn_id, s2.conn_id);

        assert!(registry.register(s1, o1));
        assert!(!registry.register(s2, o2));
        assert_eq!(registry.online_users().len(), 1);
        assert_eq!(registry.outbounds_for(&[alice]).len(), 2);

        let (_, last) = registry.terminate(c1).unwrap();
        assert!(!last);
        assert!(registry.is_online(alice));
        let (_, last) = registry.terminate(c2).unwrap();
        assert!(last);
        assert!(!registry.is_online(alice));
        assert!(registry.terminate(c2).is_none());
    }

    #[test]
    fn full_queue_cancels_only_that_connection() {
        let (_, slow, _rx) = session(Uuid::new_v4(), "slow");
        assert!(slow.push("1".into()));
        assert!(slow.push("2".into()));
        assert!(!slow.push("3".into()));
        assert!(slow.is_closed());

        let (_, fast, mut rx) = session(Uuid::new_v4(), "fast");
        assert!(fast.push("1".into()));
        assert!(!fast.is_closed());
        assert_eq!(rx.try_recv().unwrap().as_str(), "1");
    }

    #[test]
    fn finds_online_user_by_name() {
        let registry = SessionRegistry::new();
        let bob = Uuid::new_v4();
        let (s, o, _rx) = session(bob, "Bob");
        registry.register(s, o);
        assert_eq!(registry.find_online_by_name("bob"), Some(bob));
        assert_eq!(registry.find_online_by_name("carol"), None);
    }
}
