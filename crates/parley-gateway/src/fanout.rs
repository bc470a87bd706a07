use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use tracing::{error, trace};
use uuid::Uuid;

use parley_types::frames::ServerFrame;

use crate::sessions::SessionRegistry;

/// Serialize once; the same payload is shared by every recipient.
pub fn encode(frame: &ServerFrame) -> Option<Utf8Bytes> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            error!("Failed to serialize outbound frame: {}", e);
            None
        }
    }
}

/// Delivers events to every live connection of an audience.
///
/// Audiences are resolved by the caller. Callers that need per-room ordering
/// publish while holding that room's lock; delivery itself never waits.
#[derive(Clone)]
pub struct Fanout {
    sessions: Arc<SessionRegistry>,
}

impl Fanout {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }

    /// Returns the number of connections the payload was queued on.
    pub fn publish<'a>(
        &self,
        frame: &ServerFrame,
        audience: impl IntoIterator<Item = &'a Uuid>,
    ) -> usize {
        let users: HashSet<&Uuid> = audience.into_iter().collect();
        if users.is_empty() {
            return 0;
        }
        let Some(payload) = encode(frame) else {
            return 0;
        };

        let delivered = self
            .sessions
            .outbounds_for(users)
            .iter()
            .filter(|out| out.push(payload.clone()))
            .count();
        trace!("Fan-out reached {} connection(s)", delivered);
        delivered
    }

    pub fn publish_except<'a>(
        &self,
        frame: &ServerFrame,
        audience: impl IntoIterator<Item = &'a Uuid>,
        except: Uuid,
    ) -> usize {
        self.publish(frame, audience.into_iter().filter(|u| **u != except))
    }

    /// All connections of one user.
    pub fn to_user(&self, user_id: Uuid, frame: &ServerFrame) -> usize {
        self.publish(frame, [&user_id])
    }
}
