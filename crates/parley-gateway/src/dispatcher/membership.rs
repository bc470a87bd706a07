use tracing::info;
use uuid::Uuid;

use parley_types::GLOBAL_ROOM_ID;
use parley_types::frames::ServerFrame;
use parley_types::models::{PollView, RoomKind};

use super::{ClientConn, Gateway, now_ms};
use crate::error::{GatewayResult, conflict, denied, not_found, validation};
use crate::messages::DEFAULT_HISTORY;
use crate::rooms::{MembershipResult, RoomRef, resolve_room_ref};
use crate::sessions::Session;

impl Gateway {
    pub(super) async fn create_room(
        &self,
        session: &Session,
        name: &str,
        kind: Option<RoomKind>,
    ) -> GatewayResult<()> {
        let room = self
            .inner
            .rooms
            .create_room(
                name,
                kind.unwrap_or(RoomKind::Public),
                session.user_id,
                now_ms(),
            )
            .await?;
        self.inner.fanout.to_user(
            session.user_id,
            &ServerFrame::RoomCreated {
                room_id: room.id.clone(),
                room_name: room.name.clone(),
                room_type: room.kind,
            },
        );
        Ok(())
    }

    /// Join and reply with recent history and the room's polls.
    pub(super) async fn join_room(
        &self,
        conn: &ClientConn,
        session: &Session,
        raw_room_id: &str,
    ) -> GatewayResult<()> {
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let (history, polls) = {
            let mut state = room.lock().await;
            let joined = self
                .inner
                .rooms
                .join(&room, &mut state, session.user_id, now_ms())?;
            if joined == MembershipResult::Joined {
                info!("{} joined room {}", session.username, room.id);
                self.inner.fanout.publish_except(
                    &ServerFrame::UserJoinedRoom {
                        room_id: room.id.clone(),
                        user_id: session.user_id,
                        username: session.username.clone(),
                    },
                    &state.members,
                    session.user_id,
                );
            }
            let mut polls: Vec<PollView> = state.polls.values().map(|p| p.view()).collect();
            polls.sort_by_key(|p| p.created_at);
            (
                self.history_query(&room.id, None, DEFAULT_HISTORY),
                polls,
            )
        };

        let (history, next_cursor) = history.await?;
        conn.send(&ServerFrame::RoomJoined {
            room_id: room.id.clone(),
            room_name: room.name.clone(),
            room_type: room.kind,
            user_id: session.user_id,
            username: session.username.clone(),
            history,
            next_cursor,
            polls,
        });
        Ok(())
    }

    pub(super) async fn leave_room(&self, session: &Session, raw_room_id: &str) -> GatewayResult<()> {
        // resolving a DM id would create the room just to refuse leaving it
        if let RoomRef::Dm { .. } = resolve_room_ref(raw_room_id, session.user_id)? {
            return Err(validation("direct message rooms cannot be left"));
        }
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        {
            let mut state = room.lock().await;
            self.inner.rooms.leave(&room, &mut state, session.user_id)?;
            if self.inner.presence.stop_typing(&room.id, session.user_id) {
                self.inner.fanout.publish(
                    &ServerFrame::Typing {
                        room_id: room.id.clone(),
                        user_id: session.user_id,
                        username: session.username.clone(),
                        is_typing: false,
                    },
                    &state.members,
                );
            }
            self.inner.fanout.publish(
                &ServerFrame::UserLeftRoom {
                    room_id: room.id.clone(),
                    user_id: session.user_id,
                    username: session.username.clone(),
                },
                &state.members,
            );
        }
        self.inner.fanout.to_user(
            session.user_id,
            &ServerFrame::RoomLeft {
                room_id: room.id.clone(),
            },
        );
        info!("{} left room {}", session.username, room.id);
        Ok(())
    }

    pub(super) async fn get_rooms(&self, conn: &ClientConn, session: &Session) -> GatewayResult<()> {
        let mut rooms = Vec::new();
        for room in self.inner.rooms.rooms_of(session.user_id).await {
            let state = room.lock().await;
            rooms.push(room.summary(&state));
        }
        rooms.sort_by(|a, b| {
            (a.room_id != GLOBAL_ROOM_ID, &a.room_name, &a.room_id).cmp(&(
                b.room_id != GLOBAL_ROOM_ID,
                &b.room_name,
                &b.room_id,
            ))
        });
        conn.send(&ServerFrame::RoomList { rooms });
        Ok(())
    }

    /// Members add others to a room. This is the only way into a private one.
    pub(super) async fn invite(
        &self,
        session: &Session,
        raw_room_id: &str,
        invitee: Uuid,
    ) -> GatewayResult<()> {
        if let RoomRef::Dm { .. } = resolve_room_ref(raw_room_id, session.user_id)? {
            return Err(validation("direct messages cannot take invitations"));
        }
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;

        let id = invitee.to_string();
        let user = self
            .inner
            .store
            .call(move |db| db.get_user_by_id(&id))
            .await?
            .ok_or_else(|| not_found("unknown user"))?;

        {
            let mut state = room.lock().await;
            if !state.members.contains(&session.user_id) {
                return Err(denied(format!("not a member of room {}", room.id)));
            }
            if !self
                .inner
                .rooms
                .add_member(&room, &mut state, invitee, now_ms())
            {
                return Err(conflict(format!(
                    "{} is already a member of {}",
                    user.username, room.id
                )));
            }
            self.inner.fanout.publish_except(
                &ServerFrame::UserJoinedRoom {
                    room_id: room.id.clone(),
                    user_id: invitee,
                    username: user.username.clone(),
                },
                &state.members,
                invitee,
            );
        }

        self.inner.fanout.to_user(
            invitee,
            &ServerFrame::RoomInvited {
                room_id: room.id.clone(),
                room_name: room.name.clone(),
                room_type: room.kind,
                invited_by: session.user_id,
            },
        );
        info!(
            "{} invited {} to room {}",
            session.username, user.username, room.id
        );
        Ok(())
    }
}
