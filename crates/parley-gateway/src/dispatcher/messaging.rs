use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::MutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

use parley_db::models::ReactionRow;
use parley_types::frames::ServerFrame;
use parley_types::models::MessageView;

use super::{ClientConn, Gateway, now_ms};
use crate::ai::{self, AI_FALLBACK, AI_NAME, AI_USER_ID};
use crate::bot;
use crate::error::{GatewayError, GatewayResult, denied, not_found, validation};
use crate::messages::{Message, history_limit, history_page, normalize_content};
use crate::rooms::{RoomHandle, RoomState};
use crate::sessions::{Outbound, Session};
use crate::store::WriteOp;

const MAX_MENTION_CHARS: usize = 32;

/// A message about to be appended.
pub(super) struct Draft {
    pub sender_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub reply_to_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl Gateway {
    pub(super) async fn chat(
        &self,
        conn: &ClientConn,
        session: &Session,
        raw_room_id: &str,
        content: &str,
        reply_to_id: Option<i64>,
        metadata: Option<serde_json::Value>,
    ) -> GatewayResult<()> {
        if let Some(command) = bot::parse(content) {
            return self.run_command(session, raw_room_id, command).await;
        }
        let content = normalize_content(content)?;
        if metadata.as_ref().is_some_and(|m| !m.is_object()) {
            return Err(validation("metadata must be an object"));
        }

        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let message = {
            let mut state = room.lock().await;
            self.ensure_member(&room, &mut state, session)?;
            let message = self.append_message(
                &room,
                &mut state,
                Draft {
                    sender_id: session.user_id,
                    sender_name: session.username.clone(),
                    content,
                    reply_to_id,
                    metadata,
                },
                Some(&conn.outbound),
            );
            self.notify_mentions(&state, &message);
            message
        };

        if let Some(prompt) = ai::extract_prompt(&message.content) {
            self.spawn_ai_reply(room, prompt.to_string());
        }
        Ok(())
    }

    /// Assign the next id, fan out, cache, then persist. Runs under the room
    /// lock; nothing here waits.
    pub(super) fn append_message(
        &self,
        room: &RoomHandle,
        state: &mut RoomState,
        draft: Draft,
        ack: Option<&Outbound>,
    ) -> Message {
        let message = Message {
            id: self.next_message_id(),
            room_id: room.id.clone(),
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            content: draft.content,
            created_at: now_ms(),
            edited_at: None,
            version: 0,
            is_deleted: false,
            is_pinned: false,
            reply_to_id: draft.reply_to_id,
            metadata: draft.metadata,
            reactions: Vec::new(),
        };

        // The sender's `chat` must reach its queue before `message_saved`.
        self.inner.fanout.publish(
            &ServerFrame::Chat {
                message: message.view(),
            },
            &state.members,
        );
        state.messages.insert(message.id, message.clone());

        let row = WriteOp::InsertMessage(message.to_row());
        match ack {
            Some(outbound) => {
                let outbound = outbound.clone();
                let (message_id, room_id) = (message.id, message.room_id.clone());
                self.inner.store.write_then(row, move |result| {
                    let frame = match result {
                        Ok(()) => ServerFrame::MessageSaved {
                            message_id,
                            room_id,
                        },
                        Err(_) => ServerFrame::error(
                            "PERSISTENCE_FAILED",
                            format!("message {message_id} could not be saved"),
                        ),
                    };
                    outbound.send(&frame);
                });
            }
            None => self.inner.store.write(row),
        }
        debug!(
            "Message {} appended to {} by {}",
            message.id, room.id, message.sender_name
        );
        message
    }

    fn notify_mentions(&self, state: &RoomState, message: &Message) {
        let mut notified = HashSet::new();
        for name in mentioned_names(&message.content) {
            let Some(user_id) = self.inner.sessions.find_online_by_name(name) else {
                continue;
            };
            if user_id == message.sender_id
                || !state.members.contains(&user_id)
                || !notified.insert(user_id)
            {
                continue;
            }
            self.inner.fanout.to_user(
                user_id,
                &ServerFrame::Mention {
                    room_id: message.room_id.clone(),
                    message_id: message.id,
                    from: message.sender_name.clone(),
                    from_user_id: message.sender_id,
                },
            );
        }
    }

    /// Ask the completion provider off the room's critical section, then
    /// post whatever came back.
    fn spawn_ai_reply(&self, room: Arc<RoomHandle>, prompt: String) {
        let Some(provider) = self.inner.ai.clone() else {
            return;
        };
        let gateway = self.clone();
        tokio::spawn(async move {
            let reply = ai::complete_with_retry(provider.as_ref(), &prompt, 1).await;
            if reply.is_none() {
                info!("AI request in {} failed, posting fallback", room.id);
            }
            let mut state = room.lock().await;
            gateway.append_message(
                &room,
                &mut state,
                Draft {
                    sender_id: AI_USER_ID,
                    sender_name: AI_NAME.to_string(),
                    content: reply.unwrap_or_else(|| AI_FALLBACK.to_string()),
                    reply_to_id: None,
                    metadata: None,
                },
                None,
            );
        });
    }

    /// Members pass; a public room admits the user on the spot.
    pub(super) fn ensure_member(
        &self,
        room: &RoomHandle,
        state: &mut RoomState,
        session: &Session,
    ) -> GatewayResult<()> {
        if state.members.contains(&session.user_id) {
            return Ok(());
        }
        if !room.is_open() {
            return Err(denied(format!("not a member of room {}", room.id)));
        }
        self.inner
            .rooms
            .add_member(room, state, session.user_id, now_ms());
        self.inner.fanout.publish_except(
            &ServerFrame::UserJoinedRoom {
                room_id: room.id.clone(),
                user_id: session.user_id,
                username: session.username.clone(),
            },
            &state.members,
            session.user_id,
        );
        Ok(())
    }

    /// Members, or anyone at all for a public room.
    pub(super) fn ensure_reader(
        &self,
        room: &RoomHandle,
        state: &RoomState,
        user_id: Uuid,
    ) -> GatewayResult<()> {
        if room.is_open() || state.members.contains(&user_id) {
            Ok(())
        } else {
            Err(denied(format!("not a member of room {}", room.id)))
        }
    }

    async fn locate_message(&self, message_id: i64) -> GatewayResult<Arc<RoomHandle>> {
        let room_id = self
            .inner
            .store
            .call(move |db| Ok(db.get_message(message_id)?.map(|m| m.room_id)))
            .await?
            .ok_or_else(|| not_found(format!("message {} not found", message_id)))?;
        self.inner
            .rooms
            .get(&room_id)
            .await?
            .ok_or_else(|| not_found(format!("room {} not found", room_id)))
    }

    /// Lock the room with the message guaranteed to be in its cache. A miss
    /// loads the message with the lock released and only inserts it if no
    /// one else did meanwhile.
    async fn lock_with_message<'a>(
        &self,
        room: &'a RoomHandle,
        message_id: i64,
    ) -> GatewayResult<MutexGuard<'a, RoomState>> {
        {
            let state = room.lock().await;
            if state.messages.contains(&message_id) {
                return Ok(state);
            }
        }

        let loaded = self
            .inner
            .store
            .call(move |db| {
                let Some(row) = db.get_message(message_id)? else {
                    return Ok(None);
                };
                let reactions = db.get_reactions_for_messages(&[message_id])?;
                Message::from_row(row, &reactions).map(Some)
            })
            .await?
            .ok_or_else(|| not_found(format!("message {} not found", message_id)))?;

        let mut state = room.lock().await;
        state.messages.insert_if_absent(message_id, loaded);
        Ok(state)
    }

    pub(super) async fn edit_message(
        &self,
        session: &Session,
        message_id: i64,
        content: &str,
        base_version: Option<u32>,
    ) -> GatewayResult<()> {
        let room = self.locate_message(message_id).await?;
        let mut guard = self.lock_with_message(&room, message_id).await?;
        let state = &mut *guard;
        let message = cached(state, message_id)?;
        let outcome = message.edit(session.user_id, content, base_version, now_ms())?;
        let new_content = message.content.clone();

        self.inner.store.write(WriteOp::EditMessage {
            id: message_id,
            content: new_content.clone(),
            edited_at: outcome.edited_at,
            version: i64::from(outcome.version),
        });
        self.inner.fanout.publish(
            &ServerFrame::MessageEdited {
                message_id,
                room_id: room.id.clone(),
                new_content,
                edited_at: outcome.edited_at,
                version: outcome.version,
                user_id: session.user_id,
            },
            &state.members,
        );
        Ok(())
    }

    pub(super) async fn delete_message(&self, session: &Session, message_id: i64) -> GatewayResult<()> {
        let room = self.locate_message(message_id).await?;
        let mut guard = self.lock_with_message(&room, message_id).await?;
        let state = &mut *guard;
        cached(state, message_id)?.soft_delete(session.user_id)?;

        self.inner.store.write(WriteOp::DeleteMessage(message_id));
        self.inner.fanout.publish(
            &ServerFrame::MessageDeleted {
                message_id,
                room_id: room.id.clone(),
                user_id: session.user_id,
            },
            &state.members,
        );
        Ok(())
    }

    pub(super) async fn add_reaction(
        &self,
        session: &Session,
        message_id: i64,
        emoji: &str,
    ) -> GatewayResult<()> {
        let emoji = emoji.trim();
        let room = self.locate_message(message_id).await?;
        let mut guard = self.lock_with_message(&room, message_id).await?;
        let state = &mut *guard;
        self.ensure_member(&room, state, session)?;
        let added = cached(state, message_id)?.add_reaction(
            session.user_id,
            &session.username,
            emoji,
        )?;
        if !added {
            return Ok(());
        }

        self.inner.store.write(WriteOp::AddReaction(ReactionRow {
            message_id,
            user_id: session.user_id.to_string(),
            username: session.username.clone(),
            emoji: emoji.to_string(),
            created_at: now_ms(),
        }));
        self.inner.fanout.publish(
            &ServerFrame::ReactionAdded {
                message_id,
                room_id: room.id.clone(),
                emoji: emoji.to_string(),
                user_id: session.user_id,
                username: session.username.clone(),
            },
            &state.members,
        );
        Ok(())
    }

    pub(super) async fn remove_reaction(
        &self,
        session: &Session,
        message_id: i64,
        emoji: &str,
    ) -> GatewayResult<()> {
        let emoji = emoji.trim();
        let room = self.locate_message(message_id).await?;
        let mut guard = self.lock_with_message(&room, message_id).await?;
        let state = &mut *guard;
        if !cached(state, message_id)?.remove_reaction(session.user_id, emoji) {
            return Ok(());
        }

        self.inner.store.write(WriteOp::RemoveReaction {
            message_id,
            user_id: session.user_id.to_string(),
            emoji: emoji.to_string(),
        });
        self.inner.fanout.publish(
            &ServerFrame::ReactionRemoved {
                message_id,
                room_id: room.id.clone(),
                emoji: emoji.to_string(),
                user_id: session.user_id,
            },
            &state.members,
        );
        Ok(())
    }

    pub(super) async fn get_reactions(
        &self,
        conn: &ClientConn,
        session: &Session,
        message_id: i64,
    ) -> GatewayResult<()> {
        let room = self.locate_message(message_id).await?;
        let mut guard = self.lock_with_message(&room, message_id).await?;
        let state = &mut *guard;
        self.ensure_reader(&room, state, session.user_id)?;
        let reactions = cached(state, message_id)?.reaction_views();
        conn.send(&ServerFrame::ReactionsList {
            message_id,
            reactions,
        });
        Ok(())
    }

    pub(super) async fn pin_message(
        &self,
        session: &Session,
        message_id: i64,
        pinned: bool,
    ) -> GatewayResult<()> {
        let room = self.locate_message(message_id).await?;
        let mut guard = self.lock_with_message(&room, message_id).await?;
        let state = &mut *guard;
        if !room.is_moderator(state, session.user_id) {
            return Err(denied("only room moderators can pin messages"));
        }
        let message = cached(state, message_id)?;
        if message.is_deleted {
            return Err(GatewayError::AlreadyDeleted);
        }
        if message.is_pinned == pinned {
            return Ok(());
        }
        message.is_pinned = pinned;

        self.inner
            .store
            .write(WriteOp::SetPinned { id: message_id, pinned });
        self.inner.fanout.publish(
            &ServerFrame::MessagePinned {
                message_id,
                room_id: room.id.clone(),
                pinned,
                user_id: session.user_id,
            },
            &state.members,
        );
        Ok(())
    }

    pub(super) async fn get_history(
        &self,
        conn: &ClientConn,
        session: &Session,
        raw_room_id: &str,
        limit: Option<u32>,
        before: Option<i64>,
    ) -> GatewayResult<()> {
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let page = {
            let state = room.lock().await;
            self.ensure_reader(&room, &state, session.user_id)?;
            self.history_query(&room.id, before, history_limit(limit))
        };
        let (messages, next_cursor) = page.await?;
        conn.send(&ServerFrame::History {
            room_id: room.id.clone(),
            messages,
            next_cursor,
        });
        Ok(())
    }

    /// Queue a history read. The read is ordered after every write already
    /// queued, so it sees all messages published before the call.
    pub(super) fn history_query(
        &self,
        room_id: &str,
        before: Option<i64>,
        limit: u32,
    ) -> impl Future<Output = anyhow::Result<(Vec<MessageView>, Option<i64>)>> + Send + use<>
    {
        let room_id = room_id.to_string();
        self.inner.store.call(move |db| {
            let rows = db.get_messages(&room_id, before, limit)?;
            let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
            let reactions = db.get_reactions_for_messages(&ids)?;
            history_page(rows, &reactions, limit)
        })
    }
}

fn cached(state: &mut RoomState, message_id: i64) -> GatewayResult<&mut Message> {
    state
        .messages
        .get_mut(&message_id)
        .ok_or_else(|| not_found(format!("message {} not found", message_id)))
}

/// `@name` tokens, in order of appearance. An `@` glued to a preceding word
/// character (an email address) does not count.
fn mentioned_names(content: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut prev: Option<char> = None;
    for (i, c) in content.char_indices() {
        if c == '@' && !prev.is_some_and(|p| p.is_ascii_alphanumeric() || p == '_') {
            let rest = &content[i + 1..];
            let len = rest
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .unwrap_or(rest.len());
            if (1..=MAX_MENTION_CHARS).contains(&len) {
                names.push(&rest[..len]);
            }
        }
        prev = Some(c);
    }
    names
}
