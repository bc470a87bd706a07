use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::{debug, info};
use uuid::Uuid;

use parley_types::frames::ServerFrame;

use super::messaging::Draft;
use super::{ClientConn, Gateway, now_ms};
use crate::bot::{self, BOT_NAME, BOT_USER_ID, BotCommand};
use crate::error::{GatewayResult, conflict, not_found, validation};
use crate::game::TicTacToe;
use crate::messages::normalize_content;
use crate::polls::{Poll, VoteOutcome};
use crate::rooms::RoomHandle;
use crate::scheduler::ScheduledMessage;
use crate::sessions::Session;
use crate::store::WriteOp;

impl Gateway {
    /// Slash commands typed into chat. The command itself is never stored;
    /// the bot's answer is.
    pub(super) async fn run_command(
        &self,
        session: &Session,
        raw_room_id: &str,
        command: BotCommand,
    ) -> GatewayResult<()> {
        if let Some(reply) = bot::canned_reply(&command) {
            return self.bot_reply(session, raw_room_id, reply).await;
        }

        match command {
            BotCommand::Poll { question, options } => {
                self.create_poll(session, raw_room_id, &question, &options, false)
                    .await
            }
            BotCommand::Game { opponent } => {
                let name = opponent.clone();
                let user = self
                    .inner
                    .store
                    .call(move |db| db.get_user_by_username(&name))
                    .await?
                    .ok_or_else(|| not_found(format!("no user named {}", opponent)))?;
                let opponent_id: Uuid = user
                    .id
                    .parse()
                    .map_err(|_| anyhow!("malformed user id {}", user.id))?;
                self.start_game(session, raw_room_id, opponent_id).await
            }
            BotCommand::Move { row, col } => self.game_move(session, raw_room_id, row, col).await,
            BotCommand::Resign => self.game_resign(session, raw_room_id).await,
            BotCommand::Schedule { delay, content } => {
                self.schedule_message(session, raw_room_id, delay, &content)
                    .await
            }
            BotCommand::Schedules => {
                let reply = schedule_list(&self.inner.scheduler.pending_for(session.user_id));
                self.bot_reply(session, raw_room_id, reply).await
            }
            BotCommand::CancelSchedule { id } => {
                self.inner.scheduler.cancel(&id, session.user_id)?;
                info!("{} cancelled scheduled message {}", session.username, id);
                self.bot_reply(session, raw_room_id, "✅ Scheduled message cancelled!".to_string())
                    .await
            }
            BotCommand::Help
            | BotCommand::Dice
            | BotCommand::Flip
            | BotCommand::Usage(_)
            | BotCommand::Unknown(_) => Ok(()),
        }
    }

    /// Post as the bot into a room the user may write to.
    async fn bot_reply(&self, session: &Session, raw_room_id: &str, reply: String) -> GatewayResult<()> {
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let mut state = room.lock().await;
        self.ensure_member(&room, &mut state, session)?;
        debug!("{} used a bot command in {}", session.username, room.id);
        self.append_message(
            &room,
            &mut state,
            Draft {
                sender_id: BOT_USER_ID,
                sender_name: BOT_NAME.to_string(),
                content: reply,
                reply_to_id: None,
                metadata: None,
            },
            None,
        );
        Ok(())
    }

    async fn schedule_message(
        &self,
        session: &Session,
        raw_room_id: &str,
        delay: Duration,
        content: &str,
    ) -> GatewayResult<()> {
        let content = normalize_content(content)?;
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let mut state = room.lock().await;
        self.ensure_member(&room, &mut state, session)?;
        let scheduled = self.inner.scheduler.schedule(
            &room.id,
            session.user_id,
            &session.username,
            content,
            Instant::now() + delay,
        )?;
        info!(
            "{} scheduled {} in {} for {}",
            session.username,
            scheduled.id,
            room.id,
            bot::format_delay(delay)
        );
        self.append_message(
            &room,
            &mut state,
            Draft {
                sender_id: BOT_USER_ID,
                sender_name: BOT_NAME.to_string(),
                content: format!(
                    "⏰ **Message Scheduled!**\n\n📝 \"{}\"\n⏱️ Will be sent in **{}**\n🆔 ID: `{}`\n\n\
                     _Use `/cancelschedule {}` to cancel._",
                    preview(&scheduled.content, 50),
                    bot::format_delay(delay),
                    scheduled.id,
                    scheduled.id
                ),
                reply_to_id: None,
                metadata: None,
            },
            None,
        );
        Ok(())
    }

    pub(super) async fn create_poll(
        &self,
        session: &Session,
        raw_room_id: &str,
        question: &str,
        options: &[String],
        anonymous: bool,
    ) -> GatewayResult<()> {
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let mut state = room.lock().await;
        self.ensure_member(&room, &mut state, session)?;
        let poll = Poll::new(
            &room.id,
            question,
            options,
            session.user_id,
            anonymous,
            now_ms(),
        )?;

        self.inner.store.write(WriteOp::InsertPoll {
            poll: poll.to_row(),
            options: poll.options.clone(),
        });
        self.inner.fanout.publish(
            &ServerFrame::PollCreated { poll: poll.view() },
            &state.members,
        );
        info!(
            "{} created poll {} in {}",
            session.username, poll.id, room.id
        );
        state.polls.insert(poll.id, poll);
        Ok(())
    }

    async fn locate_poll(&self, poll_id: Uuid) -> GatewayResult<Arc<RoomHandle>> {
        let id = poll_id.to_string();
        let room_id = self
            .inner
            .store
            .call(move |db| db.get_poll_room(&id))
            .await?
            .ok_or_else(|| not_found("poll not found"))?;
        self.inner
            .rooms
            .get(&room_id)
            .await?
            .ok_or_else(|| not_found(format!("room {} not found", room_id)))
    }

    /// Last vote wins. Repeating the current choice is acknowledged to the
    /// voter only.
    pub(super) async fn vote_poll(
        &self,
        conn: &ClientConn,
        session: &Session,
        poll_id: Uuid,
        option_id: usize,
    ) -> GatewayResult<()> {
        let room = self.locate_poll(poll_id).await?;
        let mut guard = room.lock().await;
        let state = &mut *guard;
        self.ensure_member(&room, state, session)?;
        let poll = state
            .polls
            .get_mut(&poll_id)
            .ok_or_else(|| not_found("poll not found"))?;
        let outcome = poll.vote(session.user_id, option_id)?;
        let frame = ServerFrame::PollVoted {
            poll_id,
            room_id: room.id.clone(),
            option_id,
            user_id: (!poll.anonymous).then_some(session.user_id),
            poll: poll.view(),
        };

        match outcome {
            VoteOutcome::Counted => {
                self.inner.store.write(WriteOp::SetVote {
                    poll_id: poll_id.to_string(),
                    user_id: session.user_id.to_string(),
                    option_index: option_id as i64,
                    voted_at: now_ms(),
                });
                self.inner.fanout.publish(&frame, &state.members);
            }
            VoteOutcome::Unchanged => conn.send(&frame),
        }
        Ok(())
    }

    pub(super) async fn close_poll(&self, session: &Session, poll_id: Uuid) -> GatewayResult<()> {
        let room = self.locate_poll(poll_id).await?;
        let mut guard = room.lock().await;
        let state = &mut *guard;
        let poll = state
            .polls
            .get_mut(&poll_id)
            .ok_or_else(|| not_found("poll not found"))?;
        poll.close(session.user_id)?;
        let view = poll.view();

        self.inner.store.write(WriteOp::ClosePoll(poll_id.to_string()));
        self.inner
            .fanout
            .publish(&ServerFrame::PollClosed { poll: view }, &state.members);
        info!("{} closed poll {}", session.username, poll_id);
        Ok(())
    }

    pub(super) async fn poll_results(
        &self,
        conn: &ClientConn,
        session: &Session,
        poll_id: Uuid,
    ) -> GatewayResult<()> {
        let room = self.locate_poll(poll_id).await?;
        let state = room.lock().await;
        self.ensure_reader(&room, &state, session.user_id)?;
        let poll = state
            .polls
            .get(&poll_id)
            .ok_or_else(|| not_found("poll not found"))?;
        conn.send(&poll.results_frame());
        Ok(())
    }

    pub(super) async fn start_game(
        &self,
        session: &Session,
        raw_room_id: &str,
        opponent: Uuid,
    ) -> GatewayResult<()> {
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let mut state = room.lock().await;
        self.ensure_member(&room, &mut state, session)?;
        if !state.members.contains(&opponent) {
            return Err(validation("opponent is not a member of this room"));
        }
        if state.game.as_ref().is_some_and(TicTacToe::is_active) {
            return Err(conflict("a game is already in progress in this room"));
        }

        let game = TicTacToe::new(session.user_id, opponent)?;
        self.inner.fanout.publish(
            &ServerFrame::GameState {
                game: game.view(&room.id),
            },
            &state.members,
        );
        info!(
            "{} challenged {} to tic-tac-toe in {}",
            session.username, opponent, room.id
        );
        state.game = Some(game);
        Ok(())
    }

    pub(super) async fn game_move(
        &self,
        session: &Session,
        raw_room_id: &str,
        row: u8,
        col: u8,
    ) -> GatewayResult<()> {
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let mut guard = room.lock().await;
        let state = &mut *guard;
        let game = state
            .game
            .as_mut()
            .ok_or_else(|| not_found("no game in this room"))?;
        game.play(session.user_id, row, col)?;
        let view = game.view(&room.id);
        self.inner
            .fanout
            .publish(&ServerFrame::GameState { game: view }, &state.members);
        Ok(())
    }

    pub(super) async fn game_resign(&self, session: &Session, raw_room_id: &str) -> GatewayResult<()> {
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let mut guard = room.lock().await;
        let state = &mut *guard;
        let game = state
            .game
            .as_mut()
            .ok_or_else(|| not_found("no game in this room"))?;
        game.resign(session.user_id)?;
        let view = game.view(&room.id);
        self.inner
            .fanout
            .publish(&ServerFrame::GameState { game: view }, &state.members);
        Ok(())
    }
}

fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let cut: String = content.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}

fn schedule_list(pending: &[ScheduledMessage]) -> String {
    if pending.is_empty() {
        return "📭 You have no scheduled messages.".to_string();
    }
    let now = Instant::now();
    let mut text = String::from("⏰ **Your Scheduled Messages**\n\n");
    for message in pending {
        text.push_str(&format!(
            "• `{}` - \"{}\" in {}\n",
            message.id,
            preview(&message.content, 30),
            bot::format_delay(message.remaining(now))
        ));
    }
    text
}
