use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::GLOBAL_ROOM_ID;
use parley_types::frames::{ClientFrame, ServerFrame};
use parley_types::models::{OnlineUser, PresenceStatus};

use crate::ai::CompletionProvider;
use crate::auth::{self, Authenticator};
use crate::config::GatewayConfig;
use crate::error::{AuthError, GatewayError, GatewayResult, denied, validation};
use crate::fanout::Fanout;
use crate::presence::{ExpiredTyping, PresenceTracker};
use crate::rooms::RoomDirectory;
use crate::scheduler::Scheduler;
use crate::sessions::{Outbound, Session, SessionRegistry};
use crate::storage::BlobStorage;
use crate::store::Store;
use crate::uploads::UploadCoordinator;

mod interactive;
mod membership;
mod messaging;
mod transfers;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// What the socket loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Per-connection state owned by the socket loop.
pub struct ClientConn {
    conn_id: Uuid,
    outbound: Outbound,
    cancel: CancellationToken,
    session: Option<Session>,
    malformed: u32,
}

impl ClientConn {
    pub fn id(&self) -> Uuid {
        self.conn_id
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Cancelled when the connection must go away: queue overflow, server
    /// shutdown, or the socket loop finishing.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn send(&self, frame: &ServerFrame) {
        self.outbound.send(frame);
    }

    fn require_session(&self) -> GatewayResult<Session> {
        self.session.clone().ok_or(GatewayError::NotAuthenticated)
    }
}

/// The command dispatcher and everything it routes to.
///
/// Cheap to clone; every clone shares the same registry, rooms and store.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    auth: Authenticator,
    store: Store,
    sessions: Arc<SessionRegistry>,
    fanout: Fanout,
    rooms: RoomDirectory,
    presence: PresenceTracker,
    uploads: UploadCoordinator,
    scheduler: Scheduler,
    ai: Option<Arc<dyn CompletionProvider>>,
    /// Global message id sequence, seeded past the highest stored id.
    next_message_id: AtomicI64,
}

impl Gateway {
    pub async fn new(
        db: Arc<Database>,
        config: GatewayConfig,
        ai: Option<Arc<dyn CompletionProvider>>,
    ) -> anyhow::Result<Self> {
        let next_id = db.max_message_id()? + 1;
        let store = Store::spawn(db)?;
        let storage =
            BlobStorage::new(config.upload_dir.clone(), config.upload_temp_dir.clone()).await?;
        let sessions = Arc::new(SessionRegistry::new());

        info!(
            "Gateway ready (next message id {}, AI {})",
            next_id,
            if ai.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            inner: Arc::new(GatewayInner {
                auth: Authenticator::new(config.jwt_secret.clone(), config.token_ttl),
                fanout: Fanout::new(sessions.clone()),
                rooms: RoomDirectory::new(store.clone(), config.message_cache),
                presence: PresenceTracker::new(config.typing_ttl),
                uploads: UploadCoordinator::new(
                    storage,
                    config.max_upload_bytes,
                    config.upload_timeout,
                ),
                scheduler: Scheduler::new(),
                sessions,
                store,
                ai,
                next_message_id: AtomicI64::new(next_id),
                config,
            }),
        })
    }

    /// A fresh, unauthenticated connection and the receiving end of its
    /// outbound queue.
    pub fn open_connection(&self) -> (ClientConn, mpsc::Receiver<Utf8Bytes>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_queue.max(1));
        let cancel = CancellationToken::new();
        let conn = ClientConn {
            conn_id,
            outbound: Outbound::new(conn_id, tx, cancel.clone()),
            cancel,
            session: None,
            malformed: 0,
        };
        (conn, rx)
    }

    /// Handle one inbound text frame to completion.
    pub async fn handle_text(&self, conn: &mut ClientConn, text: &str) -> Flow {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => return self.handle_malformed(conn),
        };
        let frame: ClientFrame = match serde_json::from_value(value) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Connection {} sent an invalid frame: {}", conn.conn_id, e);
                conn.send(&validation(format!("invalid frame: {e}")).to_frame());
                return Flow::Continue;
            }
        };
        self.handle_frame(conn, frame).await;
        Flow::Continue
    }

    /// Anything that is not a JSON text frame.
    pub fn handle_malformed(&self, conn: &mut ClientConn) -> Flow {
        conn.malformed += 1;
        if conn.malformed > self.inner.config.malformed_tolerance {
            warn!(
                "Connection {} sent {} malformed frames, closing",
                conn.conn_id, conn.malformed
            );
            return Flow::Close;
        }
        conn.send(&ServerFrame::error(
            "MALFORMED_FRAME",
            "frame is not valid JSON",
        ));
        Flow::Continue
    }

    async fn handle_frame(&self, conn: &mut ClientConn, frame: ClientFrame) {
        let kind = frame.kind();
        match (&conn.session, frame.is_handshake()) {
            (None, false) if !matches!(frame, ClientFrame::Ping) => {
                conn.send(&GatewayError::NotAuthenticated.to_frame());
                return;
            }
            (Some(_), true) => {
                conn.send(&GatewayError::AlreadyAuthenticated.to_frame());
                return;
            }
            (Some(session), false) => self.inner.sessions.touch(session.conn_id, now_ms()),
            _ => {}
        }

        if let Err(e) = self.dispatch(conn, frame).await {
            self.report(conn, kind, e);
        }
    }

    async fn dispatch(&self, conn: &mut ClientConn, frame: ClientFrame) -> GatewayResult<()> {
        match frame {
            ClientFrame::Login { username, password } => {
                self.login(conn, &username, &password).await
            }
            ClientFrame::Register { username, password } => {
                self.register(conn, &username, &password).await
            }
            ClientFrame::Auth { token } => self.resume(conn, &token).await,
            ClientFrame::Logout => self.logout(conn).await,
            ClientFrame::Ping => {
                conn.send(&ServerFrame::Pong {
                    timestamp: now_ms(),
                });
                Ok(())
            }

            ClientFrame::Chat {
                room_id,
                content,
                reply_to_id,
                metadata,
                timestamp: _,
            } => {
                let session = conn.require_session()?;
                self.chat(conn, &session, &room_id, &content, reply_to_id, metadata)
                    .await
            }
            ClientFrame::EditMessage {
                message_id,
                content,
                base_version,
            } => {
                let session = conn.require_session()?;
                self.edit_message(&session, message_id, &content, base_version)
                    .await
            }
            ClientFrame::DeleteMessage { message_id } => {
                let session = conn.require_session()?;
                self.delete_message(&session, message_id).await
            }
            ClientFrame::Reaction { message_id, emoji } => {
                let session = conn.require_session()?;
                self.add_reaction(&session, message_id, &emoji).await
            }
            ClientFrame::RemoveReaction { message_id, emoji } => {
                let session = conn.require_session()?;
                self.remove_reaction(&session, message_id, &emoji).await
            }
            ClientFrame::GetReactions { message_id } => {
                let session = conn.require_session()?;
                self.get_reactions(conn, &session, message_id).await
            }
            ClientFrame::PinMessage { message_id, pinned } => {
                let session = conn.require_session()?;
                self.pin_message(&session, message_id, pinned).await
            }

            ClientFrame::CreateRoom { name, kind } => {
                let session = conn.require_session()?;
                self.create_room(&session, &name, kind).await
            }
            ClientFrame::JoinRoom { room_id } => {
                let session = conn.require_session()?;
                self.join_room(conn, &session, &room_id).await
            }
            ClientFrame::LeaveRoom { room_id } => {
                let session = conn.require_session()?;
                self.leave_room(&session, &room_id).await
            }
            ClientFrame::GetRooms => {
                let session = conn.require_session()?;
                self.get_rooms(conn, &session).await
            }
            ClientFrame::Invite { room_id, user_id } => {
                let session = conn.require_session()?;
                self.invite(&session, &room_id, user_id).await
            }
            ClientFrame::GetHistory {
                room_id,
                limit,
                before,
            } => {
                let session = conn.require_session()?;
                self.get_history(conn, &session, &room_id, limit, before)
                    .await
            }

            ClientFrame::TypingStart { room_id } => {
                let session = conn.require_session()?;
                self.typing(&session, &room_id, true).await
            }
            ClientFrame::TypingStop { room_id } => {
                let session = conn.require_session()?;
                self.typing(&session, &room_id, false).await
            }
            ClientFrame::Presence { status } => {
                let session = conn.require_session()?;
                self.set_presence(&session, status).await
            }

            ClientFrame::PollCreate {
                room_id,
                question,
                options,
                anonymous,
            } => {
                let session = conn.require_session()?;
                self.create_poll(&session, &room_id, &question, &options, anonymous)
                    .await
            }
            ClientFrame::PollVote { poll_id, option_id } => {
                let session = conn.require_session()?;
                self.vote_poll(conn, &session, poll_id, option_id).await
            }
            ClientFrame::PollClose { poll_id } => {
                let session = conn.require_session()?;
                self.close_poll(&session, poll_id).await
            }
            ClientFrame::GetPollResults { poll_id } => {
                let session = conn.require_session()?;
                self.poll_results(conn, &session, poll_id).await
            }

            ClientFrame::GameStart {
                room_id,
                opponent_id,
            } => {
                let session = conn.require_session()?;
                self.start_game(&session, &room_id, opponent_id).await
            }
            ClientFrame::GameMove { room_id, row, col } => {
                let session = conn.require_session()?;
                self.game_move(&session, &room_id, row, col).await
            }
            ClientFrame::GameResign { room_id } => {
                let session = conn.require_session()?;
                self.game_resign(&session, &room_id).await
            }

            ClientFrame::UploadInit {
                file_name,
                file_size,
                mime_type,
                chunk_size,
                total_chunks,
                room_id,
            } => {
                let session = conn.require_session()?;
                let meta = crate::uploads::UploadMeta {
                    file_name,
                    file_size,
                    mime_type,
                    chunk_size,
                    total_chunks,
                    room_id,
                };
                let result = self.upload_init(conn, &session, meta).await;
                transfers::report_upload(conn, None, result)
            }
            ClientFrame::UploadChunk {
                upload_id,
                chunk_index,
                chunk_data,
                total_chunks,
            } => {
                let session = conn.require_session()?;
                let result = self
                    .upload_chunk(
                        conn,
                        &session,
                        upload_id,
                        chunk_index,
                        &chunk_data,
                        total_chunks,
                    )
                    .await;
                transfers::report_upload(conn, Some(upload_id), result)
            }
            ClientFrame::UploadFinalize { upload_id } => {
                let session = conn.require_session()?;
                let result = self.upload_finalize(conn, &session, upload_id).await;
                transfers::report_upload(conn, Some(upload_id), result)
            }
        }
    }

    fn report(&self, conn: &ClientConn, kind: &str, err: GatewayError) {
        let who = match &conn.session {
            Some(s) => format!("{} ({})", s.username, s.user_id),
            None => format!("connection {}", conn.conn_id),
        };
        match &err {
            GatewayError::Auth(auth) => {
                warn!("{} {} rejected: {}", who, kind, auth);
                conn.send(&ServerFrame::LoginResponse {
                    success: false,
                    token: None,
                    user_id: None,
                    username: None,
                    message: auth.to_string(),
                });
                return;
            }
            GatewayError::Internal(e) => error!("{} {} failed: {:#}", who, kind, e),
            other => debug!("{} {} rejected: {}", who, kind, other),
        }
        conn.send(&err.to_frame());
    }

    async fn login(&self, conn: &mut ClientConn, username: &str, password: &str) -> GatewayResult<()> {
        let name = username.trim().to_string();
        let user = self
            .inner
            .store
            .call(move |db| db.get_user_by_username(&name))
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let password = password.to_string();
        let hash = user.password.clone();
        let verified = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
            .await
            .map_err(anyhow::Error::from)?;
        if !verified {
            return Err(AuthError::InvalidCredentials.into());
        }

        let user_id: Uuid = user
            .id
            .parse()
            .map_err(|_| anyhow::anyhow!("malformed user id {}", user.id))?;
        let token = self.inner.auth.issue_token(user_id, &user.username)?;
        self.establish(conn, user_id, user.username, token).await
    }

    async fn register(&self, conn: &ClientConn, username: &str, password: &str) -> GatewayResult<()> {
        let username = username.trim().to_string();
        if let Err(e) = auth::validate_credentials(&username, password) {
            conn.send(&ServerFrame::RegisterResponse {
                success: false,
                user_id: None,
                message: e.to_string(),
            });
            return Ok(());
        }

        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
            .await
            .map_err(anyhow::Error::from)??;

        let user_id = Uuid::new_v4();
        let (id, name) = (user_id.to_string(), username.clone());
        let created = self
            .inner
            .store
            .call(move |db| db.create_user(&id, &name, &hash, now_ms()))
            .await?;

        if created {
            info!("Registered user {} ({})", username, user_id);
            conn.send(&ServerFrame::RegisterResponse {
                success: true,
                user_id: Some(user_id),
                message: "registration successful".to_string(),
            });
        } else {
            conn.send(&ServerFrame::RegisterResponse {
                success: false,
                user_id: None,
                message: "username already taken".to_string(),
            });
        }
        Ok(())
    }

    /// Resume an identity from a previously issued token.
    pub async fn resume(&self, conn: &mut ClientConn, token: &str) -> GatewayResult<()> {
        let claims = self.inner.auth.validate_token(token)?;
        let id = claims.sub.to_string();
        let user = self
            .inner
            .store
            .call(move |db| db.get_user_by_id(&id))
            .await?
            .ok_or(AuthError::TokenInvalid)?;
        self.establish(conn, claims.sub, user.username, token.to_string())
            .await
    }

    /// Pre-authenticate from an upgrade-time token. Failures are reported to
    /// the client like a failed `auth` frame; the connection stays open.
    pub async fn resume_or_report(&self, conn: &mut ClientConn, token: &str) {
        if let Err(e) = self.resume(conn, token).await {
            self.report(conn, "auth", e);
        }
    }

    async fn establish(
        &self,
        conn: &mut ClientConn,
        user_id: Uuid,
        username: String,
        token: String,
    ) -> GatewayResult<()> {
        let now = now_ms();
        let session = Session {
            conn_id: conn.conn_id,
            user_id,
            username: username.clone(),
            authenticated_at: now,
            last_seen: now,
        };
        let first = self
            .inner
            .sessions
            .register(session.clone(), conn.outbound.clone());
        conn.session = Some(session);

        conn.send(&ServerFrame::LoginResponse {
            success: true,
            token: Some(token),
            user_id: Some(user_id),
            username: Some(username.clone()),
            message: "login successful".to_string(),
        });

        self.materialize_rooms(user_id, &username, now).await?;

        if first {
            self.inner.presence.set_status(user_id, PresenceStatus::Online);
        }
        conn.send(&ServerFrame::OnlineUsers {
            users: self.online_snapshot(),
        });
        if first {
            self.broadcast_presence(user_id, &username, PresenceStatus::Online)
                .await;
        }

        info!("{} ({}) authenticated on {}", username, user_id, conn.conn_id);
        Ok(())
    }

    /// Load every room the user belongs to and make them a member of the
    /// global room.
    async fn materialize_rooms(&self, user_id: Uuid, username: &str, now: i64) -> GatewayResult<()> {
        let global = self
            .inner
            .rooms
            .get(GLOBAL_ROOM_ID)
            .await?
            .ok_or_else(|| anyhow::anyhow!("global room is missing"))?;
        {
            let mut state = global.lock().await;
            if self.inner.rooms.add_member(&global, &mut state, user_id, now) {
                self.inner.fanout.publish_except(
                    &ServerFrame::UserJoinedRoom {
                        room_id: global.id.clone(),
                        user_id,
                        username: username.to_string(),
                    },
                    &state.members,
                    user_id,
                );
            }
        }

        let id = user_id.to_string();
        let rows = self
            .inner
            .store
            .call(move |db| db.rooms_for_user(&id))
            .await?;
        for row in rows {
            if self.inner.rooms.get(&row.id).await?.is_none() {
                warn!("Room {} vanished while loading {}", row.id, username);
            }
        }
        Ok(())
    }

    fn online_snapshot(&self) -> Vec<OnlineUser> {
        self.inner
            .sessions
            .online_users()
            .into_iter()
            .filter_map(|(user_id, username)| {
                let status = self.inner.presence.status(user_id).visible();
                (status != PresenceStatus::Offline).then_some(OnlineUser {
                    user_id,
                    username,
                    status,
                })
            })
            .collect()
    }

    /// Everyone sharing at least one loaded room with the user.
    async fn co_members(&self, user_id: Uuid) -> HashSet<Uuid> {
        let mut audience = HashSet::new();
        for room in self.inner.rooms.rooms_of(user_id).await {
            let state = room.lock().await;
            audience.extend(state.members.iter().copied());
        }
        audience
    }

    async fn broadcast_presence(&self, user_id: Uuid, username: &str, status: PresenceStatus) {
        let audience = self.co_members(user_id).await;
        self.inner.fanout.publish_except(
            &ServerFrame::PresenceUpdate {
                user_id,
                username: username.to_string(),
                status: status.visible(),
            },
            &audience,
            user_id,
        );
    }

    async fn set_presence(&self, session: &Session, status: PresenceStatus) -> GatewayResult<()> {
        if status == PresenceStatus::Offline {
            return Err(validation("offline is set by disconnecting"));
        }
        let previous = self.inner.presence.set_status(session.user_id, status);
        if previous.map(PresenceStatus::visible) != Some(status.visible()) {
            self.broadcast_presence(session.user_id, &session.username, status)
                .await;
        }
        // the user's own connections see the real status, invisible included
        self.inner.fanout.to_user(
            session.user_id,
            &ServerFrame::PresenceUpdate {
                user_id: session.user_id,
                username: session.username.clone(),
                status,
            },
        );
        Ok(())
    }

    async fn logout(&self, conn: &mut ClientConn) -> GatewayResult<()> {
        let session = conn.session.take().ok_or(GatewayError::NotAuthenticated)?;
        self.end_session(&session).await;
        conn.send(&ServerFrame::LoggedOut);
        Ok(())
    }

    /// Tear down whatever the connection still holds. Called once by the
    /// socket loop after the last frame was handled.
    pub async fn close_connection(&self, conn: &mut ClientConn) {
        conn.cancel.cancel();
        if let Some(session) = conn.session.take() {
            self.end_session(&session).await;
        }
    }

    async fn end_session(&self, session: &Session) {
        let Some((_, last)) = self.inner.sessions.terminate(session.conn_id) else {
            return;
        };
        info!(
            "{} ({}) session {} ended",
            session.username, session.user_id, session.conn_id
        );
        if !last {
            return;
        }

        let was_visible =
            self.inner.presence.status(session.user_id).visible() != PresenceStatus::Offline;
        self.inner.presence.remove(session.user_id);
        let stopped = self.inner.presence.clear_user(session.user_id);
        self.publish_typing_stopped(stopped).await;
        if was_visible {
            self.broadcast_presence(session.user_id, &session.username, PresenceStatus::Offline)
                .await;
        }
    }

    async fn typing(&self, session: &Session, raw_room_id: &str, started: bool) -> GatewayResult<()> {
        let room = self.inner.rooms.open(raw_room_id, session.user_id).await?;
        let state = room.lock().await;
        if !state.members.contains(&session.user_id) {
            return Err(denied(format!("not a member of room {}", room.id)));
        }

        let changed = if started {
            self.inner
                .presence
                .start_typing(&room.id, session.user_id, &session.username, Instant::now())
        } else {
            self.inner.presence.stop_typing(&room.id, session.user_id)
        };
        if changed {
            self.inner.fanout.publish_except(
                &ServerFrame::Typing {
                    room_id: room.id.clone(),
                    user_id: session.user_id,
                    username: session.username.clone(),
                    is_typing: started,
                },
                &state.members,
                session.user_id,
            );
        }
        Ok(())
    }

    async fn publish_typing_stopped(&self, entries: Vec<ExpiredTyping>) {
        for entry in entries {
            let room = match self.inner.rooms.get(&entry.room_id).await {
                Ok(Some(room)) => room,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Typing cleanup for room {} failed: {}", entry.room_id, e);
                    continue;
                }
            };
            let state = room.lock().await;
            self.inner.fanout.publish_except(
                &ServerFrame::Typing {
                    room_id: entry.room_id,
                    user_id: entry.user_id,
                    username: entry.username,
                    is_typing: false,
                },
                &state.members,
                entry.user_id,
            );
        }
    }

    /// Expire stale typing indicators. Returns how many were cleared.
    pub async fn sweep_typing(&self) -> usize {
        let expired = self.inner.presence.sweep(Instant::now());
        let n = expired.len();
        if n > 0 {
            debug!("Typing sweep cleared {} indicator(s)", n);
            self.publish_typing_stopped(expired).await;
        }
        n
    }

    pub async fn collect_abandoned_uploads(&self) -> usize {
        let n = self.inner.uploads.collect_abandoned(Instant::now()).await;
        if n > 0 {
            info!("Collected {} abandoned upload(s)", n);
        }
        n
    }

    /// Post every scheduled message that has come due. A message whose
    /// author has since left the room is dropped.
    pub async fn deliver_scheduled(&self) -> usize {
        let due = self.inner.scheduler.take_due(Instant::now());
        let mut delivered = 0;
        for scheduled in due {
            let room = match self.inner.rooms.get(&scheduled.room_id).await {
                Ok(Some(room)) => room,
                Ok(None) => {
                    warn!("Scheduled message {} targets a missing room", scheduled.id);
                    continue;
                }
                Err(e) => {
                    error!("Scheduled message {} not delivered: {}", scheduled.id, e);
                    continue;
                }
            };
            let mut state = room.lock().await;
            if !state.members.contains(&scheduled.user_id) {
                info!(
                    "Dropping scheduled message {}: {} left {}",
                    scheduled.id, scheduled.username, room.id
                );
                continue;
            }
            self.append_message(
                &room,
                &mut state,
                messaging::Draft {
                    sender_id: scheduled.user_id,
                    sender_name: scheduled.username,
                    content: scheduled.content,
                    reply_to_id: None,
                    metadata: Some(serde_json::json!({
                        "messageType": "scheduled",
                        "scheduleId": scheduled.id,
                    })),
                },
                None,
            );
            delivered += 1;
        }
        if delivered > 0 {
            debug!("Delivered {} scheduled message(s)", delivered);
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Disconnect everyone and wait for queued writes to land.
    pub async fn shutdown(&self) {
        self.inner.sessions.close_all();
        if let Err(e) = self.inner.store.flush().await {
            error!("Store flush on shutdown failed: {:#}", e);
        }
        info!("Gateway stopped");
    }

    fn next_message_id(&self) -> i64 {
        self.inner.next_message_id.fetch_add(1, Ordering::Relaxed)
    }
}
