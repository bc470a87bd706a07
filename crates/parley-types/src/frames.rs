use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::GLOBAL_ROOM_ID;
use crate::models::{
    FileDescriptor, GameView, MessageView, OnlineUser, PollOptionView, PollView, PresenceStatus,
    ReactionView, RoomKind, RoomSummary,
};

fn default_room() -> String {
    GLOBAL_ROOM_ID.to_string()
}

fn default_true() -> bool {
    true
}

/// Frames sent FROM client TO server.
///
/// Unknown `type` values and unknown fields are rejected during parsing, so
/// handlers only ever see well-formed commands.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum ClientFrame {
    Login {
        username: String,
        password: String,
    },
    Register {
        username: String,
        password: String,
    },
    /// Resume an identity with a previously issued token
    Auth {
        token: String,
    },
    Logout,
    Ping,

    Chat {
        #[serde(default = "default_room")]
        room_id: String,
        content: String,
        #[serde(default)]
        reply_to_id: Option<i64>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
        /// Client clock, display hint only
        #[serde(default)]
        timestamp: Option<i64>,
    },
    EditMessage {
        message_id: i64,
        #[serde(alias = "newContent")]
        content: String,
        #[serde(default)]
        base_version: Option<u32>,
    },
    DeleteMessage {
        message_id: i64,
    },
    #[serde(alias = "add_reaction")]
    Reaction {
        message_id: i64,
        emoji: String,
    },
    RemoveReaction {
        message_id: i64,
        emoji: String,
    },
    GetReactions {
        message_id: i64,
    },
    PinMessage {
        message_id: i64,
        #[serde(default = "default_true")]
        pinned: bool,
    },

    CreateRoom {
        #[serde(alias = "roomName")]
        name: String,
        #[serde(default, alias = "roomType")]
        kind: Option<RoomKind>,
    },
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    GetRooms,
    Invite {
        room_id: String,
        user_id: Uuid,
    },
    GetHistory {
        room_id: String,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        before: Option<i64>,
    },

    TypingStart {
        room_id: String,
    },
    TypingStop {
        room_id: String,
    },
    Presence {
        status: PresenceStatus,
    },

    #[serde(alias = "create_poll")]
    PollCreate {
        #[serde(default = "default_room")]
        room_id: String,
        question: String,
        options: Vec<String>,
        #[serde(default)]
        anonymous: bool,
    },
    #[serde(alias = "vote_poll")]
    PollVote {
        poll_id: Uuid,
        #[serde(alias = "optionIndex")]
        option_id: usize,
    },
    #[serde(alias = "close_poll")]
    PollClose {
        poll_id: Uuid,
    },
    GetPollResults {
        poll_id: Uuid,
    },

    GameStart {
        room_id: String,
        opponent_id: Uuid,
    },
    GameMove {
        room_id: String,
        row: u8,
        col: u8,
    },
    GameResign {
        room_id: String,
    },

    UploadInit {
        file_name: String,
        file_size: u64,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        chunk_size: Option<u32>,
        total_chunks: u32,
        #[serde(default = "default_room")]
        room_id: String,
    },
    UploadChunk {
        upload_id: Uuid,
        chunk_index: u32,
        /// Base64 (standard alphabet)
        chunk_data: String,
        #[serde(default)]
        total_chunks: Option<u32>,
    },
    UploadFinalize {
        upload_id: Uuid,
    },
}

impl ClientFrame {
    /// Frame type name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Register { .. } => "register",
            Self::Auth { .. } => "auth",
            Self::Logout => "logout",
            Self::Ping => "ping",
            Self::Chat { .. } => "chat",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::Reaction { .. } => "reaction",
            Self::RemoveReaction { .. } => "remove_reaction",
            Self::GetReactions { .. } => "get_reactions",
            Self::PinMessage { .. } => "pin_message",
            Self::CreateRoom { .. } => "create_room",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::GetRooms => "get_rooms",
            Self::Invite { .. } => "invite",
            Self::GetHistory { .. } => "get_history",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::Presence { .. } => "presence",
            Self::PollCreate { .. } => "poll_create",
            Self::PollVote { .. } => "poll_vote",
            Self::PollClose { .. } => "poll_close",
            Self::GetPollResults { .. } => "get_poll_results",
            Self::GameStart { .. } => "game_start",
            Self::GameMove { .. } => "game_move",
            Self::GameResign { .. } => "game_resign",
            Self::UploadInit { .. } => "upload_init",
            Self::UploadChunk { .. } => "upload_chunk",
            Self::UploadFinalize { .. } => "upload_finalize",
        }
    }

    /// Whether the frame is only valid before authentication.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::Login { .. } | Self::Register { .. } | Self::Auth { .. }
        )
    }
}

/// Frames sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    LoginResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        message: String,
    },
    RegisterResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<Uuid>,
        message: String,
    },
    LoggedOut,
    Pong {
        timestamp: i64,
    },
    OnlineUsers {
        users: Vec<OnlineUser>,
    },

    Chat {
        #[serde(flatten)]
        message: MessageView,
    },
    /// The message is durable
    MessageSaved {
        message_id: i64,
        room_id: String,
    },
    MessageEdited {
        message_id: i64,
        room_id: String,
        new_content: String,
        edited_at: i64,
        version: u32,
        user_id: Uuid,
    },
    MessageDeleted {
        message_id: i64,
        room_id: String,
        user_id: Uuid,
    },
    MessagePinned {
        message_id: i64,
        room_id: String,
        pinned: bool,
        user_id: Uuid,
    },
    ReactionAdded {
        message_id: i64,
        room_id: String,
        emoji: String,
        user_id: Uuid,
        username: String,
    },
    ReactionRemoved {
        message_id: i64,
        room_id: String,
        emoji: String,
        user_id: Uuid,
    },
    ReactionsList {
        message_id: i64,
        reactions: Vec<ReactionView>,
    },
    Mention {
        room_id: String,
        message_id: i64,
        from: String,
        from_user_id: Uuid,
    },

    RoomCreated {
        room_id: String,
        room_name: String,
        room_type: RoomKind,
    },
    RoomJoined {
        room_id: String,
        room_name: String,
        room_type: RoomKind,
        user_id: Uuid,
        username: String,
        history: Vec<MessageView>,
        next_cursor: Option<i64>,
        polls: Vec<PollView>,
    },
    UserJoinedRoom {
        room_id: String,
        user_id: Uuid,
        username: String,
    },
    RoomLeft {
        room_id: String,
    },
    UserLeftRoom {
        room_id: String,
        user_id: Uuid,
        username: String,
    },
    RoomList {
        rooms: Vec<RoomSummary>,
    },
    RoomInvited {
        room_id: String,
        room_name: String,
        room_type: RoomKind,
        invited_by: Uuid,
    },
    History {
        room_id: String,
        messages: Vec<MessageView>,
        next_cursor: Option<i64>,
    },

    Typing {
        room_id: String,
        user_id: Uuid,
        username: String,
        is_typing: bool,
    },
    PresenceUpdate {
        user_id: Uuid,
        username: String,
        status: PresenceStatus,
    },

    PollCreated {
        poll: PollView,
    },
    PollVoted {
        poll_id: Uuid,
        room_id: String,
        option_id: usize,
        /// Omitted for anonymous polls
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<Uuid>,
        poll: PollView,
    },
    PollClosed {
        poll: PollView,
    },
    PollResults {
        poll_id: Uuid,
        question: String,
        is_closed: bool,
        results: Vec<PollOptionView>,
    },

    GameState {
        #[serde(flatten)]
        game: GameView,
    },

    UploadReady {
        upload_id: Uuid,
        chunk_size: u32,
        total_chunks: u32,
    },
    UploadProgress {
        upload_id: Uuid,
        chunks_received: u32,
        total_chunks: u32,
        progress: u8,
    },
    UploadComplete {
        upload_id: Uuid,
        #[serde(flatten)]
        file: FileDescriptor,
    },
    UploadError {
        #[serde(skip_serializing_if = "Option::is_none")]
        upload_id: Option<Uuid>,
        message: String,
        code: String,
    },

    Error {
        message: String,
        code: String,
    },
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: code.to_string(),
        }
    }
}
