/// Database row types. These map directly to SQLite rows.
/// Distinct from parley-types view models to keep the DB layer independent.
/// Timestamps are milliseconds since the Unix epoch.

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub created_by: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    pub version: i64,
    pub is_deleted: bool,
    pub is_pinned: bool,
    pub reply_to_id: Option<i64>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReactionRow {
    pub message_id: i64,
    pub user_id: String,
    pub username: String,
    pub emoji: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct PollRow {
    pub id: String,
    pub room_id: String,
    pub question: String,
    pub created_by: String,
    pub anonymous: bool,
    pub is_closed: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct PollVoteRow {
    pub user_id: String,
    pub option_index: i64,
}

/// A poll with its options (in index order) and current votes.
#[derive(Debug, Clone)]
pub struct PollRecord {
    pub poll: PollRow,
    pub options: Vec<String>,
    pub votes: Vec<PollVoteRow>,
}

#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: String,
    pub uploader_id: String,
    pub room_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub url: String,
    pub sha256: String,
    pub created_at: i64,
}
