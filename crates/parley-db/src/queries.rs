use crate::Database;
use crate::models::{
    FileRow, MessageRow, PollRecord, PollRow, PollVoteRow, ReactionRow, RoomRow, UserRow,
};
use anyhow::Result;
use rusqlite::{Connection, Row};

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, sender_name, content, created_at, \
     edited_at, version, is_deleted, is_pinned, reply_to_id, metadata";

impl Database {
    // -- Users --

    /// Inserts a user unless the username is taken. Returns whether a row was written.
    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        password_hash: &str,
        created_at: i64,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, username, password_hash, created_at],
            )?;
            Ok(n == 1)
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Rooms --

    /// Create-if-absent. Returns true only for the call that created the row.
    pub fn ensure_room(&self, room: &RoomRow) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO rooms (id, name, kind, created_by, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![room.id, room.name, room.kind, room.created_by, room.created_at],
            )?;
            Ok(n == 1)
        })
    }

    pub fn get_room(&self, id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, kind, created_by, created_at FROM rooms WHERE id = ?1",
                [id],
                room_from_row,
            )
            .optional()
        })
    }

    pub fn add_member(&self, room_id: &str, user_id: &str, joined_at: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO room_members (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![room_id, user_id, joined_at],
            )?;
            Ok(n == 1)
        })
    }

    pub fn remove_member(&self, room_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                (room_id, user_id),
            )?;
            Ok(n == 1)
        })
    }

    pub fn room_members(&self, room_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM room_members WHERE room_id = ?1 ORDER BY joined_at")?;
            let rows = stmt
                .query_map([room_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(rows)
        })
    }

    /// Every room the user is a member of, oldest membership first.
    pub fn rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.name, r.kind, r.created_by, r.created_at
                 FROM rooms r
                 JOIN room_members m ON m.room_id = r.id
                 WHERE m.user_id = ?1
                 ORDER BY m.joined_at, r.id",
            )?;
            let rows = stmt
                .query_map([user_id], room_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Highest message id ever written, or 0 for an empty database.
    pub fn max_message_id(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let id = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM messages", [], |row| {
                row.get(0)
            })?;
            Ok(id)
        })
    }

    pub fn insert_message(&self, msg: &MessageRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                rusqlite::params![
                    msg.id,
                    msg.room_id,
                    msg.sender_id,
                    msg.sender_name,
                    msg.content,
                    msg.created_at,
                    msg.edited_at,
                    msg.version,
                    msg.is_deleted,
                    msg.is_pinned,
                    msg.reply_to_id,
                    msg.metadata,
                ],
            )?;
            Ok(())
        })
    }

    /// Applies an edit only if it is newer than what is stored, so a late
    /// write can never roll content back. Returns whether the row changed.
    pub fn update_message_content(
        &self,
        id: i64,
        content: &str,
        edited_at: i64,
        version: i64,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = ?2, edited_at = ?3, version = ?4
                 WHERE id = ?1 AND version < ?4 AND is_deleted = 0",
                rusqlite::params![id, content, edited_at, version],
            )?;
            Ok(n == 1)
        })
    }

    pub fn soft_delete_message(&self, id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE messages SET is_deleted = 1, content = '' WHERE id = ?1",
                [id],
            )?;
            Ok(n == 1)
        })
    }

    pub fn set_pinned(&self, id: i64, pinned: bool) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE messages SET is_pinned = ?2 WHERE id = ?1",
                rusqlite::params![id, pinned],
            )?;
            Ok(n == 1)
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id],
                message_from_row,
            )
            .optional()
        })
    }

    /// Newest-first page of a room's messages, strictly older than `before`.
    pub fn get_messages(
        &self,
        room_id: &str,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, room_id, before, limit))
    }

    // -- Reactions --

    /// Returns false when the same user already reacted with the same emoji.
    pub fn add_reaction(&self, reaction: &ReactionRow) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO reactions (message_id, user_id, username, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    reaction.message_id,
                    reaction.user_id,
                    reaction.username,
                    reaction.emoji,
                    reaction.created_at,
                ],
            )?;
            Ok(n == 1)
        })
    }

    pub fn remove_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                rusqlite::params![message_id, user_id, emoji],
            )?;
            Ok(n == 1)
        })
    }

    /// Batch-fetch reactions for a set of message IDs, in insertion order.
    pub fn get_reactions_for_messages(&self, message_ids: &[i64]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, username, emoji, created_at FROM reactions
                 WHERE message_id IN ({})
                 ORDER BY created_at, rowid",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids.iter()), |row| {
                    Ok(ReactionRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Polls --

    pub fn insert_poll(&self, poll: &PollRow, options: &[String]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO polls (id, room_id, question, created_by, anonymous, is_closed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    poll.id,
                    poll.room_id,
                    poll.question,
                    poll.created_by,
                    poll.anonymous,
                    poll.is_closed,
                    poll.created_at,
                ],
            )?;
            for (index, text) in options.iter().enumerate() {
                tx.execute(
                    "INSERT INTO poll_options (poll_id, option_index, text) VALUES (?1, ?2, ?3)",
                    rusqlite::params![poll.id, index as i64, text],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Records or replaces the user's single vote on a poll.
    pub fn set_poll_vote(
        &self,
        poll_id: &str,
        user_id: &str,
        option_index: i64,
        voted_at: i64,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO poll_votes (poll_id, user_id, option_index, voted_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (poll_id, user_id)
                 DO UPDATE SET option_index = excluded.option_index, voted_at = excluded.voted_at",
                rusqlite::params![poll_id, user_id, option_index, voted_at],
            )?;
            Ok(())
        })
    }

    pub fn close_poll(&self, poll_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE polls SET is_closed = 1 WHERE id = ?1 AND is_closed = 0",
                [poll_id],
            )?;
            Ok(n == 1)
        })
    }

    pub fn get_poll_room(&self, poll_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT room_id FROM polls WHERE id = ?1", [poll_id], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    /// All polls of a room with their options and votes, oldest first.
    pub fn get_polls_for_room(&self, room_id: &str) -> Result<Vec<PollRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, question, created_by, anonymous, is_closed, created_at
                 FROM polls WHERE room_id = ?1 ORDER BY created_at, id",
            )?;
            let polls = stmt
                .query_map([room_id], |row| {
                    Ok(PollRow {
                        id: row.get(0)?,
                        room_id: row.get(1)?,
                        question: row.get(2)?,
                        created_by: row.get(3)?,
                        anonymous: row.get(4)?,
                        is_closed: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut records = Vec::with_capacity(polls.len());
            for poll in polls {
                let options = conn
                    .prepare("SELECT text FROM poll_options WHERE poll_id = ?1 ORDER BY option_index")?
                    .query_map([&poll.id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                let votes = conn
                    .prepare(
                        "SELECT user_id, option_index FROM poll_votes WHERE poll_id = ?1 ORDER BY voted_at, rowid",
                    )?
                    .query_map([&poll.id], |row| {
                        Ok(PollVoteRow {
                            user_id: row.get(0)?,
                            option_index: row.get(1)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                records.push(PollRecord {
                    poll,
                    options,
                    votes,
                });
            }
            Ok(records)
        })
    }

    // -- Files --

    pub fn insert_file(&self, file: &FileRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO files (id, uploader_id, room_id, file_name, file_size, mime_type, url, sha256, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    file.id,
                    file.uploader_id,
                    file.room_id,
                    file.file_name,
                    file.file_size,
                    file.mime_type,
                    file.url,
                    file.sha256,
                    file.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_file(&self, id: &str) -> Result<Option<FileRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, uploader_id, room_id, file_name, file_size, mime_type, url, sha256, created_at
                 FROM files WHERE id = ?1",
                [id],
                |row| {
                    Ok(FileRow {
                        id: row.get(0)?,
                        uploader_id: row.get(1)?,
                        room_id: row.get(2)?,
                        file_name: row.get(3)?,
                        file_size: row.get(4)?,
                        mime_type: row.get(5)?,
                        url: row.get(6)?,
                        sha256: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                },
            )
            .optional()
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, password, created_at FROM users WHERE {column} = ?1"
    ))?;

    stmt.query_row([value], |row| {
        Ok(UserRow {
            id: row.get(0)?,
            username: row.get(1)?,
            password: row.get(2)?,
            created_at: row.get(3)?,
        })
    })
    .optional()
}

fn query_messages(
    conn: &Connection,
    room_id: &str,
    before: Option<i64>,
    limit: u32,
) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE room_id = ?1 AND id < ?2
         ORDER BY id DESC
         LIMIT ?3"
    ))?;

    let rows = stmt
        .query_map(
            rusqlite::params![room_id, before.unwrap_or(i64::MAX), limit],
            message_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn room_from_row(row: &Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        created_by: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        edited_at: row.get(6)?,
        version: row.get(7)?,
        is_deleted: row.get(8)?,
        is_pinned: row.get(9)?,
        reply_to_id: row.get(10)?,
        metadata: row.get(11)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
