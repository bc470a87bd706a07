use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE rooms (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                kind        TEXT NOT NULL CHECK (kind IN ('public', 'private', 'dm')),
                created_by  TEXT,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE room_members (
                room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL,
                joined_at   INTEGER NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE INDEX idx_room_members_user ON room_members(user_id);

            -- Ids are assigned by the gateway, never by SQLite, so that the
            -- id is known before the row is written.
            CREATE TABLE messages (
                id              INTEGER PRIMARY KEY,
                room_id         TEXT NOT NULL REFERENCES rooms(id),
                sender_id       TEXT NOT NULL,
                sender_name     TEXT NOT NULL,
                content         TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                edited_at       INTEGER,
                version         INTEGER NOT NULL DEFAULT 0,
                is_deleted      INTEGER NOT NULL DEFAULT 0,
                is_pinned       INTEGER NOT NULL DEFAULT 0,
                reply_to_id     INTEGER,
                metadata        TEXT
            );

            CREATE INDEX idx_messages_room ON messages(room_id, id);

            CREATE TABLE reactions (
                message_id  INTEGER NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL,
                username    TEXT NOT NULL,
                emoji       TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id, emoji)
            );

            CREATE TABLE polls (
                id          TEXT PRIMARY KEY,
                room_id     TEXT NOT NULL REFERENCES rooms(id),
                question    TEXT NOT NULL,
                created_by  TEXT NOT NULL,
                anonymous   INTEGER NOT NULL DEFAULT 0,
                is_closed   INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL
            );

            CREATE INDEX idx_polls_room ON polls(room_id);

            CREATE TABLE poll_options (
                poll_id         TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
                option_index    INTEGER NOT NULL,
                text            TEXT NOT NULL,
                PRIMARY KEY (poll_id, option_index)
            );

            -- One row per voter: the primary key is the single-vote rule.
            CREATE TABLE poll_votes (
                poll_id         TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL,
                option_index    INTEGER NOT NULL,
                voted_at        INTEGER NOT NULL,
                PRIMARY KEY (poll_id, user_id)
            );

            CREATE TABLE files (
                id          TEXT PRIMARY KEY,
                uploader_id TEXT NOT NULL,
                room_id     TEXT NOT NULL,
                file_name   TEXT NOT NULL,
                file_size   INTEGER NOT NULL,
                mime_type   TEXT NOT NULL,
                url         TEXT NOT NULL,
                sha256      TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO rooms (id, name, kind, created_by, created_at)
                VALUES ('global', 'Global Chat', 'public', NULL, 0);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
