use anyhow::Context;
use uuid::Uuid;

use parley_db::models::{MessageRow, ReactionRow};
use parley_types::models::{MessageView, ReactionView};

use crate::error::{GatewayError, GatewayResult, conflict, denied, validation};

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_EMOJI_CHARS: usize = 32;
pub const DEFAULT_HISTORY: u32 = 50;
pub const MAX_HISTORY: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: Uuid,
    pub username: String,
}

/// Authoritative in-memory copy of a stored message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub room_id: String,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    pub version: u32,
    pub is_deleted: bool,
    pub is_pinned: bool,
    pub reply_to_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditOutcome {
    pub version: u32,
    pub edited_at: i64,
}

impl Message {
    /// Only the sender may edit. Each edit bumps the version; a caller that
    /// names the version it edited from gets a conflict if it is stale.
    pub fn edit(
        &mut self,
        editor: Uuid,
        content: &str,
        base_version: Option<u32>,
        now: i64,
    ) -> GatewayResult<EditOutcome> {
        if editor != self.sender_id {
            return Err(denied("only the sender can edit this message"));
        }
        if self.is_deleted {
            return Err(GatewayError::AlreadyDeleted);
        }
        if let Some(base) = base_version {
            if base != self.version {
                return Err(conflict(format!(
                    "message is at version {}, edit was based on {}",
                    self.version, base
                )));
            }
        }
        let content = normalize_content(content)?;

        self.content = content;
        self.version += 1;
        self.edited_at = Some(now);
        Ok(EditOutcome {
            version: self.version,
            edited_at: now,
        })
    }

    /// Keeps the message and its id, clears the content.
    pub fn soft_delete(&mut self, requester: Uuid) -> GatewayResult<()> {
        if requester != self.sender_id {
            return Err(denied("only the sender can delete this message"));
        }
        if self.is_deleted {
            return Err(GatewayError::AlreadyDeleted);
        }
        self.is_deleted = true;
        self.content.clear();
        self.metadata = None;
        Ok(())
    }

    /// Returns false if the user already reacted with this emoji.
    pub fn add_reaction(
        &mut self,
        user_id: Uuid,
        username: &str,
        emoji: &str,
    ) -> GatewayResult<bool> {
        if self.is_deleted {
            return Err(GatewayError::AlreadyDeleted);
        }
        validate_emoji(emoji)?;
        if self
            .reactions
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
        {
            return Ok(false);
        }
        self.reactions.push(Reaction {
            emoji: emoji.to_string(),
            user_id,
            username: username.to_string(),
        });
        Ok(true)
    }

    pub fn remove_reaction(&mut self, user_id: Uuid, emoji: &str) -> bool {
        let before = self.reactions.len();
        self.reactions
            .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        self.reactions.len() != before
    }

    pub fn view(&self) -> MessageView {
        MessageView {
            message_id: self.id,
            room_id: self.room_id.clone(),
            user_id: self.sender_id,
            username: self.sender_name.clone(),
            content: self.content.clone(),
            timestamp: self.created_at,
            edited_at: self.edited_at,
            version: self.version,
            is_deleted: self.is_deleted,
            is_pinned: self.is_pinned,
            reply_to_id: self.reply_to_id,
            reactions: self.reaction_views(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn reaction_views(&self) -> Vec<ReactionView> {
        self.reactions
            .iter()
            .map(|r| ReactionView {
                emoji: r.emoji.clone(),
                user_id: r.user_id,
                username: r.username.clone(),
            })
            .collect()
    }

    pub fn to_row(&self) -> MessageRow {
        MessageRow {
            id: self.id,
            room_id: self.room_id.clone(),
            sender_id: self.sender_id.to_string(),
            sender_name: self.sender_name.clone(),
            content: self.content.clone(),
            created_at: self.created_at,
            edited_at: self.edited_at,
            version: i64::from(self.version),
            is_deleted: self.is_deleted,
            is_pinned: self.is_pinned,
            reply_to_id: self.reply_to_id,
            metadata: self.metadata.as_ref().map(|m| m.to_string()),
        }
    }

    /// Rebuild from a row plus the reactions that belong to it.
    pub fn from_row(row: MessageRow, reactions: &[ReactionRow]) -> anyhow::Result<Self> {
        let sender_id: Uuid = row
            .sender_id
            .parse()
            .with_context(|| format!("message {} has a malformed sender id", row.id))?;
        let metadata = match row.metadata.as_deref() {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        let reactions = reactions
            .iter()
            .filter(|r| r.message_id == row.id)
            .filter_map(|r| {
                Some(Reaction {
                    emoji: r.emoji.clone(),
                    user_id: r.user_id.parse().ok()?,
                    username: r.username.clone(),
                })
            })
            .collect();

        Ok(Self {
            id: row.id,
            room_id: row.room_id,
            sender_id,
            sender_name: row.sender_name,
            content: row.content,
            created_at: row.created_at,
            edited_at: row.edited_at,
            version: u32::try_from(row.version).unwrap_or(u32::MAX),
            is_deleted: row.is_deleted,
            is_pinned: row.is_pinned,
            reply_to_id: row.reply_to_id,
            metadata,
            reactions,
        })
    }
}

pub fn normalize_content(content: &str) -> GatewayResult<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(validation("message content is empty"));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(validation(format!(
            "message content exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

fn validate_emoji(emoji: &str) -> GatewayResult<()> {
    let len = emoji.chars().count();
    if len == 0 || len > MAX_EMOJI_CHARS || emoji.chars().any(char::is_whitespace) {
        return Err(validation("invalid emoji"));
    }
    Ok(())
}

/// Clamp a requested history page size.
pub fn history_limit(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_HISTORY).clamp(1, MAX_HISTORY)
}

/// A newest-first page from the database, turned into an ascending page and
/// the cursor for the next older page.
pub fn history_page(
    rows: Vec<MessageRow>,
    reactions: &[ReactionRow],
    limit: u32,
) -> anyhow::Result<(Vec<MessageView>, Option<i64>)> {
    let full = rows.len() as u32 >= limit;
    let mut views = rows
        .into_iter()
        .map(|row| Message::from_row(row, reactions).map(|m| m.view()))
        .collect::<anyhow::Result<Vec<_>>>()?;
    views.reverse();
    let cursor = if full {
        views.first().map(|m| m.message_id)
    } else {
        None
    };
    Ok((views, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: Uuid) -> Message {
        Message {
            id: 1,
            room_id: "global".into(),
            sender_id: sender,
            sender_name: "alice".into(),
            content: "hello".into(),
            created_at: 10,
            edited_at: None,
            version: 0,
            is_deleted: false,
            is_pinned: false,
            reply_to_id: None,
            metadata: None,
            reactions: vec![],
        }
    }

    #[test]
    fn edit_requires_ownership_and_bumps_version() {
        let alice = Uuid::new_v4();
        let mut msg = message(alice);

        let err = msg.edit(Uuid::new_v4(), "hijack", None, 20).unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let outcome = msg.edit(alice, "  hello again ", None, 20).unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(msg.content, "hello again");
        assert_eq!(msg.edited_at, Some(20));

        let err = msg.edit(alice, "stale", Some(0), 30).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert_eq!(msg.edit(alice, "fresh", Some(1), 30).unwrap().version, 2);
    }

    #[test]
    fn deleted_message_is_frozen() {
        let alice = Uuid::new_v4();
        let mut msg = message(alice);
        msg.soft_delete(alice).unwrap();
        assert!(msg.content.is_empty());

        assert_eq!(
            msg.edit(alice, "x", None, 1).unwrap_err().code(),
            "ALREADY_DELETED"
        );
        assert_eq!(
            msg.add_reaction(alice, "alice", "👍").unwrap_err().code(),
            "ALREADY_DELETED"
        );
        assert_eq!(msg.soft_delete(alice).unwrap_err().code(), "ALREADY_DELETED");
    }

    #[test]
    fn reactions_are_unique_per_user_and_emoji() {
        let mut msg = message(Uuid::new_v4());
        let bob = Uuid::new_v4();
        assert!(msg.add_reaction(bob, "bob", "👍").unwrap());
        assert!(!msg.add_reaction(bob, "bob", "👍").unwrap());
        assert!(msg.add_reaction(bob, "bob", "🎉").unwrap());
        assert_eq!(msg.reactions.len(), 2);

        assert!(msg.remove_reaction(bob, "👍"));
        assert!(!msg.remove_reaction(bob, "👍"));
        assert_eq!(msg.reactions.len(), 1);
    }

    #[test]
    fn row_conversion_keeps_metadata_and_reactions() {
        let mut msg = message(Uuid::new_v4());
        msg.metadata = Some(serde_json::json!({"messageType": "file"}));
        let row = msg.to_row();
        let reactions = vec![ReactionRow {
            message_id: 1,
            user_id: msg.sender_id.to_string(),
            username: "alice".into(),
            emoji: "👍".into(),
            created_at: 0,
        }];
        let back = Message::from_row(row, &reactions).unwrap();
        assert_eq!(back.metadata, msg.metadata);
        assert_eq!(back.reactions.len(), 1);
    }

    #[test]
    fn history_page_is_ascending_with_cursor() {
        let sender = Uuid::new_v4();
        let rows: Vec<MessageRow> = (3..=5)
            .rev()
            .map(|id| {
                let mut m = message(sender);
                m.id = id;
                m.to_row()
            })
            .collect();
        let (page, cursor) = history_page(rows.clone(), &[], 3).unwrap();
        assert_eq!(
            page.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(cursor, Some(3));

        let (_, cursor) = history_page(rows, &[], 10).unwrap();
        assert_eq!(cursor, None);
    }

    #[test]
    fn history_limit_is_clamped() {
        assert_eq!(history_limit(None), DEFAULT_HISTORY);
        assert_eq!(history_limit(Some(0)), 1);
        assert_eq!(history_limit(Some(10_000)), MAX_HISTORY);
    }
}
