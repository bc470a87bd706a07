use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use parley_db::Database;
use parley_db::models::{FileRow, MessageRow, PollRow, ReactionRow, RoomRow};

/// A durable mutation. Writes are applied strictly in submission order.
#[derive(Debug, Clone)]
pub enum WriteOp {
    EnsureRoom(RoomRow),
    AddMember {
        room_id: String,
        user_id: String,
        joined_at: i64,
    },
    RemoveMember {
        room_id: String,
        user_id: String,
    },
    InsertMessage(MessageRow),
    EditMessage {
        id: i64,
        content: String,
        edited_at: i64,
        version: i64,
    },
    DeleteMessage(i64),
    SetPinned {
        id: i64,
        pinned: bool,
    },
    AddReaction(ReactionRow),
    RemoveReaction {
        message_id: i64,
        user_id: String,
        emoji: String,
    },
    InsertPoll {
        poll: PollRow,
        options: Vec<String>,
    },
    SetVote {
        poll_id: String,
        user_id: String,
        option_index: i64,
        voted_at: i64,
    },
    ClosePoll(String),
    InsertFile(FileRow),
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            Self::EnsureRoom(_) => "ensure_room",
            Self::AddMember { .. } => "add_member",
            Self::RemoveMember { .. } => "remove_member",
            Self::InsertMessage(_) => "insert_message",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage(_) => "delete_message",
            Self::SetPinned { .. } => "set_pinned",
            Self::AddReaction(_) => "add_reaction",
            Self::RemoveReaction { .. } => "remove_reaction",
            Self::InsertPoll { .. } => "insert_poll",
            Self::SetVote { .. } => "set_vote",
            Self::ClosePoll(_) => "close_poll",
            Self::InsertFile(_) => "insert_file",
        }
    }

    fn apply(&self, db: &Database) -> Result<()> {
        match self {
            Self::EnsureRoom(room) => db.ensure_room(room).map(drop),
            Self::AddMember {
                room_id,
                user_id,
                joined_at,
            } => db.add_member(room_id, user_id, *joined_at).map(drop),
            Self::RemoveMember { room_id, user_id } => {
                db.remove_member(room_id, user_id).map(drop)
            }
            Self::InsertMessage(msg) => db.insert_message(msg),
            Self::EditMessage {
                id,
                content,
                edited_at,
                version,
            } => {
                if !db.update_message_content(*id, content, *edited_at, *version)? {
                    debug!("Edit v{} of message {} superseded, skipped", version, id);
                }
                Ok(())
            }
            Self::DeleteMessage(id) => db.soft_delete_message(*id).map(drop),
            Self::SetPinned { id, pinned } => db.set_pinned(*id, *pinned).map(drop),
            Self::AddReaction(reaction) => db.add_reaction(reaction).map(drop),
            Self::RemoveReaction {
                message_id,
                user_id,
                emoji,
            } => db.remove_reaction(*message_id, user_id, emoji).map(drop),
            Self::InsertPoll { poll, options } => db.insert_poll(poll, options),
            Self::SetVote {
                poll_id,
                user_id,
                option_index,
                voted_at,
            } => db.set_poll_vote(poll_id, user_id, *option_index, *voted_at),
            Self::ClosePoll(id) => db.close_poll(id).map(drop),
            Self::InsertFile(file) => db.insert_file(file),
        }
    }
}

type Job = Box<dyn FnOnce(&Database) + Send>;

/// Single-writer front for the database.
///
/// One dedicated thread owns every database call, so jobs run in the order
/// they were submitted: a read submitted after a write always observes it.
/// Callers holding a room lock only ever enqueue, never wait.
#[derive(Clone)]
pub struct Store {
    tx: mpsc::UnboundedSender<Job>,
}

impl Store {
    pub fn spawn(db: Arc<Database>) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        std::thread::Builder::new()
            .name("parley-store".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job(&db);
                }
                info!("Store worker stopped");
            })?;
        Ok(Self { tx })
    }

    /// Fire-and-forget write. Failures are logged.
    pub fn write(&self, op: WriteOp) {
        self.write_then(op, |_| {});
    }

    /// Write, then run `on_done` on the worker with the outcome.
    pub fn write_then<F>(&self, op: WriteOp, on_done: F)
    where
        F: FnOnce(&Result<()>) + Send + 'static,
    {
        let job: Job = Box::new(move |db| {
            let result = op.apply(db);
            if let Err(e) = &result {
                error!("Persisting {} failed: {:#}", op.name(), e);
            }
            on_done(&result);
        });
        if self.tx.send(job).is_err() {
            error!("Store worker is gone, write dropped");
        }
    }

    /// Run `f` on the worker after every previously submitted job.
    ///
    /// The job is queued when `call` is invoked, not when the future is first
    /// polled, so a caller can queue a read while holding a room lock and wait
    /// for it after releasing the lock.
    pub fn call<T, F>(&self, f: F) -> impl Future<Output = Result<T>> + Send + use<T, F>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job: Job = Box::new(move |db| {
            let _ = reply.send(f(db));
        });
        let queued = self.tx.send(job).is_ok();
        async move {
            if !queued {
                return Err(anyhow!("store worker is gone"));
            }
            rx.await
                .map_err(|_| anyhow!("store worker dropped the request"))?
        }
    }

    /// Wait until everything submitted so far has been applied.
    pub async fn flush(&self) -> Result<()> {
        self.call(|_| Ok(())).await
    }
}
