use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, anyhow};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use parley_db::models::RoomRow;
use parley_types::GLOBAL_ROOM_ID;
use parley_types::models::{RoomKind, RoomSummary};

use crate::cache::LruCache;
use crate::error::{GatewayResult, denied, not_found, validation};
use crate::game::TicTacToe;
use crate::messages::Message;
use crate::polls::Poll;
use crate::store::{Store, WriteOp};

const DM_PREFIX: &str = "dm_";
const MAX_ROOM_ID_LEN: usize = 128;
const MAX_ROOM_NAME_CHARS: usize = 64;

/// Canonical DM room id: both user ids, smaller first.
pub fn dm_room_id(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{DM_PREFIX}{lo}_{hi}")
}

/// A room id as a client wrote it, resolved against the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRef {
    Named(String),
    /// `dm_<peer>` or `dm_<a>_<b>`, already canonicalized.
    Dm { id: String, peer: Uuid },
}

pub fn resolve_room_ref(raw: &str, requester: Uuid) -> GatewayResult<RoomRef> {
    let raw = raw.trim();
    let Some(rest) = raw.strip_prefix(DM_PREFIX) else {
        if raw.is_empty()
            || raw.len() > MAX_ROOM_ID_LEN
            || !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(validation("invalid room id"));
        }
        return Ok(RoomRef::Named(raw.to_string()));
    };

    let parse = |s: &str| {
        s.parse::<Uuid>()
            .map_err(|_| validation("malformed direct message room id"))
    };
    let peer = match rest.split_once('_') {
        Some((a, b)) => {
            let (a, b) = (parse(a)?, parse(b)?);
            if a == requester {
                b
            } else if b == requester {
                a
            } else {
                return Err(denied("not a participant of this direct message"));
            }
        }
        None => parse(rest)?,
    };
    if peer == requester {
        return Err(validation("cannot open a direct message with yourself"));
    }
    Ok(RoomRef::Dm {
        id: dm_room_id(requester, peer),
        peer,
    })
}

/// Whether `join` added the user or found them already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipResult {
    Joined,
    AlreadyMember,
}

/// Everything about a room that changes. Guarded by the room's lock, which
/// is the single sequencer for that room's events.
pub struct RoomState {
    pub members: HashSet<Uuid>,
    pub messages: LruCache<i64, Message>,
    pub polls: HashMap<Uuid, Poll>,
    pub game: Option<TicTacToe>,
}

pub struct RoomHandle {
    pub id: String,
    pub name: String,
    pub kind: RoomKind,
    pub created_by: Option<Uuid>,
    pub created_at: i64,
    state: Mutex<RoomState>,
}

impl RoomHandle {
    fn new(
        row: RoomRow,
        members: HashSet<Uuid>,
        polls: Vec<Poll>,
        cache_capacity: usize,
    ) -> anyhow::Result<Self> {
        let kind = RoomKind::parse(&row.kind)
            .ok_or_else(|| anyhow!("room {} has unknown kind {}", row.id, row.kind))?;
        let created_by = match row.created_by.as_deref() {
            Some(id) => Some(id.parse().context("malformed room creator id")?),
            None => None,
        };
        Ok(Self {
            id: row.id,
            name: row.name,
            kind,
            created_by,
            created_at: row.created_at,
            state: Mutex::new(RoomState {
                members,
                messages: LruCache::new(cache_capacity),
                polls: polls.into_iter().map(|p| (p.id, p)).collect(),
                game: None,
            }),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    /// May pin messages: the creator, either DM participant, or any member
    /// of a room nobody created.
    pub fn is_moderator(&self, state: &RoomState, user_id: Uuid) -> bool {
        match (self.kind, self.created_by) {
            (RoomKind::Dm, _) | (_, None) => state.members.contains(&user_id),
            (_, Some(creator)) => creator == user_id,
        }
    }

    /// Whether a non-member may become a member on their own.
    pub fn is_open(&self) -> bool {
        self.kind == RoomKind::Public
    }

    pub fn summary(&self, state: &RoomState) -> RoomSummary {
        RoomSummary {
            room_id: self.id.clone(),
            room_name: self.name.clone(),
            room_type: self.kind,
            member_count: state.members.len(),
        }
    }
}

/// Room existence and membership.
///
/// Rooms are loaded from the database on first reference and then stay in
/// memory. The directory lock only guards the id -> room map; everything
/// inside a room is behind that room's own lock.
pub struct RoomDirectory {
    store: Store,
    cache_capacity: usize,
    rooms: tokio::sync::RwLock<HashMap<String, Arc<RoomHandle>>>,
    /// user -> rooms they belong to, across loaded rooms
    user_rooms: RwLock<HashMap<Uuid, HashSet<String>>>,
}

impl RoomDirectory {
    pub fn new(store: Store, cache_capacity: usize) -> Self {
        Self {
            store,
            cache_capacity,
            rooms: tokio::sync::RwLock::new(HashMap::new()),
            user_rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Loaded or loadable room, None if it does not exist.
    pub async fn get(&self, room_id: &str) -> GatewayResult<Option<Arc<RoomHandle>>> {
        if let Some(handle) = self.rooms.read().await.get(room_id) {
            return Ok(Some(handle.clone()));
        }

        let id = room_id.to_string();
        let loaded = self
            .store
            .call(move |db| {
                let Some(room) = db.get_room(&id)? else {
                    return Ok(None);
                };
                let members = db.room_members(&id)?;
                let polls = db.get_polls_for_room(&id)?;
                Ok(Some((room, members, polls)))
            })
            .await?;
        let Some((row, members, polls)) = loaded else {
            return Ok(None);
        };

        let members: HashSet<Uuid> = members.iter().filter_map(|m| m.parse().ok()).collect();
        let polls = polls
            .into_iter()
            .map(Poll::from_record)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let handle = Arc::new(RoomHandle::new(
            row,
            members.clone(),
            polls,
            self.cache_capacity,
        )?);

        let mut rooms = self.rooms.write().await;
        let winner = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| handle.clone())
            .clone();
        if Arc::ptr_eq(&winner, &handle) {
            debug!("Loaded room {} ({} members)", room_id, members.len());
            let mut index = self.user_rooms.write().unwrap_or_else(PoisonError::into_inner);
            for member in members {
                index.entry(member).or_default().insert(room_id.to_string());
            }
        }
        Ok(Some(winner))
    }

    /// The room a client-supplied id refers to. DM ids are canonicalized and
    /// the DM is created on first reference.
    pub async fn open(&self, raw_id: &str, requester: Uuid) -> GatewayResult<Arc<RoomHandle>> {
        match resolve_room_ref(raw_id, requester)? {
            RoomRef::Named(id) => self
                .get(&id)
                .await?
                .ok_or_else(|| not_found(format!("room {} does not exist", id))),
            RoomRef::Dm { peer, .. } => self.resolve_or_create_dm(requester, peer).await,
        }
    }

    /// Same room whichever side asks, and concurrent calls converge on it:
    /// the row is insert-if-absent and the in-memory map keeps the first
    /// handle loaded.
    pub async fn resolve_or_create_dm(&self, a: Uuid, b: Uuid) -> GatewayResult<Arc<RoomHandle>> {
        if a == b {
            return Err(validation("cannot open a direct message with yourself"));
        }
        let id = dm_room_id(a, b);
        if let Some(handle) = self.get(&id).await? {
            return Ok(handle);
        }

        let (a_str, b_str) = (a.to_string(), b.to_string());
        let known = self
            .store
            .call(move |db| {
                Ok(db.get_user_by_id(&a_str)?.is_some() && db.get_user_by_id(&b_str)?.is_some())
            })
            .await?;
        if !known {
            return Err(not_found("unknown user"));
        }

        let now = chrono::Utc::now().timestamp_millis();
        self.store.write(WriteOp::EnsureRoom(RoomRow {
            id: id.clone(),
            name: "Direct Message".to_string(),
            kind: RoomKind::Dm.as_str().to_string(),
            created_by: None,
            created_at: now,
        }));
        for user in [a, b] {
            self.store.write(WriteOp::AddMember {
                room_id: id.clone(),
                user_id: user.to_string(),
                joined_at: now,
            });
        }
        info!("Direct message room {} ready", id);

        self.get(&id)
            .await?
            .ok_or_else(|| anyhow!("direct message room {} vanished after creation", id).into())
    }

    pub async fn create_room(
        &self,
        name: &str,
        kind: RoomKind,
        creator: Uuid,
        now: i64,
    ) -> GatewayResult<Arc<RoomHandle>> {
        if kind == RoomKind::Dm {
            return Err(validation(
                "direct message rooms are opened by id, not created",
            ));
        }
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_ROOM_NAME_CHARS {
            return Err(validation(format!(
                "room name must be 1-{} characters",
                MAX_ROOM_NAME_CHARS
            )));
        }

        let row = RoomRow {
            id: format!("room_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            kind: kind.as_str().to_string(),
            created_by: Some(creator.to_string()),
            created_at: now,
        };
        let id = row.id.clone();
        self.store.write(WriteOp::EnsureRoom(row.clone()));
        self.store.write(WriteOp::AddMember {
            room_id: id.clone(),
            user_id: creator.to_string(),
            joined_at: now,
        });

        let handle = Arc::new(RoomHandle::new(
            row,
            HashSet::from([creator]),
            Vec::new(),
            self.cache_capacity,
        )?);
        self.rooms.write().await.insert(id.clone(), handle.clone());
        self.index_add(creator, &id);
        info!("Room {} ({}) created by {}", id, name, creator);
        Ok(handle)
    }

    /// Self-service join. Private rooms need an invitation, DMs admit only
    /// their two participants.
    pub fn join(
        &self,
        room: &RoomHandle,
        state: &mut RoomState,
        user_id: Uuid,
        now: i64,
    ) -> GatewayResult<MembershipResult> {
        if state.members.contains(&user_id) {
            return Ok(MembershipResult::AlreadyMember);
        }
        if !room.is_open() {
            return Err(denied(format!("room {} requires an invitation", room.id)));
        }
        self.add_member(room, state, user_id, now);
        Ok(MembershipResult::Joined)
    }

    /// Unconditional add, used for invitations and the global room.
    pub fn add_member(&self, room: &RoomHandle, state: &mut RoomState, user_id: Uuid, now: i64) -> bool {
        if !state.members.insert(user_id) {
            return false;
        }
        self.store.write(WriteOp::AddMember {
            room_id: room.id.clone(),
            user_id: user_id.to_string(),
            joined_at: now,
        });
        self.index_add(user_id, &room.id);
        true
    }

    pub fn leave(&self, room: &RoomHandle, state: &mut RoomState, user_id: Uuid) -> GatewayResult<()> {
        if room.id == GLOBAL_ROOM_ID {
            return Err(validation("the global room cannot be left"));
        }
        if room.kind == RoomKind::Dm {
            return Err(validation("direct message rooms cannot be left"));
        }
        if !state.members.remove(&user_id) {
            return Err(not_found(format!("not a member of room {}", room.id)));
        }
        self.store.write(WriteOp::RemoveMember {
            room_id: room.id.clone(),
            user_id: user_id.to_string(),
        });
        let mut index = self.user_rooms.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(rooms) = index.get_mut(&user_id) {
            rooms.remove(&room.id);
        }
        Ok(())
    }

    fn index_add(&self, user_id: Uuid, room_id: &str) {
        self.user_rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id)
            .or_default()
            .insert(room_id.to_string());
    }

    /// Loaded rooms the user belongs to.
    pub async fn rooms_of(&self, user_id: Uuid) -> Vec<Arc<RoomHandle>> {
        let ids: Vec<String> = self
            .user_rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let rooms = self.rooms.read().await;
        ids.iter().filter_map(|id| rooms.get(id).cloned()).collect()
    }

    pub async fn loaded(&self) -> usize {
        self.rooms.read().await.len()
    }
}
