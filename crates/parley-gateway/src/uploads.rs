use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info};
use uuid::Uuid;

use parley_types::models::FileDescriptor;

use crate::bitfield::ChunkBitfield;
use crate::error::{GatewayError, GatewayResult, conflict, denied, not_found, validation};
use crate::storage::BlobStorage;

pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 8 * 1024 * 1024;
const MAX_FILE_NAME_CHARS: usize = 255;
const DEFAULT_MIME: &str = "application/octet-stream";

/// What the client declared in `upload_init`.
#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub chunk_size: Option<u32>,
    pub total_chunks: u32,
    /// Already resolved and authorized by the caller.
    pub room_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTicket {
    pub upload_id: Uuid,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub upload_id: Uuid,
    pub chunks_received: u32,
    pub total_chunks: u32,
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedUpload {
    pub upload_id: Uuid,
    pub owner: Uuid,
    pub room_id: String,
    pub file: FileDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Receiving,
    Finalized,
    Abandoned,
}

struct UploadSession {
    owner: Uuid,
    file_name: String,
    file_size: u64,
    mime_type: String,
    chunk_size: u32,
    room_id: String,
    received: ChunkBitfield,
    last_activity: Instant,
    phase: Phase,
}

/// Multi-chunk transfers keyed by upload id.
///
/// Chunks may arrive in any order and may be resent; the latest copy of an
/// index wins. Each session has its own lock so uploads never wait on each
/// other.
pub struct UploadCoordinator {
    storage: BlobStorage,
    max_bytes: u64,
    timeout: Duration,
    sessions: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<UploadSession>>>>,
}

impl UploadCoordinator {
    pub fn new(storage: BlobStorage, max_bytes: u64, timeout: Duration) -> Self {
        Self {
            storage,
            max_bytes,
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn init(&self, owner: Uuid, meta: UploadMeta, now: Instant) -> GatewayResult<UploadTicket> {
        let file_name = display_name(&meta.file_name)?;
        if meta.file_size == 0 {
            return Err(validation("file is empty"));
        }
        if meta.file_size > self.max_bytes {
            return Err(validation(format!(
                "file exceeds the {} byte limit",
                self.max_bytes
            )));
        }
        let chunk_size = meta.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(validation(format!(
                "chunk size must be 1-{} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        let needed = meta.file_size.div_ceil(u64::from(chunk_size));
        if meta.total_chunks == 0 || u64::from(meta.total_chunks) < needed {
            return Err(validation(format!(
                "{} chunk(s) of {} bytes cannot hold {} bytes",
                meta.total_chunks, chunk_size, meta.file_size
            )));
        }
        if u64::from(meta.total_chunks) > needed.max(1) * 2 {
            return Err(validation("too many chunks for the declared size"));
        }

        let upload_id = Uuid::new_v4();
        let session = UploadSession {
            owner,
            file_name,
            file_size: meta.file_size,
            mime_type: meta
                .mime_type
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MIME.to_string()),
            chunk_size,
            room_id: meta.room_id,
            received: ChunkBitfield::new(meta.total_chunks),
            last_activity: now,
            phase: Phase::Receiving,
        };
        info!(
            "Upload {} started by {}: {} ({} bytes, {} chunks)",
            upload_id, owner, session.file_name, session.file_size, meta.total_chunks
        );
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(upload_id, Arc::new(tokio::sync::Mutex::new(session)));

        Ok(UploadTicket {
            upload_id,
            chunk_size,
            total_chunks: meta.total_chunks,
        })
    }

    fn session(&self, upload_id: Uuid) -> GatewayResult<Arc<tokio::sync::Mutex<UploadSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&upload_id)
            .cloned()
            .ok_or_else(|| not_found("unknown upload"))
    }

    pub async fn put_chunk(
        &self,
        owner: Uuid,
        upload_id: Uuid,
        index: u32,
        chunk_data: &str,
        total_chunks: Option<u32>,
        now: Instant,
    ) -> GatewayResult<ChunkProgress> {
        let data = BASE64
            .decode(chunk_data.trim())
            .map_err(|_| validation("chunk data is not valid base64"))?;

        let handle = self.session(upload_id)?;
        let mut session = handle.lock().await;
        check_access(&session, owner)?;
        if let Some(declared) = total_chunks {
            if declared != session.received.total() {
                return Err(validation(format!(
                    "upload has {} chunks, frame says {}",
                    session.received.total(),
                    declared
                )));
            }
        }
        if index >= session.received.total() {
            return Err(validation(format!("chunk index {} out of range", index)));
        }
        if data.is_empty() || data.len() > session.chunk_size as usize {
            return Err(validation(format!(
                "chunk must be 1-{} bytes",
                session.chunk_size
            )));
        }

        self.storage.write_chunk(upload_id, index, &data).await?;
        if !session.received.set(index) {
            debug!("Upload {} chunk {} resent", upload_id, index);
        }
        session.last_activity = now;

        let received = session.received.received();
        let total = session.received.total();
        Ok(ChunkProgress {
            upload_id,
            chunks_received: received,
            total_chunks: total,
            progress: (u64::from(received) * 100 / u64::from(total)) as u8,
        })
    }

    /// Assemble a complete upload into the blob store. A second finalize of
    /// the same upload is a conflict.
    pub async fn finalize(
        &self,
        owner: Uuid,
        upload_id: Uuid,
        now: Instant,
    ) -> GatewayResult<FinalizedUpload> {
        let handle = self.session(upload_id)?;
        let mut session = handle.lock().await;
        check_access(&session, owner)?;
        if !session.received.is_complete() {
            return Err(GatewayError::IncompleteUpload {
                missing: session.received.missing(),
            });
        }

        let file_id = Uuid::new_v4();
        let blob = self
            .storage
            .assemble(upload_id, session.received.total(), file_id, &session.file_name)
            .await?;

        if blob.size != session.file_size {
            self.storage.remove_blob(&blob.stored_name).await;
            session.phase = Phase::Abandoned;
            self.forget(upload_id);
            return Err(validation(format!(
                "received {} bytes but {} were declared",
                blob.size, session.file_size
            )));
        }

        session.phase = Phase::Finalized;
        session.last_activity = now;
        info!(
            "Upload {} finalized as {} ({} bytes)",
            upload_id, blob.url, blob.size
        );

        Ok(FinalizedUpload {
            upload_id,
            owner,
            room_id: session.room_id.clone(),
            file: FileDescriptor {
                file_id,
                file_name: session.file_name.clone(),
                file_url: blob.url,
                file_size: blob.size,
                mime_type: session.mime_type.clone(),
                sha256: blob.sha256,
            },
        })
    }

    /// Target room of an upload still accepting chunks.
    pub async fn room_of(&self, owner: Uuid, upload_id: Uuid) -> GatewayResult<String> {
        let handle = self.session(upload_id)?;
        let session = handle.lock().await;
        check_access(&session, owner)?;
        Ok(session.room_id.clone())
    }

    /// Drop the blob of a finalized upload that could not be posted.
    pub async fn revoke(&self, file: &FileDescriptor) {
        info!("Revoking finalized file {} ({})", file.file_id, file.file_url);
        self.storage.remove_url(&file.file_url).await;
    }

    /// Drop sessions idle for longer than the timeout, freeing their staged
    /// chunks. Sessions busy with a chunk are skipped this round.
    pub async fn collect_abandoned(&self, now: Instant) -> usize {
        let candidates: Vec<(Uuid, Arc<tokio::sync::Mutex<UploadSession>>)> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        let mut collected = 0;
        for (upload_id, handle) in candidates {
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if now.saturating_duration_since(session.last_activity) < self.timeout {
                continue;
            }
            if session.phase == Phase::Receiving {
                self.storage.discard(upload_id).await;
                debug!("Upload {} abandoned", upload_id);
            }
            session.phase = Phase::Abandoned;
            self.forget(upload_id);
            collected += 1;
        }
        collected
    }

    fn forget(&self, upload_id: Uuid) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&upload_id);
    }

    pub fn active(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn check_access(session: &UploadSession, owner: Uuid) -> GatewayResult<()> {
    if session.owner != owner {
        return Err(denied("upload belongs to another user"));
    }
    match session.phase {
        Phase::Receiving => Ok(()),
        Phase::Finalized => Err(conflict("upload already finalized")),
        Phase::Abandoned => Err(not_found("unknown upload")),
    }
}

/// Base name only, never a path.
fn display_name(raw: &str) -> GatewayResult<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(validation("file name is empty"));
    }
    if name.chars().count() > MAX_FILE_NAME_CHARS {
        return Err(validation("file name is too long"));
    }
    Ok(name.to_string())
}
