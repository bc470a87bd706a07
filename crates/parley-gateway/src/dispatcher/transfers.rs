use std::time::Instant;

use tracing::{debug, error};
use uuid::Uuid;

use parley_db::models::FileRow;
use parley_types::frames::ServerFrame;

use super::messaging::Draft;
use super::{ClientConn, Gateway, now_ms};
use crate::error::{GatewayError, GatewayResult, not_found};
use crate::sessions::Session;
use crate::store::WriteOp;
use crate::uploads::UploadMeta;

/// Upload failures go back as `upload_error` rather than `error`.
pub(super) fn report_upload(
    conn: &ClientConn,
    upload_id: Option<Uuid>,
    result: GatewayResult<()>,
) -> GatewayResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if let GatewayError::Internal(inner) = &e {
                error!("Upload {:?} failed: {:#}", upload_id, inner);
            } else {
                debug!("Upload {:?} rejected: {}", upload_id, e);
            }
            let message = match e.to_frame() {
                ServerFrame::Error { message, .. } => message,
                _ => e.to_string(),
            };
            conn.send(&ServerFrame::UploadError {
                upload_id,
                message,
                code: e.code().to_string(),
            });
            Ok(())
        }
    }
}

impl Gateway {
    pub(super) async fn upload_init(
        &self,
        conn: &ClientConn,
        session: &Session,
        mut meta: UploadMeta,
    ) -> GatewayResult<()> {
        let room = self.inner.rooms.open(&meta.room_id, session.user_id).await?;
        {
            let mut state = room.lock().await;
            self.ensure_member(&room, &mut state, session)?;
        }
        meta.room_id = room.id.clone();

        let ticket = self
            .inner
            .uploads
            .init(session.user_id, meta, Instant::now())?;
        conn.send(&ServerFrame::UploadReady {
            upload_id: ticket.upload_id,
            chunk_size: ticket.chunk_size,
            total_chunks: ticket.total_chunks,
        });
        Ok(())
    }

    pub(super) async fn upload_chunk(
        &self,
        conn: &ClientConn,
        session: &Session,
        upload_id: Uuid,
        index: u32,
        chunk_data: &str,
        total_chunks: Option<u32>,
    ) -> GatewayResult<()> {
        let progress = self
            .inner
            .uploads
            .put_chunk(
                session.user_id,
                upload_id,
                index,
                chunk_data,
                total_chunks,
                Instant::now(),
            )
            .await?;
        conn.send(&ServerFrame::UploadProgress {
            upload_id,
            chunks_received: progress.chunks_received,
            total_chunks: progress.total_chunks,
            progress: progress.progress,
        });
        Ok(())
    }

    /// Assemble, record the file, then post it to the room as a chat
    /// message carrying the file descriptor. Membership is checked before
    /// assembly and again before anything is announced.
    pub(super) async fn upload_finalize(
        &self,
        conn: &ClientConn,
        session: &Session,
        upload_id: Uuid,
    ) -> GatewayResult<()> {
        let room_id = self.inner.uploads.room_of(session.user_id, upload_id).await?;
        let room = self
            .inner
            .rooms
            .get(&room_id)
            .await?
            .ok_or_else(|| not_found(format!("room {} not found", room_id)))?;
        {
            let mut state = room.lock().await;
            self.ensure_member(&room, &mut state, session)?;
        }

        let done = self
            .inner
            .uploads
            .finalize(session.user_id, upload_id, Instant::now())
            .await?;
        let file = done.file;

        let voice = file.mime_type.starts_with("audio/");
        let content = if voice {
            "🎤 Voice Message".to_string()
        } else {
            format!("📎 {}", file.file_name)
        };
        let mut metadata = serde_json::to_value(&file).map_err(anyhow::Error::from)?;
        if let Some(fields) = metadata.as_object_mut() {
            fields.insert(
                "messageType".to_string(),
                serde_json::Value::from(if voice { "voice" } else { "file" }),
            );
        }

        let mut state = room.lock().await;
        if let Err(e) = self.ensure_member(&room, &mut state, session) {
            drop(state);
            self.inner.uploads.revoke(&file).await;
            return Err(e);
        }

        self.inner.store.write(WriteOp::InsertFile(FileRow {
            id: file.file_id.to_string(),
            uploader_id: session.user_id.to_string(),
            room_id: done.room_id.clone(),
            file_name: file.file_name.clone(),
            file_size: i64::try_from(file.file_size).unwrap_or(i64::MAX),
            mime_type: file.mime_type.clone(),
            url: file.file_url.clone(),
            sha256: file.sha256.clone(),
            created_at: now_ms(),
        }));
        conn.send(&ServerFrame::UploadComplete {
            upload_id,
            file: file.clone(),
        });
        self.append_message(
            &room,
            &mut state,
            Draft {
                sender_id: session.user_id,
                sender_name: session.username.clone(),
                content,
                reply_to_id: None,
                metadata: Some(metadata),
            },
            Some(&conn.outbound),
        );
        Ok(())
    }
}
