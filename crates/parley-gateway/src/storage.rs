use anyhow::{Result, bail};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;

/// URL prefix under which finalized files are served.
pub const PUBLIC_PREFIX: &str = "/uploads";

/// A file assembled into the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub stored_name: String,
    pub url: String,
    pub size: u64,
    pub sha256: String,
}

/// On-disk blob store for uploads.
///
/// Chunks are staged as `{temp_dir}/{upload_id}/{index}.part`, so a resend of
/// an index simply overwrites the earlier copy. Finalized files live flat in
/// `{dir}/{file_id}.{ext}`.
pub struct BlobStorage {
    dir: PathBuf,
    temp_dir: PathBuf,
}

impl BlobStorage {
    pub async fn new(dir: PathBuf, temp_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        fs::create_dir_all(&temp_dir).await?;
        info!("Upload storage directory: {}", dir.display());
        Ok(Self { dir, temp_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn staging_dir(&self, upload_id: Uuid) -> PathBuf {
        self.temp_dir.join(upload_id.to_string())
    }

    fn chunk_path(&self, upload_id: Uuid, index: u32) -> PathBuf {
        self.staging_dir(upload_id).join(format!("{index}.part"))
    }

    pub async fn write_chunk(&self, upload_id: Uuid, index: u32, data: &[u8]) -> Result<()> {
        fs::create_dir_all(self.staging_dir(upload_id)).await?;
        let mut file = fs::File::create(self.chunk_path(upload_id, index)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Concatenate chunks `0..total` into the blob store, hashing as we go.
    /// Staging files are removed on success.
    pub async fn assemble(
        &self,
        upload_id: Uuid,
        total: u32,
        file_id: Uuid,
        file_name: &str,
    ) -> Result<StoredBlob> {
        let stored_name = match extension(file_name) {
            Some(ext) => format!("{file_id}.{ext}"),
            None => file_id.to_string(),
        };
        let final_path = self.dir.join(&stored_name);
        let mut out = fs::File::create(&final_path).await?;
        let copied = self.copy_chunks(upload_id, total, &mut out).await;
        drop(out);
        let (size, sha256) = match copied {
            Ok(done) => done,
            Err(e) => {
                fs::remove_file(&final_path).await.ok();
                return Err(e);
            }
        };

        self.discard(upload_id).await;

        Ok(StoredBlob {
            url: format!("{}/{}", PUBLIC_PREFIX, stored_name),
            stored_name,
            size,
            sha256,
        })
    }

    /// Append chunks `0..total` to `out`. Returns the byte count and the
    /// hex SHA-256 of everything written.
    async fn copy_chunks(&self, upload_id: Uuid, total: u32, out: &mut fs::File) -> Result<(u64, String)> {
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = Vec::new();
        for index in 0..total {
            buf.clear();
            let path = self.chunk_path(upload_id, index);
            let read = match fs::File::open(&path).await {
                Ok(mut chunk) => chunk.read_to_end(&mut buf).await,
                Err(e) => Err(e),
            };
            if let Err(e) = read {
                bail!("chunk {} of upload {} unreadable: {}", index, upload_id, e);
            }
            hasher.update(&buf);
            out.write_all(&buf).await?;
            size += buf.len() as u64;
        }
        out.flush().await?;
        Ok((size, hex::encode(hasher.finalize())))
    }

    /// Remove a finalized blob by its public URL.
    pub async fn remove_url(&self, url: &str) {
        match url.strip_prefix(PUBLIC_PREFIX).and_then(|rest| rest.strip_prefix('/')) {
            Some(stored_name) if !stored_name.contains(['/', '\\']) => {
                self.remove_blob(stored_name).await
            }
            _ => warn!("Refusing to remove blob outside the store: {}", url),
        }
    }

    pub async fn remove_blob(&self, stored_name: &str) {
        if let Err(e) = fs::remove_file(self.dir.join(stored_name)).await {
            warn!("Failed to remove blob {}: {}", stored_name, e);
        }
    }

    /// Remove every staged chunk of an upload.
    pub async fn discard(&self, upload_id: Uuid) {
        let dir = self.staging_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staging dir {}: {}", dir.display(), e),
        }
    }
}

/// Lowercased alphanumeric extension, never anything path-like.
fn extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ok = !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then(|| ext.to_ascii_lowercase())
}
