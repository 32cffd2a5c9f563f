//! Media storage
//!
//! Content-addressed files under the media root: `<sha256>` holds the bytes
//! and `<sha256>.meta.json` the original filename and content type.

use crate::error::{Error, Result};
use crate::models::MediaRef;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

pub struct MediaStore {
    root: PathBuf,
    max_bytes: u64,
}

fn is_sha256_hex(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn meta_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{}.meta.json", hash))
    }

    /// Write through a temp file unique to this call, then rename into place.
    async fn write_atomically(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let temp_path = self.root.join(format!(".upload-{}.tmp", Uuid::new_v4()));
        if let Err(e) = fs::write(&temp_path, contents).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Store `data`. Identical content maps to the same reference.
    pub async fn put(&self, data: Bytes, filename: &str, content_type: &str) -> Result<MediaRef> {
        if data.is_empty() {
            return Err(Error::ValidationFailed("empty upload".into()));
        }
        if data.len() as u64 > self.max_bytes {
            return Err(Error::ValidationFailed(format!(
                "upload of {} bytes exceeds the {} byte limit",
                data.len(),
                self.max_bytes
            )));
        }

        let hash = format!("{:x}", Sha256::digest(&data));
        let media = MediaRef {
            url: format!("/media/{}", hash),
            hash: hash.clone(),
            content_type: content_type.to_string(),
            filename: filename.to_string(),
            size: data.len() as u64,
        };

        fs::create_dir_all(&self.root).await?;
        let path = self.root.join(&hash);
        if fs::try_exists(&path).await? {
            debug!("Media {} already stored", hash);
        } else {
            self.write_atomically(&path, &data).await?;
        }
        let meta = serde_json::to_vec_pretty(&media)?;
        self.write_atomically(&self.meta_path(&hash), &meta).await?;

        info!("Stored media {} ({} bytes)", hash, media.size);
        Ok(media)
    }

    pub async fn get(&self, hash: &str) -> Result<(Bytes, MediaRef)> {
        if !is_sha256_hex(hash) {
            return Err(Error::NotFound(format!("media {}", hash)));
        }
        let data = match fs::read(self.root.join(hash)).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("media {}", hash)))
            }
            Err(e) => return Err(e.into()),
        };
        let media = match fs::read(self.meta_path(hash)).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            // Bytes without a sidecar are still served.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MediaRef {
                url: format!("/media/{}", hash),
                hash: hash.to_string(),
                content_type: "application/octet-stream".to_string(),
                filename: hash.to_string(),
                size: data.len() as u64,
            },
            Err(e) => return Err(e.into()),
        };
        Ok((data, media))
    }
}
