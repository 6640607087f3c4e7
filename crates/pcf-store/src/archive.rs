//! Content-addressed archive of raw fetched source payloads.
//!
//! Every sync keeps the bytes it worked from, so a factor in the store can be
//! traced back to the exact workbook or archive that produced it. Identical
//! payloads land on the same path and are not rewritten.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn payload_path(
        &self,
        source_name: &str,
        fetched_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.');
        let ext = if ext.is_empty() { "bin" } else { ext };
        self.root
            .join(source_name)
            .join(day)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Write bytes under a hash-addressed path via atomic temp-file rename.
    pub async fn store(
        &self,
        source_name: &str,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.payload_path(source_name, fetched_at, &content_hash, extension);
        let parent = path
            .parent()
            .context("payload path always has a parent")?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(StoredPayload {
                content_hash,
                path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(StoredPayload {
                content_hash,
                path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredPayload {
                    content_hash,
                    path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| format!("renaming into {}", path.display()))
            }
        }
    }
}
