//! Filesystem-backed attachment storage.
//!
//! Accepts one file per call, writes it under a configured root and
//! returns a relative reference path suitable for embedding in a message
//! payload. Stored files are immutable; nothing here tracks ownership or
//! expiry.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;

/// Default upload cap: 10 MiB, inclusive.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const URL_PREFIX: &str = "/uploads";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("attachment write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConfig {
    pub root: PathBuf,
    pub max_upload_bytes: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("var/uploads"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

pub fn validate_config(cfg: &MediaConfig) -> Result<()> {
    if cfg.root.as_os_str().is_empty() {
        anyhow::bail!("media root must be configured");
    }
    if cfg.max_upload_bytes == 0 {
        anyhow::bail!("media upload limit cannot be zero");
    }

    Ok(())
}

/// Reference to a stored attachment.
#[derive(Debug, Clone)]
pub struct StoredAttachment {
    /// Relative URL to embed as `file_url` or `voice_url`.
    pub url: String,
    /// Path of the file on disk.
    pub path: PathBuf,
}

#[derive(Clone)]
pub struct AttachmentStore {
    root: PathBuf,
    max_bytes: usize,
}

impl AttachmentStore {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            root: config.root.clone(),
            max_bytes: config.max_upload_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Store one file and return its reference.
    ///
    /// The size check happens before any byte is written, so a rejected
    /// upload leaves no partial artifact. The storage key combines the
    /// millisecond arrival time with the sanitized original name; two
    /// uploads of the same name at different instants never collide, but
    /// same-instant collisions are not guarded against.
    pub async fn store(&self, original_name: &str, data: &[u8]) -> Result<StoredAttachment, MediaError> {
        if data.len() > self.max_bytes {
            return Err(MediaError::TooLarge {
                size: data.len(),
                limit: self.max_bytes,
            });
        }

        let key = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            sanitize_file_name(original_name)
        );
        let path = self.root.join(&key);

        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, data).await?;

        Ok(StoredAttachment {
            url: format!("{URL_PREFIX}/{key}"),
            path,
        })
    }
}

/// Strip path components and anything outside a conservative character set.
fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|base| base.to_str())
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches(['.', '_']).is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_store(max_bytes: usize) -> (AttachmentStore, PathBuf) {
        let root = std::env::temp_dir().join(format!("gymdesk-media-{}", Uuid::new_v4()));
        let store = AttachmentStore::new(&MediaConfig {
            root: root.clone(),
            max_upload_bytes: max_bytes,
        });
        (store, root)
    }

    #[tokio::test]
    async fn stores_file_and_returns_relative_url() {
        let (store, root) = scratch_store(DEFAULT_MAX_UPLOAD_BYTES);

        let stored = store
            .store("workout plan.pdf", b"plan contents")
            .await
            .expect("store succeeds");

        assert!(stored.url.starts_with("/uploads/"));
        assert!(stored.url.ends_with("workout_plan.pdf"));
        let bytes = tokio::fs::read(&stored.path).await.expect("file readable");
        assert_eq!(bytes, b"plan contents");

        tokio::fs::remove_dir_all(root).await.ok();
    }

    #[tokio::test]
    async fn file_at_exact_limit_is_accepted() {
        let (store, root) = scratch_store(64);

        let data = vec![0u8; 64];
        store.store("exact.bin", &data).await.expect("limit is inclusive");

        tokio::fs::remove_dir_all(root).await.ok();
    }

    #[tokio::test]
    async fn oversize_file_is_rejected_without_artifact() {
        let (store, root) = scratch_store(64);

        let data = vec![0u8; 65];
        let err = store.store("big.bin", &data).await.unwrap_err();
        assert!(matches!(err, MediaError::TooLarge { size: 65, limit: 64 }));
        assert!(!root.exists(), "rejected upload must not touch the store");
    }

    #[tokio::test]
    async fn same_name_different_instants_get_distinct_keys() {
        let (store, root) = scratch_store(DEFAULT_MAX_UPLOAD_BYTES);

        let first = store.store("note.txt", b"one").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = store.store("note.txt", b"two").await.unwrap();
        assert_ne!(first.url, second.url);

        tokio::fs::remove_dir_all(root).await.ok();
    }

    #[test]
    fn sanitize_strips_directories_and_odd_characters() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("trainer notes?.txt"), "trainer_notes_.txt");
        assert_eq!(sanitize_file_name(""), "upload");
        assert_eq!(sanitize_file_name("..."), "upload");
    }

    #[test]
    fn default_config_validates() {
        validate_config(&MediaConfig::default()).expect("defaults are valid");
    }

    #[test]
    fn zero_limit_is_rejected() {
        let cfg = MediaConfig {
            max_upload_bytes: 0,
            ..MediaConfig::default()
        };
        assert!(validate_config(&cfg).is_err());
    }
}
