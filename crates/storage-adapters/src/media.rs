//! # Local media storage
//!
//! Local filesystem implementation of `MediaStorage`.
//! Uploads are content-addressed by SHA-1 and sharded two levels deep:
//! `<root>/src/ab/cd/<sha1>.<ext>` with thumbnails under `<root>/thumb/`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use domains::{DomainError, DomainResult, MediaStorage};

/// File extensions indexed by file type id.
const EXTENSIONS: [&str; 16] = [
    "jpg", "png", "gif", "webm", "pdf", "svg", "mp4", "mp3", "ogg", "zip", "7z", "tar.gz",
    "tar.xz", "flac", "", "txt",
];

/// File type id of an upload without a file (e.g. audio without cover art).
pub const NO_FILE: u8 = 14;

pub struct LocalMediaStorage {
    /// Root directory for all uploads (e.g., "./data/images")
    root_path: PathBuf,
}

impl LocalMediaStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root_path: root.into() }
    }

    /// Generates a sharded path: "<root>/<kind>/ab/cd/<hash>.<ext>"
    fn sharded_path(&self, kind: &str, hash: &str, file_type: u8) -> DomainResult<PathBuf> {
        let ext = EXTENSIONS
            .get(usize::from(file_type))
            .ok_or_else(|| DomainError::InvalidInput(format!("unknown file type {file_type}")))?;
        if hash.len() < 4 || !hash.is_ascii() {
            return Err(DomainError::InvalidInput(format!("malformed image hash {hash:?}")));
        }
        let mut path = self.root_path.join(kind);
        path.push(&hash[0..2]);
        path.push(&hash[2..4]);
        path.push(format!("{hash}.{ext}"));
        Ok(path)
    }
}

/// Removes a file; one that is already gone counts as removed.
async fn remove_if_exists(path: &Path) -> DomainResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "Media file already removed");
            Ok(())
        }
        Err(e) => Err(DomainError::store(format!("removing {}: {e}", path.display()))),
    }
}

#[async_trait]
impl MediaStorage for LocalMediaStorage {
    async fn delete(&self, sha1: &str, file_type: u8, thumb_type: u8) -> DomainResult<()> {
        if file_type != NO_FILE {
            remove_if_exists(&self.sharded_path("src", sha1, file_type)?).await?;
        }
        if thumb_type != NO_FILE {
            remove_if_exists(&self.sharded_path("thumb", sha1, thumb_type)?).await?;
        }
        tracing::debug!(sha1, "Deleted media assets");
        Ok(())
    }
}
