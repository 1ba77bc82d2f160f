use crate::config::StorageConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Write-only storage for image payloads
///
/// Returned paths are opaque to callers and relative to the store root.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store an image and return its storage path
    async fn put(&self, stream_id: i64, captured_at: DateTime<Utc>, data: &[u8]) -> Result<String>;

    /// Remove a previously stored image
    async fn delete(&self, storage_path: &str) -> Result<()>;

    /// Remove every image of a stream
    async fn purge_stream(&self, stream_id: i64) -> Result<()>;
}

/// Filesystem blob store, one directory per stream
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_root(&config.root)
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the root directory exists
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create blob root {}", self.root.display()))?;
        info!(root = %self.root.display(), "Blob store ready");
        Ok(())
    }

    /// Directory holding every image of a stream
    pub fn stream_dir(stream_id: i64) -> String {
        format!("user_{}", stream_id)
    }

    /// Generate the storage path for a frame
    /// Format: user_{stream_id}/{YYYYmmddHHMMSSffffff}.{ext}
    pub fn generate_path(stream_id: i64, captured_at: DateTime<Utc>, data: &[u8]) -> String {
        format!(
            "{dir}/{timestamp}.{ext}",
            dir = Self::stream_dir(stream_id),
            timestamp = captured_at.format("%Y%m%d%H%M%S%6f"),
            ext = file_extension(data)
        )
    }

    fn resolve(&self, storage_path: &str) -> Result<PathBuf> {
        let relative = Path::new(storage_path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            anyhow::bail!("Rejected storage path outside the blob root: {}", storage_path);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(&self, stream_id: i64, captured_at: DateTime<Utc>, data: &[u8]) -> Result<String> {
        let storage_path = Self::generate_path(stream_id, captured_at, data);
        let full_path = self.resolve(&storage_path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let mut file = fs::File::create(&full_path)
            .await
            .with_context(|| format!("Failed to create {}", full_path.display()))?;
        file.write_all(data).await.context("Failed to write image")?;
        file.sync_all().await.context("Failed to sync image")?;

        debug!(storage_path = %storage_path, "Image written");
        Ok(storage_path)
    }

    #[instrument(skip(self))]
    async fn delete(&self, storage_path: &str) -> Result<()> {
        let full_path = self.resolve(storage_path)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", full_path.display())),
        }
    }

    #[instrument(skip(self))]
    async fn purge_stream(&self, stream_id: i64) -> Result<()> {
        let dir = self.resolve(&Self::stream_dir(stream_id))?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(stream_id, "Removed stream images");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }
}

/// File extension for an encoded image, sniffed from its magic bytes
pub fn file_extension(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(image::ImageFormat::Png) => "png",
        Ok(image::ImageFormat::Jpeg) => "jpg",
        Ok(image::ImageFormat::WebP) => "webp",
        Ok(image::ImageFormat::Gif) => "gif",
        Ok(image::ImageFormat::Bmp) => "bmp",
        _ => "bin",
    }
}

/// Get content type for a stored file extension
pub fn content_type(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0];

    #[test]
    fn test_generate_path() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        assert_eq!(
            FilesystemBlobStore::generate_path(7, at, JPEG_MAGIC),
            "user_7/20240115103045000000.jpg"
        );
        assert_eq!(
            FilesystemBlobStore::generate_path(7, at, b"garbage"),
            "user_7/20240115103045000000.bin"
        );
    }

    #[test]
    fn test_file_extension_and_content_type() {
        assert_eq!(file_extension(PNG_MAGIC), "png");
        assert_eq!(file_extension(JPEG_MAGIC), "jpg");
        assert_eq!(content_type("jpg"), "image/jpeg");
        assert_eq!(content_type("PNG"), "image/png");
        assert_eq!(content_type("unknown"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_put_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::with_root(dir.path());
        store.initialize().await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();

        let path = store.put(3, at, JPEG_MAGIC).await.unwrap();
        let full = dir.path().join(&path);
        assert_eq!(std::fs::read(&full).unwrap(), JPEG_MAGIC);

        store.delete(&path).await.unwrap();
        assert!(!full.exists());

        // Deleting twice is fine
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_stream_leaves_other_streams() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::with_root(dir.path());
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();

        let gone = store.put(3, at, JPEG_MAGIC).await.unwrap();
        let kept = store.put(4, at, JPEG_MAGIC).await.unwrap();

        store.purge_stream(3).await.unwrap();
        assert!(!dir.path().join(&gone).exists());
        assert!(!dir.path().join("user_3").exists());
        assert!(dir.path().join(&kept).exists());

        // Nothing left to remove
        store.purge_stream(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::with_root(dir.path());

        assert!(store.delete("../outside.jpg").await.is_err());
        assert!(store.delete("/etc/passwd").await.is_err());
    }
}
