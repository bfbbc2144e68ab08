use async_trait::async_trait;
use std::io;
use std::path::Path;

/// Filesystem operations the hashing core is allowed to perform.
///
/// Only the frame-extraction scratch directory goes through this; media files
/// themselves are read directly by the hash service.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn create_directory(&self, path: &Path) -> io::Result<()>;

    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    async fn delete(&self, path: &Path) -> io::Result<()>;

    async fn delete_directory(&self, path: &Path) -> io::Result<()>;
}

/// `FileSystem` backed by the local disk through `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn create_directory(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn delete(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn delete_directory(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
