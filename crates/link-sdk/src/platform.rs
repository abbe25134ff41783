//! Platform capabilities handed to the link at construction.
//!
//! Instead of a process-wide "current platform", a [`Platform`] bundle is
//! built once at startup and passed to the [`Link`](crate::link::Link).
//! Logging goes through `tracing`, so the bundle carries storage and the
//! HTTP client used for the handshake.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::Result;

/// File-like async storage for key and node snapshots.
///
/// Names are storage-relative (`"keys/dslink.keys"`, `"nodes.json"`).
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn exists(&self, name: &str) -> bool;
    async fn read(&self, name: &str) -> Result<String>;
    /// Replace the contents of `name`, creating it if needed.
    async fn write(&self, name: &str, contents: &str) -> Result<()>;
    /// Create an empty entry (and any missing parents).
    async fn create(&self, name: &str) -> Result<()>;
}

/// [`Storage`] over a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.resolve(name))
            .await
            .unwrap_or(false)
    }

    async fn read(&self, name: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.resolve(name)).await?)
    }

    async fn write(&self, name: &str, contents: &str) -> Result<()> {
        let path = self.resolve(name);
        Self::ensure_parent(&path).await?;
        // Replaced atomically: readers never observe a partial file.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn create(&self, name: &str) -> Result<()> {
        let path = self.resolve(name);
        Self::ensure_parent(&path).await?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(())
    }
}

/// Capability bundle shared by every component of a link.
#[derive(Clone)]
pub struct Platform {
    pub storage: Arc<dyn Storage>,
    pub http: reqwest::Client,
}

impl Platform {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            http: reqwest::Client::new(),
        }
    }

    /// Filesystem storage rooted at `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FsStorage::new(root)))
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::local(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(!storage.exists("nested/file.json").await);

        storage.write("nested/file.json", "{\"a\":1}").await.unwrap();
        assert!(storage.exists("nested/file.json").await);
        assert_eq!(storage.read("nested/file.json").await.unwrap(), "{\"a\":1}");

        storage.write("nested/file.json", "{}").await.unwrap();
        assert_eq!(storage.read("nested/file.json").await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn create_makes_empty_entry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage.create("keys/dslink.keys").await.unwrap();
        assert!(storage.exists("keys/dslink.keys").await);
        assert_eq!(storage.read("keys/dslink.keys").await.unwrap(), "");
    }

    #[tokio::test]
    async fn read_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(matches!(
            storage.read("absent").await,
            Err(crate::types::LinkError::Io(_))
        ));
    }
}
