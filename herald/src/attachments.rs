//! Attachment storage.
//!
//! Notification records only keep attachment metadata and a storage path.
//! The bytes live in an [`AttachmentStore`].

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

/// Binary attachment storage.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Storage provider name recorded on attachment rows.
    fn provider(&self) -> &str;

    async fn upload(&self, path: &str, data: Bytes) -> Result<()>;
    async fn download(&self, path: &str) -> Result<Bytes>;
    /// Deleting a missing object succeeds.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Attachment store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalAttachmentStore {
    root: PathBuf,
}

impl LocalAttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a storage path under the root, rejecting anything that could
    /// escape it.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::validation(format!(
                "invalid attachment path '{path}'"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl AttachmentStore for LocalAttachmentStore {
    fn provider(&self) -> &str {
        "local"
    }

    async fn upload(&self, path: &str, data: Bytes) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;
        debug!("Stored attachment {} ({} bytes)", path, data.len());
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Bytes> {
        let target = self.resolve(path)?;
        let data = tokio::fs::read(&target).await?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_download_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalAttachmentStore::new(dir.path());

        store
            .upload("invoices/2024/a.pdf", Bytes::from_static(b"%PDF"))
            .await
            .unwrap();
        let data = store.download("invoices/2024/a.pdf").await.unwrap();
        assert_eq!(&data[..], b"%PDF");

        store.delete("invoices/2024/a.pdf").await.unwrap();
        assert!(store.download("invoices/2024/a.pdf").await.is_err());
        // Second delete is a no-op.
        store.delete("invoices/2024/a.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalAttachmentStore::new(dir.path());

        for path in ["../secret", "/etc/passwd", "a/../../b", ""] {
            let err = store.download(path).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "path {path:?}");
        }
    }
}
