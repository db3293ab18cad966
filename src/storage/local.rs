use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use tokio::fs;

use crate::storage::{StorageBackend, StorageError, StoredObject};

/// Stores artifacts in a directory tree, e.g. a mounted network share.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        LocalStorage { root }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !plain {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn collect(root: &Path, dir: &Path, objects: &mut Vec<StoredObject>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let path = entry.path();
        if metadata.is_dir() {
            collect(root, &path, objects)?;
        } else if metadata.is_file() {
            let key = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            objects.push(StoredObject {
                key,
                size: metadata.len(),
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let copied = fs::copy(local, &target).await?;
        debug!("Copied {} bytes to {}", copied, target.display());
        Ok(key.to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.resolve(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StoredObject>, StorageError> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let mut objects = tokio::task::spawn_blocking(move || {
            let mut objects = Vec::new();
            collect(&root, &root, &mut objects).map(|_| objects)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        if let Some(prefix) = prefix {
            objects.retain(|o| o.key.starts_with(prefix));
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    /// Local files have no signed links; the absolute `file://` URL is returned
    /// and the expiry is ignored.
    async fn presign(&self, key: &str, _expires_in: Duration) -> Result<String, StorageError> {
        let path = self.resolve(key)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let absolute = fs::canonicalize(&path).await?;
        Ok(format!("file://{}", absolute.display()))
    }

    async fn check(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).await?;
        let metadata = fs::metadata(&self.root).await?;
        if metadata.permissions().readonly() {
            return Err(StorageError::Rejected {
                operation: "check",
                message: format!("{} is read-only", self.root.display()),
            });
        }
        Ok(())
    }
}
