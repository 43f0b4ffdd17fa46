//! Key-value SPI and the file-backed implementation.
//!
//! Keys are path-structured (`lsat/proxy/secrets/<id>`). The file backend
//! maps them straight onto the data directory and leans on the filesystem
//! for atomicity: plain writes go through a temp file plus rename, and
//! create-exclusive writes go through a temp file plus hard link so two
//! racing writers cannot both win.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore as _;
use thiserror::Error;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    AlreadyExists,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;
    /// Like `put`, but fails with `AlreadyExists` instead of overwriting.
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<(), KvError>;
    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

#[async_trait]
impl<S: KvStore + ?Sized> KvStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        (**self).put(key, value).await
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        (**self).put_if_absent(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        (**self).delete(key).await
    }
}

/// In-memory store for tests and throwaway deployments.
#[derive(Default)]
pub struct MemKvStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemKvStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        self.inner
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or(KvError::NotFound)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.inner
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(key) {
            return Err(KvError::AlreadyExists);
        }
        inner.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.lock().await.remove(key);
        Ok(())
    }
}

/// File-backed store rooted at a data directory.
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, KvError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| KvError::Unavailable(format!("create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(KvError::Unavailable(format!("invalid key: {key}")));
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn write_temp(&self, value: &[u8]) -> Result<PathBuf, KvError> {
        let mut suffix = [0u8; 8];
        rand::rng().fill_bytes(&mut suffix);
        let tmp = self.root.join(format!(".tmp-{}", hex::encode(suffix)));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        file.write_all(value)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(tmp)
    }

    async fn ensure_parent(path: &Path) -> Result<(), KvError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KvError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(KvError::NotFound),
            Err(e) => Err(KvError::Unavailable(e.to_string())),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        let tmp = self.write_temp(value).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        let tmp = self.write_temp(value).await?;
        let result = match tokio::fs::hard_link(&tmp, &path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(KvError::AlreadyExists),
            Err(e) => Err(KvError::Unavailable(e.to_string())),
        };
        let _ = tokio::fs::remove_file(&tmp).await;
        result
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KvError::Unavailable(e.to_string())),
        }
    }
}
