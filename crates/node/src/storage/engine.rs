//! The local content-addressed blob store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

/// Write-once key/value storage of raw blobs keyed by their hash.
/// Concurrent writers of the same hash are idempotent by construction.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn read(&self, filename: &str) -> std::io::Result<Option<Vec<u8>>>;
    async fn write(&self, filename: &str, content: &[u8]) -> std::io::Result<()>;
    async fn delete(&self, filename: &str) -> std::io::Result<()>;
    async fn exists(&self, filename: &str) -> std::io::Result<bool>;
}

pub struct FileSystemStorageEngine {
    folder: PathBuf,
}

impl FileSystemStorageEngine {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        FileSystemStorageEngine {
            folder: folder.into(),
        }
    }

    fn path_of(&self, filename: &str) -> PathBuf {
        self.folder.join(filename)
    }
}

#[async_trait]
impl StorageEngine for FileSystemStorageEngine {
    async fn read(&self, filename: &str) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_of(filename)).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write(&self, filename: &str, content: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.folder).await?;
        // Write to a temporary name then rename, so a concurrent reader
        // never observes a partial blob.
        let final_path = self.path_of(filename);
        let tmp_path = self.folder.join(format!("{filename}.tmp"));
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn delete(&self, filename: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.path_of(filename)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn exists(&self, filename: &str) -> std::io::Result<bool> {
        Ok(tokio::fs::try_exists(self.path_of(filename)).await?)
    }
}

impl FileSystemStorageEngine {
    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

/// In-memory engine for tests.
#[derive(Default)]
pub struct MemoryStorageEngine {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageEngine for MemoryStorageEngine {
    async fn read(&self, filename: &str) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.files.read().unwrap().get(filename).cloned())
    }

    async fn write(&self, filename: &str, content: &[u8]) -> std::io::Result<()> {
        self.files
            .write()
            .unwrap()
            .insert(filename.to_string(), content.to_vec());
        Ok(())
    }

    async fn delete(&self, filename: &str) -> std::io::Result<()> {
        self.files.write().unwrap().remove(filename);
        Ok(())
    }

    async fn exists(&self, filename: &str) -> std::io::Result<bool> {
        Ok(self.files.read().unwrap().contains_key(filename))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn filesystem_engine_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileSystemStorageEngine::new(dir.path());

        assert!(engine.read("cafebabe").await.unwrap().is_none());
        engine.write("cafebabe", b"content").await.unwrap();
        assert!(engine.exists("cafebabe").await.unwrap());
        assert_eq!(engine.read("cafebabe").await.unwrap().unwrap(), b"content");

        // Rewrites of the same hash are idempotent.
        engine.write("cafebabe", b"content").await.unwrap();

        engine.delete("cafebabe").await.unwrap();
        assert!(!engine.exists("cafebabe").await.unwrap());
        // Deleting a missing blob is not an error.
        engine.delete("cafebabe").await.unwrap();
    }
}
