//! Blob stores for uploaded document bytes.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use underwrite_core::{BlobStore, Error, Result};

/// Filesystem blob store rooted at `BLOB_ROOT`.
///
/// Locators are relative paths under the root. Absolute paths and `..`
/// components are rejected.
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let relative = Path::new(locator);
        let safe = !locator.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(Error::InvalidInput(format!(
                "storage locator escapes blob root: {}",
                locator
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        let path = self.resolve(locator)?;
        match fs::read(&path).await {
            Ok(data) => {
                debug!(subsystem = "db", component = "blob", locator, size = data.len(), "blob read");
                Ok(data)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {}", locator)))
            }
            Err(e) => {
                warn!(subsystem = "db", component = "blob", locator, error = %e, "blob read failed");
                Err(Error::Storage(format!("read {}: {}", locator, e)))
            }
        }
    }

    async fn put(&self, locator: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(locator)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file, then rename into place.
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await?;

        debug!(subsystem = "db", component = "blob", locator, size = data.len(), "blob written");
        Ok(())
    }
}

/// In-memory blob store with transient-failure injection for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    failing_reads: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` reads fail with `Error::Storage`.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        if self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Storage(format!("injected read failure for {}", locator)));
        }
        self.blobs
            .read()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {}", locator)))
    }

    async fn put(&self, locator: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert(locator.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());

        store.put("loans/2024/w2.pdf", b"%PDF-1.7").await.unwrap();
        assert_eq!(store.get("loans/2024/w2.pdf").await.unwrap(), b"%PDF-1.7");
        assert!(!dir.path().join("loans/2024/w2.tmp").exists());
    }

    #[tokio::test]
    async fn test_filesystem_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        assert!(matches!(
            store.get("nope.pdf").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_filesystem_rejects_escaping_locators() {
        let store = FilesystemBlobStore::new("/srv/blobs");
        for locator in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(store.get(locator).await, Err(Error::InvalidInput(_))),
                "{locator} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_memory_injected_failures_are_transient() {
        let store = MemoryBlobStore::new();
        store.put("a.pdf", b"data").await.unwrap();
        store.fail_next_reads(2);

        assert!(matches!(store.get("a.pdf").await, Err(Error::Storage(_))));
        assert!(matches!(store.get("a.pdf").await, Err(Error::Storage(_))));
        assert_eq!(store.get("a.pdf").await.unwrap(), b"data");
    }
}
