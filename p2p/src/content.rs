use crate::errors::ContentError;
use async_trait::async_trait;
use log::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Longest hash we accept as a content key.
const MAX_HASH_LEN: usize = 128;

/// Local content lookup by hash.
///
/// Implementations must only consult local state. The inbound handler answers remote peers with whatever this returns,
/// and a lookup that went back out to the network would let two peers bounce the same request between each other.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    async fn fetch_local(&self, hash: &str, timeout: Duration) -> Result<Option<Vec<u8>>, ContentError>;
}

/// Content hashes double as file names, so only plain alphanumeric keys are allowed.
pub fn validate_hash(hash: &str) -> Result<(), ContentError> {
    if hash.is_empty() || hash.len() > MAX_HASH_LEN || !hash.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ContentError::InvalidHash(hash.to_string()));
    }
    Ok(())
}

/// A directory of content files, one file per hash.
pub struct FileContentStore {
    root: PathBuf,
}

impl FileContentStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, std::io::Error> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn store(&self, hash: &str, content: &[u8]) -> Result<(), ContentError> {
        validate_hash(hash)?;
        let path = self.root.join(hash);
        let partial = self.root.join(format!(".{hash}.partial"));
        tokio::fs::write(&partial, content).await?;
        tokio::fs::rename(&partial, &path).await?;
        trace!("Stored {} bytes under {hash}", content.len());
        Ok(())
    }
}

#[async_trait]
impl ContentStore for FileContentStore {
    async fn fetch_local(&self, hash: &str, timeout: Duration) -> Result<Option<Vec<u8>>, ContentError> {
        validate_hash(hash)?;
        let path = self.root.join(hash);
        match tokio::time::timeout(timeout, tokio::fs::read(&path)).await {
            Ok(Ok(content)) => Ok(Some(content)),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                debug!("Reading {hash} took longer than {timeout:?}");
                Ok(None)
            }
        }
    }
}

/// Content held in memory. Cheap to clone; clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    items: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, hash: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.items.write().await.insert(hash.into(), content.into());
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn fetch_local(&self, hash: &str, _timeout: Duration) -> Result<Option<Vec<u8>>, ContentError> {
        Ok(self.items.read().await.get(hash).cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContentStore::new(dir.path().join("content")).expect("directory to exist");
        assert_eq!(store.fetch_local("abc123", TIMEOUT).await.unwrap(), None);
        store.store("abc123", b"some bytes").await.unwrap();
        assert_eq!(store.fetch_local("abc123", TIMEOUT).await.unwrap(), Some(b"some bytes".to_vec()));
        assert!(!store.root().join(".abc123.partial").exists());
    }

    #[tokio::test]
    async fn path_like_hashes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContentStore::new(dir.path()).unwrap();
        for bad in ["", "../secret", "a/b", ".hidden", "x y"] {
            assert!(matches!(store.fetch_local(bad, TIMEOUT).await, Err(ContentError::InvalidHash(_))), "{bad}");
            assert!(store.store(bad, b"x").await.is_err(), "{bad}");
        }
        assert!(validate_hash(&"a".repeat(MAX_HASH_LEN)).is_ok());
        assert!(validate_hash(&"a".repeat(MAX_HASH_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn memory_store_shares_contents_between_clones() {
        let store = MemoryContentStore::new();
        let clone = store.clone();
        clone.insert("abc", b"x".to_vec()).await;
        assert_eq!(store.fetch_local("abc", TIMEOUT).await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(store.len().await, 1);
    }
}
