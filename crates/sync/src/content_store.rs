use crate::state::write_atomic;
use crate::{Result, SyncError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const ENTRY_EXT: &str = "txt";

/// Lowercase hex sha256 of `bytes`.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Content-addressed cache of context blobs that were pushed at some point.
///
/// Entries are immutable: storing different bytes under an existing hash is
/// a [`SyncError::HashCollision`], never an overwrite.
#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.{ENTRY_EXT}"))
    }

    pub async fn contains(&self, hash: &str) -> bool {
        tokio::fs::try_exists(self.entry_path(hash))
            .await
            .unwrap_or(false)
    }

    /// Store `bytes` and return their hash.
    pub async fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = hash_bytes(bytes);
        self.put_with_hash(&hash, bytes).await?;
        Ok(hash)
    }

    /// Store `bytes` under a hash computed elsewhere, verifying it matches.
    pub async fn put_with_hash(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        if hash_bytes(bytes) != hash {
            return Err(SyncError::HashCollision {
                hash: hash.to_string(),
            });
        }
        if let Some(existing) = self.get(hash).await? {
            if existing != bytes {
                return Err(SyncError::HashCollision {
                    hash: hash.to_string(),
                });
            }
            return Ok(());
        }
        write_atomic(&self.entry_path(hash), bytes).await?;
        log::debug!("stored context {hash} ({} bytes)", bytes.len());
        Ok(())
    }

    /// Bytes stored under `hash`, verified against the hash on read.
    pub async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let bytes = match tokio::fs::read(self.entry_path(hash)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if hash_bytes(&bytes) != hash {
            return Err(SyncError::HashCollision {
                hash: hash.to_string(),
            });
        }
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn hash_is_deterministic_sha256_hex() {
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn put_then_get_returns_identical_bytes() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());

        let hash = store.put(b"tree\nmain.py").await.unwrap();
        assert!(store.contains(&hash).await);
        assert_eq!(
            store.get(&hash).await.unwrap(),
            Some(b"tree\nmain.py".to_vec())
        );

        // second put is a no-op
        assert_eq!(store.put(b"tree\nmain.py").await.unwrap(), hash);
        assert_eq!(store.get("0000").await.unwrap(), None);
    }

    #[tokio::test]
    async fn tampered_entry_is_a_collision() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let hash = store.put(b"original").await.unwrap();

        std::fs::write(dir.path().join(format!("{hash}.txt")), b"changed").unwrap();

        assert!(matches!(
            store.get(&hash).await,
            Err(SyncError::HashCollision { .. })
        ));
        assert!(matches!(
            store.put_with_hash(&hash, b"original").await,
            Err(SyncError::HashCollision { .. })
        ));
    }

    #[tokio::test]
    async fn mismatched_hash_is_rejected() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let err = store.put_with_hash("deadbeef", b"bytes").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConsistencyHashCollision);
        assert!(!store.contains("deadbeef").await);
    }
}
