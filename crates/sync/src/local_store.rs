use crate::remote::{DocumentStore, RemoteError, RemoteMetadata, RemoteResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

const CONTENT_EXT: &str = "bin";
const META_EXT: &str = "json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMeta {
    id: String,
    name: String,
    parent: String,
    mime: String,
    revision: u64,
    modified_unix_ms: u64,
}

impl StoredMeta {
    fn marker(&self) -> String {
        format!("{}-r{}", self.modified_unix_ms, self.revision)
    }
}

/// Directory-backed document store.
///
/// Each document is `<id>.bin` plus `<id>.json` metadata. Every write bumps a
/// revision so the modified marker changes even for writes within the same millisecond.
pub struct LocalDocumentStore {
    root: PathBuf,
    seq: AtomicU64,
}

impl LocalDocumentStore {
    pub async fn open(root: impl AsRef<Path>) -> RemoteResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| RemoteError::Remote(format!("open {}: {e}", root.display())))?;
        Ok(Self {
            root,
            seq: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn content_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.{CONTENT_EXT}"))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.{META_EXT}"))
    }

    fn next_id(&self, parent_id: &str, name: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(parent_id.as_bytes());
        hasher.update(name.as_bytes());
        hasher.update(unix_now_ms().to_be_bytes());
        hasher.update(seq.to_be_bytes());
        hasher.update(std::process::id().to_be_bytes());
        let digest = hasher.finalize();
        digest[..12].iter().map(|b| format!("{b:02x}")).collect()
    }

    async fn read_meta(&self, id: &str) -> RemoteResult<StoredMeta> {
        let path = self.meta_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RemoteError::NotFound(id.to_string()))
            }
            Err(err) => return Err(RemoteError::Transfer(format!("read {id}: {err}"))),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::Remote(format!("corrupt metadata for {id}: {e}")))
    }

    async fn write_document(&self, meta: &StoredMeta, bytes: &[u8]) -> RemoteResult<()> {
        let content = self.content_path(&meta.id);
        write_atomic(&content, bytes).await?;
        let meta_bytes = serde_json::to_vec_pretty(meta)
            .map_err(|e| RemoteError::Remote(format!("encode metadata: {e}")))?;
        write_atomic(&self.meta_path(&meta.id), &meta_bytes).await
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn get_metadata(&self, id: &str) -> RemoteResult<RemoteMetadata> {
        let meta = self.read_meta(id).await?;
        Ok(RemoteMetadata {
            modified_marker: meta.marker(),
            id: meta.id,
            name: meta.name,
        })
    }

    async fn get_content(&self, id: &str) -> RemoteResult<Vec<u8>> {
        self.read_meta(id).await?;
        fs::read(self.content_path(id))
            .await
            .map_err(|e| RemoteError::Transfer(format!("download {id}: {e}")))
    }

    async fn create(
        &self,
        parent_id: &str,
        name: &str,
        bytes: &[u8],
        mime: &str,
    ) -> RemoteResult<String> {
        let meta = StoredMeta {
            id: self.next_id(parent_id, name),
            name: name.to_string(),
            parent: parent_id.to_string(),
            mime: mime.to_string(),
            revision: 1,
            modified_unix_ms: unix_now_ms(),
        };
        self.write_document(&meta, bytes).await?;
        log::debug!("created remote document {} ({name})", meta.id);
        Ok(meta.id)
    }

    async fn update(&self, id: &str, bytes: &[u8], mime: &str) -> RemoteResult<()> {
        let mut meta = self.read_meta(id).await?;
        meta.revision += 1;
        meta.mime = mime.to_string();
        meta.modified_unix_ms = unix_now_ms();
        self.write_document(&meta, bytes).await
    }

    async fn find_by_name(&self, name: &str, parent_id: &str) -> RemoteResult<Option<String>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| RemoteError::Transfer(format!("list {}: {e}", self.root.display())))?;
        let mut matches = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RemoteError::Transfer(format!("list: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            let Ok(bytes) = fs::read(&path).await else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<StoredMeta>(&bytes) else {
                continue;
            };
            if meta.name == name && meta.parent == parent_id {
                matches.push(meta);
            }
        }
        matches.sort_by_key(|m| m.modified_unix_ms);
        Ok(matches.pop().map(|m| m.id))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> RemoteResult<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| RemoteError::Transfer(format!("write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| RemoteError::Transfer(format!("commit {}: {e}", path.display())))
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
