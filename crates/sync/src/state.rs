use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const PROJECTS_DIR_NAME: &str = "projects";
const STATE_FILE_NAME: &str = "state.json";
const CONTEXT_CACHE_FILE_NAME: &str = "project_context.txt";
const CONTENT_STORE_DIR_NAME: &str = "context_store";
const SNAPSHOTS_DIR_NAME: &str = "snapshots";
const SESSION_LOCK_FILE_NAME: &str = "session.lock";

/// State record shared by the sync engine, the transcript flows and the poller.
///
/// Holding the guard is holding control of the two remote documents.
pub type SharedState = Arc<Mutex<StateRecord>>;

#[must_use]
pub fn shared(state: StateRecord) -> SharedState {
    Arc::new(Mutex::new(state))
}

/// Persisted per-project record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub project_path: PathBuf,
    /// Newest file mtime (unix ms) seen by the last scan that found the context up to date.
    pub last_modified: u64,
    /// Hash of the bytes last written to the context document.
    pub content_hash: Option<String>,
    pub context_document_id: Option<String>,
    pub transcript_document_id: Option<String>,
    #[serde(default)]
    pub monitor_active: bool,
    #[serde(default)]
    pub context_scope: Option<PathBuf>,
    /// Count of remote writes issued by this process; never persisted.
    #[serde(skip)]
    remote_writes: u64,
}

impl StateRecord {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            last_modified: 0,
            content_hash: None,
            context_document_id: None,
            transcript_document_id: None,
            monitor_active: false,
            context_scope: None,
            remote_writes: 0,
        }
    }

    /// Directory the context is generated from.
    #[must_use]
    pub fn scan_root(&self) -> PathBuf {
        match &self.context_scope {
            Some(scope) => self.project_path.join(scope),
            None => self.project_path.clone(),
        }
    }

    pub fn context_id(&self) -> Result<&str> {
        self.context_document_id
            .as_deref()
            .ok_or(SyncError::MissingDocumentId("context"))
    }

    pub fn transcript_id(&self) -> Result<&str> {
        self.transcript_document_id
            .as_deref()
            .ok_or(SyncError::MissingDocumentId("transcript"))
    }

    /// Record a remote write made while holding control of the documents.
    pub fn note_remote_write(&mut self) {
        self.remote_writes = self.remote_writes.wrapping_add(1);
    }

    #[must_use]
    pub fn remote_writes(&self) -> u64 {
        self.remote_writes
    }
}

/// Stable identifier of a project: sha256 of its canonical path, 16 hex chars.
#[must_use]
pub fn project_id(project_path: &Path) -> String {
    let canonical = project_path
        .canonicalize()
        .unwrap_or_else(|_| project_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// On-disk layout of one project's local state.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    dir: PathBuf,
}

impl ProjectLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<home>/projects/<project_id>`
    #[must_use]
    pub fn for_project(home: &Path, project_path: &Path) -> Self {
        Self::new(
            home.join(PROJECTS_DIR_NAME)
                .join(project_id(project_path)),
        )
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    #[must_use]
    pub fn context_cache_path(&self) -> PathBuf {
        self.dir.join(CONTEXT_CACHE_FILE_NAME)
    }

    #[must_use]
    pub fn content_store_dir(&self) -> PathBuf {
        self.dir.join(CONTENT_STORE_DIR_NAME)
    }

    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir.join(SNAPSHOTS_DIR_NAME)
    }

    #[must_use]
    pub fn session_lock_path(&self) -> PathBuf {
        self.dir.join(SESSION_LOCK_FILE_NAME)
    }

    pub async fn load_state(&self) -> Result<Option<StateRecord>> {
        let path = self.state_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_state(&self, state: &StateRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.state_path(), &bytes).await
    }

    pub async fn read_context_cache(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.context_cache_path()).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn write_context_cache(&self, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.context_cache_path(), bytes).await
    }
}

/// Write to `<path>.tmp`, then rename over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
