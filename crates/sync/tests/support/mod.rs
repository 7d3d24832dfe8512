#![allow(dead_code)]

use async_trait::async_trait;
use context_sync::{
    DocumentStore, LocalDocumentStore, ProjectLayout, RemoteError, RemoteMetadata, RemoteResult,
    StateRecord, SyncEngine, TreeContextSource,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Local store that counts writes and can refuse updates to, or downloads of, one document.
pub struct CountingStore {
    inner: LocalDocumentStore,
    writes: AtomicUsize,
    reject_updates_to: Mutex<Option<String>>,
    reject_reads_of: Mutex<Option<String>>,
}

impl CountingStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reject_updates_to(&self, id: Option<&str>) {
        *self.reject_updates_to.lock().expect("reject lock") = id.map(str::to_string);
    }

    pub fn reject_reads_of(&self, id: Option<&str>) {
        *self.reject_reads_of.lock().expect("reject lock") = id.map(str::to_string);
    }

    /// Write behind the session's back, like a user editing in the web UI.
    pub async fn external_update(&self, id: &str, bytes: &[u8], mime: &str) {
        self.inner.update(id, bytes, mime).await.expect("external update");
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn get_metadata(&self, id: &str) -> RemoteResult<RemoteMetadata> {
        self.inner.get_metadata(id).await
    }

    async fn get_content(&self, id: &str) -> RemoteResult<Vec<u8>> {
        let rejected = self.reject_reads_of.lock().expect("reject lock").clone();
        if rejected.as_deref() == Some(id) {
            return Err(RemoteError::Transfer("connection reset mid-download".to_string()));
        }
        self.inner.get_content(id).await
    }

    async fn create(
        &self,
        parent_id: &str,
        name: &str,
        bytes: &[u8],
        mime: &str,
    ) -> RemoteResult<String> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.create(parent_id, name, bytes, mime).await
    }

    async fn update(&self, id: &str, bytes: &[u8], mime: &str) -> RemoteResult<()> {
        let rejected = self.reject_updates_to.lock().expect("reject lock").clone();
        if rejected.as_deref() == Some(id) {
            return Err(RemoteError::Remote("quota exceeded".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(id, bytes, mime).await
    }

    async fn find_by_name(&self, name: &str, parent_id: &str) -> RemoteResult<Option<String>> {
        self.inner.find_by_name(name, parent_id).await
    }
}

pub struct Fixture {
    pub home: TempDir,
    pub remote: TempDir,
    pub project: TempDir,
    pub store: Arc<CountingStore>,
    pub layout: ProjectLayout,
    pub engine: SyncEngine,
}

impl Fixture {
    pub async fn new() -> Self {
        let home = TempDir::new().expect("home");
        let remote = TempDir::new().expect("remote");
        let project = TempDir::new().expect("project");
        std::fs::write(project.path().join("main.py"), "print('hello')\n").expect("main.py");

        let store = Arc::new(CountingStore {
            inner: LocalDocumentStore::open(remote.path())
                .await
                .expect("open store"),
            writes: AtomicUsize::new(0),
            reject_updates_to: Mutex::new(None),
            reject_reads_of: Mutex::new(None),
        });
        let layout = ProjectLayout::for_project(home.path(), project.path());
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(TreeContextSource),
            layout.clone(),
            "AI Studio",
        );
        Self {
            home,
            remote,
            project,
            store,
            layout,
            engine,
        }
    }

    pub async fn bootstrap(&self) -> StateRecord {
        self.engine
            .bootstrap_project(self.project.path())
            .await
            .expect("bootstrap")
    }

    pub fn dyn_store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }
}

/// Set a file's mtime `secs` seconds into the future.
pub fn touch_ahead(path: &Path, secs: u64) {
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .expect("open for touch");
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .expect("set mtime");
}
