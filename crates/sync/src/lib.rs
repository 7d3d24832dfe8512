//! # Context Sync
//!
//! Keeps a generated project context and a remote chat transcript consistent,
//! with a local history of every transcript state that can be restored.
//!
//! ## Pieces
//!
//! ```text
//! Project directory
//!     │
//!     ├──> File Scanner (.gitignore / .contextignore aware)
//!     │      └─> Context text + sha256
//!     │
//!     ├──> Sync Engine ──> context document (push only on new hash)
//!     │
//!     ├──> Snapshot Manager (poller)
//!     │      ├─> Content Store  context_store/<hash>.txt
//!     │      └─> snapshots/<id>/{info.json, transcript.bin}
//!     │
//!     └──> Transcript Editor ──> transcript document
//! ```
//!
//! All of them share one [`StateRecord`] behind a [`SharedState`] mutex; whoever
//! holds the guard controls the two remote documents.
//!
//! ## Example
//!
//! ```no_run
//! use context_sync::{
//!     shared, LocalDocumentStore, ProjectLayout, SyncEngine, TreeContextSource,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let project = Path::new("/path/to/project");
//!     let layout = ProjectLayout::for_project(Path::new("/tmp/pc-home"), project);
//!     let store = Arc::new(LocalDocumentStore::open("/tmp/pc-remote").await?);
//!     let engine = SyncEngine::new(store, Arc::new(TreeContextSource), layout.clone(), "AI Studio");
//!
//!     let state = match layout.load_state().await? {
//!         Some(state) => state,
//!         None => engine.bootstrap_project(project).await?,
//!     };
//!     let state = shared(state);
//!
//!     let mut guard = state.lock().await;
//!     let outcome = engine.synchronize(&mut guard).await?;
//!     layout.save_state(&guard).await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

mod config;
mod content_store;
mod context_gen;
mod engine;
mod error;
mod git;
mod local_store;
mod media;
mod remote;
mod scanner;
mod session_lock;
mod snapshot;
mod state;
mod transcript_ops;

pub use config::{MonitorConfig, SyncConfig};
pub use content_store::{hash_bytes, ContentStore};
pub use context_gen::{
    setup_prompt, ContextSource, GeneratedContext, TreeContextSource, CONTEXT_PROMPT_FILE,
    DEFAULT_SETUP_PROMPT, DEFAULT_SETUP_RESPONSE,
};
pub use engine::{AnnotationUpdate, SyncEngine, SyncOutcome};
pub use error::{ErrorKind, Result, StructuralViolation, SyncError};
pub use git::{commit_request_text, request_commit_message, staged_diff, CommitRequest};
pub use local_store::LocalDocumentStore;
pub use media::{extract_image_refs, image_mime, inject_images, resolve_image, ImageInjection, ImageRef};
pub use remote::{
    DocumentStore, RemoteError, RemoteMetadata, RemoteResult, RetryPolicy, RetryingStore,
    CONTEXT_MIME, FOLDER_MIME, ROOT_PARENT,
};
pub use scanner::{FileScanner, ScannedFile, CONTEXT_IGNORE_FILE};
pub use session_lock::SessionLock;
pub use snapshot::{Observation, SnapshotInfo, SnapshotManager};
pub use state::{project_id, shared, ProjectLayout, SharedState, StateRecord};
pub use transcript_ops::{EditReport, TranscriptEditor};
