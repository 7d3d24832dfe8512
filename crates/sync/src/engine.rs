use crate::content_store::ContentStore;
use crate::context_gen::{setup_prompt, ContextSource, GeneratedContext, DEFAULT_SETUP_RESPONSE};
use crate::remote::{DocumentStore, CONTEXT_MIME, FOLDER_MIME, ROOT_PARENT};
use crate::scanner::FileScanner;
use crate::state::{ProjectLayout, StateRecord};
use crate::{Result, SyncError};
use context_transcript::{Block, TranscriptDocument, TRANSCRIPT_MIME};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a [`SyncEngine::synchronize`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No file newer than the last check; nothing regenerated.
    Unchanged,
    /// Files were touched but the regenerated context hashes the same.
    Touched { last_modified: u64 },
    /// New context pushed to the context document.
    Pushed {
        hash: String,
        token_estimate: u64,
        annotation: AnnotationUpdate,
        /// `false` when `project_context.txt` could not be rewritten; the content store has the bytes.
        cache_written: bool,
    },
}

/// Result of refreshing the token count shown next to the context block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationUpdate {
    Updated,
    /// The transcript has no counted block for the context document, or it already matches.
    Unchanged,
    /// Left stale; the next push corrects it.
    Failed(String),
}

/// Change detection and idempotent push of the regenerated context.
///
/// Every method that writes remotely takes the state by `&mut`, so callers
/// must hold the [`SharedState`](crate::SharedState) guard while it runs.
pub struct SyncEngine {
    store: Arc<dyn DocumentStore>,
    source: Arc<dyn ContextSource>,
    layout: ProjectLayout,
    content: ContentStore,
    remote_folder: String,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        source: Arc<dyn ContextSource>,
        layout: ProjectLayout,
        remote_folder: impl Into<String>,
    ) -> Self {
        let content = ContentStore::new(layout.content_store_dir());
        Self {
            store,
            source,
            layout,
            content,
            remote_folder: remote_folder.into(),
        }
    }

    #[must_use]
    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    #[must_use]
    pub fn content_store(&self) -> &ContentStore {
        &self.content
    }

    /// First use of a project: generate and upload the context, create the
    /// transcript that references it, and return the new state.
    pub async fn bootstrap_project(&self, project_root: &Path) -> Result<StateRecord> {
        let project_root = project_root
            .canonicalize()
            .map_err(|e| SyncError::InvalidPath(format!("{}: {e}", project_root.display())))?;
        let name = project_name(&project_root);
        log::info!("First use of {name}; creating the initial context");

        let mut state = StateRecord::new(project_root.clone());
        let generated = self.generate(state.scan_root()).await?;
        let newest = newest_mtime(state.scan_root()).await?;

        let folder = self.resolve_folder().await?;
        let context_id = self
            .store
            .create(
                &folder,
                &format!("{name}_context.txt"),
                generated.text.as_bytes(),
                CONTEXT_MIME,
            )
            .await?;
        state.note_remote_write();

        let transcript = TranscriptDocument::new(vec![
            Block::document(context_id.clone(), Some(generated.token_estimate)),
            Block::user_text(setup_prompt(&project_root)),
            Block::model_text(DEFAULT_SETUP_RESPONSE),
        ]);
        let transcript_id = self
            .store
            .create(
                &folder,
                &format!("{name}_chat.prompt"),
                &transcript.to_vec()?,
                TRANSCRIPT_MIME,
            )
            .await?;
        state.note_remote_write();

        self.content
            .put_with_hash(&generated.hash, generated.text.as_bytes())
            .await?;
        self.layout
            .write_context_cache(generated.text.as_bytes())
            .await?;

        state.context_document_id = Some(context_id);
        state.transcript_document_id = Some(transcript_id);
        state.content_hash = Some(generated.hash);
        state.last_modified = newest.unwrap_or(0);
        log::info!(
            "Created context (~{} tokens) and transcript for {name}",
            generated.token_estimate
        );
        Ok(state)
    }

    /// Push the context again if, and only if, its content changed.
    ///
    /// A failed push leaves `state` untouched so the same push is retried next time.
    pub async fn synchronize(&self, state: &mut StateRecord) -> Result<SyncOutcome> {
        let root = state.scan_root();
        let newest = match newest_mtime(root.clone()).await? {
            Some(newest) if newest > state.last_modified => newest,
            _ => {
                log::debug!("No file under {} changed since the last check", root.display());
                return Ok(SyncOutcome::Unchanged);
            }
        };

        log::info!("Project changed; regenerating context");
        let generated = self.generate(root).await?;

        if state.content_hash.as_deref() == Some(generated.hash.as_str()) {
            log::info!("Regenerated context is identical; nothing to push");
            if self.layout.read_context_cache().await?.is_none() {
                self.layout
                    .write_context_cache(generated.text.as_bytes())
                    .await?;
            }
            state.last_modified = newest;
            return Ok(SyncOutcome::Touched {
                last_modified: newest,
            });
        }

        self.push(state, generated, newest).await
    }

    /// Regenerate and push regardless of timestamps or hashes.
    pub async fn force_push(&self, state: &mut StateRecord) -> Result<SyncOutcome> {
        let root = state.scan_root();
        let generated = self.generate(root.clone()).await?;
        let newest = newest_mtime(root).await?.unwrap_or(state.last_modified);
        self.push(state, generated, newest).await
    }

    async fn push(
        &self,
        state: &mut StateRecord,
        generated: GeneratedContext,
        newest: u64,
    ) -> Result<SyncOutcome> {
        let context_id = state.context_id()?.to_string();
        // Stored first: an entry nothing references yet is harmless if the push fails.
        self.content
            .put_with_hash(&generated.hash, generated.text.as_bytes())
            .await?;
        self.store
            .update(&context_id, generated.text.as_bytes(), CONTEXT_MIME)
            .await?;
        state.note_remote_write();
        state.content_hash = Some(generated.hash.clone());
        state.last_modified = newest;
        log::info!("Context pushed ({})", short_hash(&generated.hash));

        // The remote already holds the new bytes; a stale cache must not turn this into an error.
        let cache_written = match self
            .layout
            .write_context_cache(generated.text.as_bytes())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Context pushed but the local cache was not updated: {err}");
                false
            }
        };

        let annotation = self
            .refresh_token_annotation(state, generated.token_estimate)
            .await;
        Ok(SyncOutcome::Pushed {
            hash: generated.hash,
            token_estimate: generated.token_estimate,
            annotation,
            cache_written,
        })
    }

    /// Best-effort update of the token count on the context block of the transcript.
    pub async fn refresh_token_annotation(
        &self,
        state: &mut StateRecord,
        token_estimate: u64,
    ) -> AnnotationUpdate {
        match self.try_refresh_token_annotation(state, token_estimate).await {
            Ok(true) => AnnotationUpdate::Updated,
            Ok(false) => AnnotationUpdate::Unchanged,
            Err(err) => {
                log::warn!("Token count annotation left stale: {err}");
                AnnotationUpdate::Failed(err.to_string())
            }
        }
    }

    async fn try_refresh_token_annotation(
        &self,
        state: &mut StateRecord,
        token_estimate: u64,
    ) -> Result<bool> {
        let context_id = state.context_id()?.to_string();
        let transcript_id = state.transcript_id()?.to_string();

        let bytes = self.store.get_content(&transcript_id).await?;
        let mut doc = TranscriptDocument::from_slice(&bytes)?;
        if !doc.set_document_token_count(&context_id, token_estimate) {
            return Ok(false);
        }
        self.store
            .update(&transcript_id, &doc.to_vec()?, TRANSCRIPT_MIME)
            .await?;
        state.note_remote_write();
        Ok(true)
    }

    async fn generate(&self, root: PathBuf) -> Result<GeneratedContext> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || source.generate(&root))
            .await
            .map_err(|e| SyncError::Other(format!("join context generation: {e}")))?
    }

    async fn resolve_folder(&self) -> Result<String> {
        if let Some(id) = self
            .store
            .find_by_name(&self.remote_folder, ROOT_PARENT)
            .await?
        {
            return Ok(id);
        }
        log::info!("Creating remote folder {:?}", self.remote_folder);
        Ok(self
            .store
            .create(ROOT_PARENT, &self.remote_folder, &[], FOLDER_MIME)
            .await?)
    }
}

async fn newest_mtime(root: PathBuf) -> Result<Option<u64>> {
    tokio::task::spawn_blocking(move || FileScanner::new(root).newest_mtime_ms())
        .await
        .map_err(|e| SyncError::Other(format!("join project scan: {e}")))
}

fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string())
}

pub(crate) fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_gen::TreeContextSource;
    use crate::local_store::LocalDocumentStore;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    async fn engine(home: &Path, remote: &Path, project: &Path) -> SyncEngine {
        let store = LocalDocumentStore::open(remote).await.unwrap();
        SyncEngine::new(
            Arc::new(store),
            Arc::new(TreeContextSource),
            ProjectLayout::for_project(home, project),
            "AI Studio",
        )
    }

    #[tokio::test]
    async fn bootstrap_creates_linked_documents() {
        let (home, remote, project) = (tempdir().unwrap(), tempdir().unwrap(), tempdir().unwrap());
        fs::write(project.path().join("main.py"), "print('hi')\n").unwrap();
        let engine = engine(home.path(), remote.path(), project.path()).await;

        let state = engine.bootstrap_project(project.path()).await.unwrap();

        let context_id = state.context_document_id.clone().unwrap();
        let transcript_id = state.transcript_document_id.clone().unwrap();
        let store = LocalDocumentStore::open(remote.path()).await.unwrap();
        let transcript = store.get_content(&transcript_id).await.unwrap();
        let doc = TranscriptDocument::from_slice(&transcript).unwrap();
        assert_eq!(doc.blocks().len(), 3);
        assert!(matches!(&doc.blocks()[0], Block::DocumentRef(d) if d.drive_document.id == context_id));
        assert!(doc.blocks()[2].is_model());

        let hash = state.content_hash.clone().unwrap();
        assert!(engine.content_store().contains(&hash).await);
        assert!(engine.layout().read_context_cache().await.unwrap().is_some());
        assert!(state.last_modified > 0);
    }

    #[tokio::test]
    async fn failed_push_does_not_advance_state() {
        let (home, remote, project) = (tempdir().unwrap(), tempdir().unwrap(), tempdir().unwrap());
        fs::write(project.path().join("main.py"), "print('hi')\n").unwrap();
        let engine = engine(home.path(), remote.path(), project.path()).await;

        let mut state = StateRecord::new(project.path());
        state.context_document_id = Some("gone".to_string());
        let before = state.clone();

        let err = engine.synchronize(&mut state).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        assert_eq!(state, before);
        assert!(engine.layout().read_context_cache().await.unwrap().is_none());
    }
}
