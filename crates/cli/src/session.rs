use anyhow::{bail, Context as AnyhowContext, Result};
use context_sync::{
    DocumentStore, LocalDocumentStore, ProjectLayout, RetryingStore, SessionLock, SharedState,
    SnapshotManager, StateRecord, SyncConfig, SyncEngine, TranscriptEditor, TreeContextSource,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const REMOTE_DIR_NAME: &str = "remote";

/// Global options shared by every subcommand.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub project: PathBuf,
    pub home: Option<PathBuf>,
    pub remote_dir: Option<PathBuf>,
    pub poll_ms: Option<u64>,
}

/// Everything one invocation needs to drive a project.
pub struct Session {
    pub config: SyncConfig,
    pub project: PathBuf,
    pub layout: ProjectLayout,
    pub store: Arc<dyn DocumentStore>,
    pub engine: SyncEngine,
    pub editor: TranscriptEditor,
    _lock: SessionLock,
}

impl Session {
    pub async fn open(opts: &SessionOptions) -> Result<Self> {
        let mut config = SyncConfig::from_env();
        if let Some(home) = &opts.home {
            config.home = home.clone();
        }
        if let Some(ms) = opts.poll_ms.filter(|ms| *ms > 0) {
            config.monitor.poll_interval = Duration::from_millis(ms);
        }

        let project = opts
            .project
            .canonicalize()
            .with_context(|| format!("Invalid project path {}", opts.project.display()))?;
        let layout = ProjectLayout::for_project(&config.home, &project);

        let Some(lock) = SessionLock::try_acquire(&layout).await? else {
            bail!(
                "another session is already driving {} (lock {})",
                project.display(),
                layout.session_lock_path().display()
            );
        };

        let remote_dir = opts
            .remote_dir
            .clone()
            .unwrap_or_else(|| config.home.join(REMOTE_DIR_NAME));
        let local = LocalDocumentStore::open(&remote_dir)
            .await
            .with_context(|| format!("Failed to open remote store {}", remote_dir.display()))?;
        let store: Arc<dyn DocumentStore> = Arc::new(RetryingStore::new(local, config.retry));

        let engine = SyncEngine::new(
            Arc::clone(&store),
            Arc::new(TreeContextSource),
            layout.clone(),
            config.remote_folder.clone(),
        );
        let editor = TranscriptEditor::new(Arc::clone(&store));
        log::debug!(
            "Session for {} (state in {})",
            project.display(),
            layout.dir().display()
        );

        Ok(Self {
            config,
            project,
            layout,
            store,
            engine,
            editor,
            _lock: lock,
        })
    }

    pub async fn load_state(&self) -> Result<StateRecord> {
        match self.layout.load_state().await? {
            Some(state) => Ok(state),
            None => bail!(
                "{} is not tracked yet; run `project-context sync` first",
                self.project.display()
            ),
        }
    }

    /// Existing state, or a freshly bootstrapped project. The flag is `true` on bootstrap.
    pub async fn load_or_bootstrap(&self) -> Result<(StateRecord, bool)> {
        if let Some(state) = self.layout.load_state().await? {
            return Ok((state, false));
        }
        let state = self
            .engine
            .bootstrap_project(&self.project)
            .await
            .context("Failed to create the initial context")?;
        self.save(&state).await?;
        Ok((state, true))
    }

    pub async fn save(&self, state: &StateRecord) -> Result<()> {
        self.layout
            .save_state(state)
            .await
            .context("Failed to persist project state")
    }

    pub fn history(&self, state: SharedState) -> SnapshotManager {
        SnapshotManager::new(
            Arc::clone(&self.store),
            state,
            self.layout.clone(),
            self.config.monitor.clone(),
        )
    }

    pub fn project(&self) -> &Path {
        &self.project
    }
}
