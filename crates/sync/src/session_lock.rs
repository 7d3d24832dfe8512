use crate::state::ProjectLayout;
use crate::{Result, SyncError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

/// Advisory exclusive lock on a project directory, released on drop.
///
/// Two processes driving the same remote document pair would each see the
/// other's writes as user changes.
#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Take the lock without waiting; `Ok(None)` when another session holds it.
    pub async fn try_acquire(layout: &ProjectLayout) -> Result<Option<Self>> {
        let path = layout.session_lock_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::task::spawn_blocking(move || -> Result<Option<SessionLock>> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|err| {
                    SyncError::Other(format!("open session lock {}: {err}", path.display()))
                })?;

            match file.try_lock_exclusive() {
                Ok(()) => Ok(Some(SessionLock { file, path })),
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
                Err(err) => Err(SyncError::Other(format!(
                    "acquire session lock {}: {err}",
                    path.display()
                ))),
            }
        })
        .await
        .map_err(|err| SyncError::Other(format!("join session lock task: {err}")))?
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
