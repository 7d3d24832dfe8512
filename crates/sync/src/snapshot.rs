use crate::config::MonitorConfig;
use crate::content_store::ContentStore;
use crate::engine::short_hash;
use crate::error::StructuralViolation;
use crate::remote::{DocumentStore, CONTEXT_MIME};
use crate::state::{write_atomic, ProjectLayout, SharedState, StateRecord};
use crate::{Result, SyncError};
use context_transcript::TRANSCRIPT_MIME;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const INFO_FILE_NAME: &str = "info.json";
const TRANSCRIPT_FILE_NAME: &str = "transcript.bin";
const STAGING_PREFIX: &str = ".staging-";
const ID_FORMAT: &str = "%Y%m%d_%H%M%S";
const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Metadata of one snapshot, stored as `snapshots/<timestamp_id>/info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub timestamp_id: String,
    pub created_at: String,
    pub remote_modified_marker: String,
    pub context_hash_ref: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl SnapshotInfo {
    #[must_use]
    pub fn is_automatic(&self) -> bool {
        self.message.is_none()
    }
}

/// Last marker seen by the poller and the write counter at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub marker: String,
    pub remote_writes: u64,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    state: SharedState,
    layout: ProjectLayout,
    content: ContentStore,
}

struct Worker {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background history of the transcript plus manual snapshots and restore.
///
/// ```text
/// Idle ──start()──> Running ──stop()──> Idle
/// ```
pub struct SnapshotManager {
    inner: Arc<Inner>,
    config: MonitorConfig,
    worker: Option<Worker>,
}

impl SnapshotManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        state: SharedState,
        layout: ProjectLayout,
        config: MonitorConfig,
    ) -> Self {
        let content = ContentStore::new(layout.content_store_dir());
        Self {
            inner: Arc::new(Inner {
                store,
                state,
                layout,
                content,
            }),
            config,
            worker: None,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Spawn the poller. No-op while it is already running.
    pub fn start(&mut self) {
        if self.is_running() {
            log::debug!("Snapshot poller already running");
            return;
        }

        let (cancel, mut cancelled) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let interval = self.config.poll_interval;

        let handle = tokio::spawn(async move {
            let mut observed: Option<Observation> = None;
            loop {
                if *cancelled.borrow() {
                    break;
                }
                match inner.poll_once(&mut observed).await {
                    Ok(Some(info)) => log::info!(
                        "Transcript changed; snapshot {} created",
                        info.timestamp_id
                    ),
                    Ok(None) => {}
                    Err(err) => log::warn!("Snapshot poll failed: {err}"),
                }

                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    changed = cancelled.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Snapshot poller stopped");
        });

        self.worker = Some(Worker { cancel, handle });
        log::info!("Snapshot poller started (every {interval:?})");
    }

    /// Ask the poller to exit and wait up to the grace period.
    ///
    /// An iteration in flight is allowed to finish; past the grace period the
    /// task is left to wind down on its own.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.cancel.send(true);
        match tokio::time::timeout(self.config.stop_grace, worker.handle).await {
            Ok(Ok(())) => log::debug!("Snapshot poller joined"),
            Ok(Err(err)) => log::warn!("Snapshot poller ended abnormally: {err}"),
            Err(_) => log::warn!(
                "Snapshot poller did not stop within {:?}; continuing without it",
                self.config.stop_grace
            ),
        }
    }

    /// One poll iteration, exposed for callers driving the poller themselves.
    pub async fn poll_once(&self, observed: &mut Option<Observation>) -> Result<Option<SnapshotInfo>> {
        self.inner.poll_once(observed).await
    }

    /// Capture the current transcript under `marker`.
    pub async fn create_snapshot(
        &self,
        marker: &str,
        message: Option<&str>,
    ) -> Result<SnapshotInfo> {
        let state = self.inner.state.lock().await;
        self.inner.create_snapshot(&state, marker, message).await
    }

    /// Snapshot on request, using the transcript's current marker.
    pub async fn create_named_snapshot(&self, message: &str) -> Result<SnapshotInfo> {
        let state = self.inner.state.lock().await;
        let meta = self.inner.store.get_metadata(state.transcript_id()?).await?;
        self.inner
            .create_snapshot(&state, &meta.modified_marker, Some(message))
            .await
    }

    /// All snapshots, newest first.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.inner.list_snapshots().await
    }

    pub async fn get_snapshot(&self, timestamp_id: &str) -> Result<Option<SnapshotInfo>> {
        self.inner.get_snapshot(timestamp_id).await
    }

    /// Push a snapshot's context and transcript back to the remote documents.
    pub async fn restore(&self, timestamp_id: &str) -> Result<SnapshotInfo> {
        self.inner.restore(timestamp_id).await
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            let _ = worker.cancel.send(true);
        }
    }
}

impl Inner {
    fn snapshot_dir(&self, timestamp_id: &str) -> PathBuf {
        self.layout.snapshots_dir().join(timestamp_id)
    }

    async fn poll_once(&self, observed: &mut Option<Observation>) -> Result<Option<SnapshotInfo>> {
        let state = self.state.lock().await;
        let meta = self.store.get_metadata(state.transcript_id()?).await?;
        let current = Observation {
            marker: meta.modified_marker,
            remote_writes: state.remote_writes(),
        };

        let outcome = match observed.as_ref() {
            Some(previous) if previous.marker != current.marker => {
                if previous.remote_writes == current.remote_writes {
                    self.create_snapshot(&state, &current.marker, None)
                        .await
                        .map(Some)
                } else {
                    log::debug!("Transcript changed by this session; adopting new marker");
                    Ok(None)
                }
            }
            _ => Ok(None),
        };

        *observed = Some(current);
        outcome
    }

    async fn create_snapshot(
        &self,
        state: &StateRecord,
        marker: &str,
        message: Option<&str>,
    ) -> Result<SnapshotInfo> {
        let hash = state
            .content_hash
            .clone()
            .ok_or(SyncError::MissingContentHash)?;

        if !self.content.contains(&hash).await {
            let Some(cached) = self.layout.read_context_cache().await? else {
                return Err(SyncError::Structural(
                    StructuralViolation::MissingStoredContent { hash },
                ));
            };
            self.content.put_with_hash(&hash, &cached).await?;
        }

        let transcript = self.store.get_content(state.transcript_id()?).await?;

        let now = chrono::Local::now();
        let latest = self.list_ids().await?.into_iter().next();
        let timestamp_id = next_snapshot_id(
            &now.format(ID_FORMAT).to_string(),
            latest.as_deref(),
        );
        let info = SnapshotInfo {
            timestamp_id: timestamp_id.clone(),
            created_at: now.format(CREATED_AT_FORMAT).to_string(),
            remote_modified_marker: marker.to_string(),
            context_hash_ref: hash,
            message: message.map(str::to_string),
        };

        // Build the whole record aside and rename it into place.
        let snapshots = self.layout.snapshots_dir();
        let staging = snapshots.join(format!("{STAGING_PREFIX}{timestamp_id}"));
        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;
        let staged = async {
            write_atomic(&staging.join(TRANSCRIPT_FILE_NAME), &transcript).await?;
            write_atomic(
                &staging.join(INFO_FILE_NAME),
                &serde_json::to_vec_pretty(&info)?,
            )
            .await?;
            tokio::fs::rename(&staging, self.snapshot_dir(&timestamp_id)).await?;
            Ok::<(), SyncError>(())
        }
        .await;
        if let Err(err) = staged {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(err);
        }

        log::info!(
            "Snapshot {timestamp_id} saved (context {})",
            short_hash(&info.context_hash_ref)
        );
        Ok(info)
    }

    /// Snapshot ids, newest first.
    async fn list_ids(&self) -> Result<Vec<String>> {
        let dir = self.layout.snapshots_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            if tokio::fs::try_exists(entry.path().join(INFO_FILE_NAME))
                .await
                .unwrap_or(false)
            {
                ids.push(name);
            }
        }
        ids.sort_by_key(|id| std::cmp::Reverse(id_sort_key(id)));
        Ok(ids)
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let mut snapshots = Vec::new();
        for id in self.list_ids().await? {
            match self.get_snapshot(&id).await {
                Ok(Some(info)) => snapshots.push(info),
                Ok(None) => {}
                Err(err) => log::warn!("Skipping unreadable snapshot {id}: {err}"),
            }
        }
        Ok(snapshots)
    }

    async fn get_snapshot(&self, timestamp_id: &str) -> Result<Option<SnapshotInfo>> {
        if !is_valid_id(timestamp_id) {
            return Ok(None);
        }
        let path = self.snapshot_dir(timestamp_id).join(INFO_FILE_NAME);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn restore(&self, timestamp_id: &str) -> Result<SnapshotInfo> {
        let info = self
            .get_snapshot(timestamp_id)
            .await?
            .ok_or_else(|| SyncError::SnapshotNotFound(timestamp_id.to_string()))?;

        let context = self
            .content
            .get(&info.context_hash_ref)
            .await?
            .ok_or_else(|| {
                SyncError::Structural(StructuralViolation::MissingStoredContent {
                    hash: info.context_hash_ref.clone(),
                })
            })?;
        let transcript =
            match tokio::fs::read(self.snapshot_dir(timestamp_id).join(TRANSCRIPT_FILE_NAME)).await
            {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SyncError::SnapshotNotFound(format!(
                        "{timestamp_id} (transcript missing)"
                    )))
                }
                Err(err) => return Err(err.into()),
            };

        let mut state = self.state.lock().await;
        let context_id = state.context_id()?.to_string();
        let transcript_id = state.transcript_id()?.to_string();
        let previous = self.current_context(&state).await;

        self.store
            .update(&context_id, &context, CONTEXT_MIME)
            .await?;
        state.note_remote_write();

        if let Err(err) = self
            .store
            .update(&transcript_id, &transcript, TRANSCRIPT_MIME)
            .await
        {
            state.note_remote_write();
            if let Some(previous) = previous {
                match self.store.update(&context_id, &previous, CONTEXT_MIME).await {
                    Ok(()) => {
                        log::warn!("Transcript restore failed; context rolled back: {err}");
                        return Err(err.into());
                    }
                    Err(rollback) => log::error!("Context rollback failed: {rollback}"),
                }
            }
            // The context document now holds the snapshot's bytes.
            state.content_hash = Some(info.context_hash_ref.clone());
            self.layout.write_context_cache(&context).await?;
            return Err(SyncError::PartialRestore {
                snapshot: timestamp_id.to_string(),
                detail: format!("context restored but transcript write failed: {err}"),
            });
        }
        state.note_remote_write();

        self.layout.write_context_cache(&context).await?;
        state.content_hash = Some(info.context_hash_ref.clone());
        log::info!("Restored snapshot {timestamp_id}");
        Ok(info)
    }

    /// Bytes currently in the context document, as far as local state knows.
    async fn current_context(&self, state: &StateRecord) -> Option<Vec<u8>> {
        if let Some(hash) = state.content_hash.as_deref() {
            if let Ok(Some(bytes)) = self.content.get(hash).await {
                return Some(bytes);
            }
        }
        self.layout.read_context_cache().await.ok().flatten()
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Orders `20240101_120000_02` after `20240101_120000` and `..._09` before `..._10`.
fn id_sort_key(id: &str) -> (String, u32) {
    let base = id.get(..15).unwrap_or(id).to_string();
    let seq = id
        .get(16..)
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    (base, seq)
}

/// Second-resolution id that never collides with or sorts before `latest`,
/// even when the clock moves backwards.
fn next_snapshot_id(now: &str, latest: Option<&str>) -> String {
    let Some(latest) = latest else {
        return now.to_string();
    };
    let (latest_base, latest_seq) = id_sort_key(latest);
    if now > latest_base.as_str() {
        return now.to_string();
    }
    format!("{latest_base}_{:02}", latest_seq + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ids_advance_past_collisions_and_clock_skew() {
        assert_eq!(next_snapshot_id("20240101_120000", None), "20240101_120000");
        assert_eq!(
            next_snapshot_id("20240101_120001", Some("20240101_120000")),
            "20240101_120001"
        );
        assert_eq!(
            next_snapshot_id("20240101_120000", Some("20240101_120000")),
            "20240101_120000_01"
        );
        assert_eq!(
            next_snapshot_id("20240101_120000", Some("20240101_120000_01")),
            "20240101_120000_02"
        );
        // clock went backwards
        assert_eq!(
            next_snapshot_id("20231231_235959", Some("20240101_120000")),
            "20240101_120000_01"
        );
    }

    #[test]
    fn sort_key_orders_suffixes_numerically() {
        let mut ids = vec![
            "20240101_120000_10",
            "20240101_120000",
            "20240101_120000_09",
            "20240101_115959",
        ];
        ids.sort_by_key(|id| std::cmp::Reverse(id_sort_key(id)));
        assert_eq!(
            ids,
            vec![
                "20240101_120000_10",
                "20240101_120000_09",
                "20240101_120000",
                "20240101_115959",
            ]
        );
    }

    #[test]
    fn path_like_ids_are_rejected() {
        assert!(is_valid_id("20240101_120000_01"));
        assert!(!is_valid_id("../state"));
        assert!(!is_valid_id(".staging-20240101_120000"));
        assert!(!is_valid_id(""));
    }
}
