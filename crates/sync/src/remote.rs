//! Boundary to the remote document store.
//!
//! The core only ever talks to the remote side through [`DocumentStore`], by opaque id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Parent id addressing the top level of the remote store.
pub const ROOT_PARENT: &str = "root";

pub const CONTEXT_MIME: &str = "text/plain";

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote document not found: {0}")]
    NotFound(String),

    #[error("transfer interrupted: {0}")]
    Transfer(String),

    #[error("remote rejected the request: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub id: String,
    pub name: String,
    /// Opaque "last modified" token. Only compared for equality, never ordered.
    pub modified_marker: String,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_metadata(&self, id: &str) -> RemoteResult<RemoteMetadata>;

    async fn get_content(&self, id: &str) -> RemoteResult<Vec<u8>>;

    async fn create(
        &self,
        parent_id: &str,
        name: &str,
        bytes: &[u8],
        mime: &str,
    ) -> RemoteResult<String>;

    async fn update(&self, id: &str, bytes: &[u8], mime: &str) -> RemoteResult<()>;

    async fn find_by_name(&self, name: &str, parent_id: &str) -> RemoteResult<Option<String>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

/// Retries [`RemoteError::Transfer`] failures with exponential backoff.
///
/// `NotFound` and `Remote` are permanent and surface on the first attempt.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: DocumentStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, op: &str, mut call: F) -> RemoteResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = RemoteResult<T>> + Send,
        T: Send,
    {
        let attempts = self.policy.attempts.max(1);
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(RemoteError::Transfer(msg)) if attempt < attempts => {
                    log::warn!("{op} attempt {attempt}/{attempts} interrupted: {msg}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for RetryingStore<S> {
    async fn get_metadata(&self, id: &str) -> RemoteResult<RemoteMetadata> {
        self.retry("get_metadata", || self.inner.get_metadata(id))
            .await
    }

    async fn get_content(&self, id: &str) -> RemoteResult<Vec<u8>> {
        self.retry("get_content", || self.inner.get_content(id)).await
    }

    async fn create(
        &self,
        parent_id: &str,
        name: &str,
        bytes: &[u8],
        mime: &str,
    ) -> RemoteResult<String> {
        self.retry("create", || self.inner.create(parent_id, name, bytes, mime))
            .await
    }

    async fn update(&self, id: &str, bytes: &[u8], mime: &str) -> RemoteResult<()> {
        self.retry("update", || self.inner.update(id, bytes, mime))
            .await
    }

    async fn find_by_name(&self, name: &str, parent_id: &str) -> RemoteResult<Option<String>> {
        self.retry("find_by_name", || self.inner.find_by_name(name, parent_id))
            .await
    }
}
