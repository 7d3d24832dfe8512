use crate::remote::RemoteError;
use context_transcript::EditError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Which structural invariant an operation ran into.
///
/// The two cases need different remediation: a missing anchor means the
/// transcript must be restructured, missing stored content means that
/// snapshot's context is permanently lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralViolation {
    MissingAnchor { blocks: usize },
    MissingStoredContent { hash: String },
}

impl fmt::Display for StructuralViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralViolation::MissingAnchor { blocks } => write!(
                f,
                "transcript has no valid trim anchor among {blocks} blocks; restructure it manually"
            ),
            StructuralViolation::MissingStoredContent { hash } => write!(
                f,
                "context {hash} was never retained in the content store; this snapshot cannot be restored"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    TransferError,
    RemoteError,
    StructuralError,
    ConsistencyHashCollision,
    PartialRestore,
    Local,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::TransferError => "TransferError",
            ErrorKind::RemoteError => "RemoteError",
            ErrorKind::StructuralError => "StructuralError",
            ErrorKind::ConsistencyHashCollision => "ConsistencyHashCollision",
            ErrorKind::PartialRestore => "PartialRestore",
            ErrorKind::Local => "LocalError",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("remote document not found: {0}")]
    NotFound(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("structural error: {0}")]
    Structural(StructuralViolation),

    #[error("stored bytes under {hash} do not match their hash")]
    HashCollision { hash: String },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("state has no content hash; push the context at least once first")]
    MissingContentHash,

    #[error("state has no {0} document id")]
    MissingDocumentId(&'static str),

    #[error("restore of {snapshot} was only partially applied: {detail}")]
    PartialRestore { snapshot: String, detail: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid project path: {0}")]
    InvalidPath(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Transfer(_) => ErrorKind::TransferError,
            SyncError::Remote(_) => ErrorKind::RemoteError,
            SyncError::Structural(_) => ErrorKind::StructuralError,
            SyncError::HashCollision { .. } => ErrorKind::ConsistencyHashCollision,
            SyncError::PartialRestore { .. } => ErrorKind::PartialRestore,
            SyncError::SnapshotNotFound(_)
            | SyncError::MissingContentHash
            | SyncError::MissingDocumentId(_)
            | SyncError::IoError(_)
            | SyncError::JsonError(_)
            | SyncError::InvalidPath(_)
            | SyncError::Other(_) => ErrorKind::Local,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(id) => SyncError::NotFound(id),
            RemoteError::Transfer(msg) => SyncError::Transfer(msg),
            RemoteError::Remote(msg) => SyncError::Remote(msg),
        }
    }
}

impl From<EditError> for SyncError {
    fn from(err: EditError) -> Self {
        match err {
            EditError::NoAnchor { len } => {
                SyncError::Structural(StructuralViolation::MissingAnchor { blocks: len })
            }
            EditError::Json(e) => SyncError::JsonError(e),
        }
    }
}
