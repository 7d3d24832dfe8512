//! # Context Transcript
//!
//! Model of a remote chat transcript and the pure edits applied to it.
//!
//! ## Shape
//!
//! ```text
//! TranscriptDocument
//!     │
//!     └──> chunkedPrompt.chunks: [Block]
//!            ├─> [0] DocumentRef (protected setup context)
//!            ├─> Text(user)  ...
//!            └─> Text(model) ...
//! ```
//!
//! Every edit takes a block slice and returns a new list; nothing here does I/O.
//! Index 0 is the setup context reference and no trimming or removal ever drops it.
//!
//! ## Example
//!
//! ```
//! use context_transcript::{trim_to_setup, Block};
//!
//! let blocks = vec![
//!     Block::document("ctx-1", Some(1200)),
//!     Block::user_text("load the project"),
//!     Block::model_text("ready"),
//!     Block::user_text("what does main do?"),
//! ];
//! let trimmed = trim_to_setup(&blocks).unwrap();
//! assert_eq!(trimmed.len(), 3);
//! ```

mod document;
mod editor;
mod error;

pub use document::{
    Block, ChunkedPrompt, DocumentRefBlock, ImageRefBlock, RemoteRef, Role, TextBlock,
    TranscriptDocument,
};
pub use editor::{
    append_blocks, has_pending_marked_task, pop_blocks, remove_blocks, remove_marked_tasks,
    repair_finish_markers, trim_to_setup, CANONICAL_FINISH_REASON,
};
pub use error::{EditError, Result};

/// Marker embedded in machine-generated commit-message requests.
pub const COMMIT_TASK_MARKER: &str = "<!-- project-context:commit-request -->";

/// MIME type of a transcript document on the remote store.
pub const TRANSCRIPT_MIME: &str = "application/vnd.google-makersuite.prompt";
