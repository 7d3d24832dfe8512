use thiserror::Error;

pub type Result<T> = std::result::Result<T, EditError>;

#[derive(Error, Debug)]
pub enum EditError {
    #[error("transcript has no trim anchor: no model block and no document/image block among {len} blocks")]
    NoAnchor { len: usize },

    #[error("malformed transcript document: {0}")]
    Json(#[from] serde_json::Error),
}
