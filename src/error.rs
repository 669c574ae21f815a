//! Error types for the tag graph.
//!
//! Cycle rejection is not an error: structural checks answer `Ok(false)` and
//! leave the graph untouched. Errors here are reserved for ids that do not
//! resolve, the reserved untagged id, and storage or runtime failures.

use thiserror::Error;

use crate::db::TagId;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("tag {0} not found")]
    NotFound(TagId),

    #[error("tag {0} is reserved and cannot be modified")]
    ReservedTag(TagId),

    #[error("tag name must not be empty")]
    InvalidName,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("media source error: {0}")]
    Media(String),

    #[error("tag store lock poisoned")]
    Poisoned,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl GraphError {
    /// Whether a batch operation should count this as a skipped item rather
    /// than abort.
    pub fn is_item_failure(&self) -> bool {
        matches!(self, GraphError::NotFound(_) | GraphError::ReservedTag(_))
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
