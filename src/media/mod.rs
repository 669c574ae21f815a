//! The media universe: every item the filter and the untagged statistics
//! operate on. Indexing media is someone else's job; this module only
//! defines how the universe is supplied.

pub mod discovery;

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

pub use discovery::DirectoryMediaSource;

use crate::error::{GraphError, Result};

/// One media item as reported by the media indexer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaItem {
    pub path: String,
    pub id: i64,
}

impl MediaItem {
    pub fn new(path: impl Into<String>, id: i64) -> Self {
        Self {
            path: path.into(),
            id,
        }
    }
}

/// Supplies the current full list of media items.
pub trait MediaSource: Send + Sync {
    fn media(&self) -> Result<Vec<MediaItem>>;
}

/// A media universe held in memory and replaced wholesale.
#[derive(Debug, Default)]
pub struct StaticMediaSource {
    items: RwLock<Vec<MediaItem>>,
}

impl StaticMediaSource {
    pub fn new(items: Vec<MediaItem>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    /// Build a universe from bare paths, numbering items from 1.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| MediaItem::new(path, i as i64 + 1))
            .collect();
        Self::new(items)
    }

    pub fn replace(&self, items: Vec<MediaItem>) -> Result<()> {
        let mut guard = self.items.write().map_err(|_| GraphError::Poisoned)?;
        *guard = items;
        Ok(())
    }
}

impl MediaSource for StaticMediaSource {
    fn media(&self) -> Result<Vec<MediaItem>> {
        let guard = self.items.read().map_err(|_| GraphError::Poisoned)?;
        Ok(guard.clone())
    }
}
