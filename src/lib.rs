//! Hierarchical and cross-referencing tags for media collections.
//!
//! Tags form a forest through their single hierarchy parent and may also
//! reference any number of other tags. A tag's closure is itself plus
//! everything reachable through either edge kind; statistics and filters
//! are defined over closures. [`TagGraphService`] is the entry point.

pub mod config;
pub mod cycle;
pub mod db;
pub mod error;
pub mod filter;
pub mod graph;
pub mod logging;
pub mod media;
pub mod ordering;
pub mod outcome;
pub mod service;
pub mod stats;
pub mod tasks;
pub mod tree;
pub mod undo;

pub use config::Config;
pub use db::{ReferenceEdge, SortGroup, Tag, TagId, TagStore, UNTAGGED};
pub use error::{GraphError, Result};
pub use filter::{FilterMark, FilterState, FilteredMedia};
pub use graph::TagGraph;
pub use media::{DirectoryMediaSource, MediaItem, MediaSource, StaticMediaSource};
pub use outcome::BatchOutcome;
pub use service::TagGraphService;
pub use stats::{StatisticsMap, TagStatistics};
pub use tree::{TagTree, TagTreeNode};
pub use undo::{DeletedTagSnapshot, RestoreClaim, RestoreReport, UndoState};
