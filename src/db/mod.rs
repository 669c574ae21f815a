//! Durable storage for tags, hierarchy edges, reference edges and media
//! associations.

mod schema;
pub mod sqlite;
pub mod tags;

pub use schema::{MIGRATIONS, SCHEMA};
pub use sqlite::TagStore;
pub use tags::{MediaTagAssociation, ReferenceEdge, SortGroup, Tag, TagId, UNTAGGED};

use crate::config::Config;
use crate::error::Result;
use crate::ordering::SortOrderAllocator;

/// Open and initialize the store described by `config`.
pub fn open(config: &Config) -> Result<TagStore> {
    let store = TagStore::open(&config.db_path)?
        .with_allocator(SortOrderAllocator::new(&config.ordering));
    store.initialize()?;
    Ok(store)
}
