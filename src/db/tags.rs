//! Types for tags, reference edges and media associations.

use serde::{Deserialize, Serialize};

/// Identity of a persisted tag. Assigned by the store on creation.
pub type TagId = i64;

/// The virtual "untagged" pseudo-tag. Never persisted.
pub const UNTAGGED: TagId = -1;

/// A user-defined tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub parent_id: Option<TagId>,
    pub normal_group_sort_order: i64,
    pub referenced_group_sort_order: i64,
    pub is_expanded: bool,
    pub cached_image_count: i64,
}

impl Tag {
    /// Sort key of the group the tag currently belongs to.
    pub fn sort_order(&self, group: SortGroup) -> i64 {
        match group {
            SortGroup::Normal => self.normal_group_sort_order,
            SortGroup::Referenced => self.referenced_group_sort_order,
        }
    }
}

/// One of the two disjoint sort-key spaces.
///
/// A tag with at least one outgoing reference lives in `Referenced`,
/// every other tag lives in `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortGroup {
    Normal,
    Referenced,
}

impl SortGroup {
    pub fn for_reference_count(count: usize) -> Self {
        if count > 0 {
            SortGroup::Referenced
        } else {
            SortGroup::Normal
        }
    }

    pub(crate) fn column(self) -> &'static str {
        match self {
            SortGroup::Normal => "normal_group_sort_order",
            SortGroup::Referenced => "referenced_group_sort_order",
        }
    }
}

/// Ordered many-to-many edge between tags, distinct from the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceEdge {
    pub parent_tag_id: TagId,
    pub child_tag_id: TagId,
    pub sort_order: i64,
}

/// A media item carrying a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTagAssociation {
    pub media_path: String,
    pub tag_id: TagId,
}
