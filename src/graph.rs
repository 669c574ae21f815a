//! In-memory snapshot of the tag graph used by every closure query.
//!
//! A `TagGraph` is loaded from the store in one pass and then traversed
//! without holding the store lock. Traversals keep a visited set, so they
//! terminate even on a graph that already contains a cycle.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::db::{TagId, UNTAGGED};

#[derive(Debug, Clone, Default)]
pub struct TagGraph {
    tags: BTreeSet<TagId>,
    parent: HashMap<TagId, TagId>,
    children: HashMap<TagId, Vec<TagId>>,
    ref_children: HashMap<TagId, Vec<TagId>>,
    ref_parents: HashMap<TagId, Vec<TagId>>,
    media: HashMap<TagId, HashSet<String>>,
}

impl TagGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tag(&mut self, id: TagId, parent: Option<TagId>) {
        self.tags.insert(id);
        if let Some(parent) = parent {
            self.parent.insert(id, parent);
            self.children.entry(parent).or_default().push(id);
        }
    }

    pub fn insert_reference(&mut self, parent: TagId, child: TagId) {
        self.ref_children.entry(parent).or_default().push(child);
        self.ref_parents.entry(child).or_default().push(parent);
    }

    pub fn insert_media(&mut self, tag: TagId, path: impl Into<String>) {
        self.media.entry(tag).or_default().insert(path.into());
    }

    pub fn contains(&self, id: TagId) -> bool {
        self.tags.contains(&id)
    }

    pub fn tag_ids(&self) -> impl Iterator<Item = TagId> + '_ {
        self.tags.iter().copied()
    }

    pub fn hierarchy_parent(&self, id: TagId) -> Option<TagId> {
        self.parent.get(&id).copied()
    }

    pub fn hierarchy_children(&self, id: TagId) -> &[TagId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn reference_children(&self, id: TagId) -> &[TagId] {
        self.ref_children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn reference_parents(&self, id: TagId) -> &[TagId] {
        self.ref_parents.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The tag itself plus every tag reachable through hierarchy-child and
    /// reference-child edges.
    pub fn closure(&self, id: TagId) -> BTreeSet<TagId> {
        self.walk(id, |graph, node| {
            graph
                .hierarchy_children(node)
                .iter()
                .chain(graph.reference_children(node))
                .copied()
                .collect()
        })
    }

    /// `closure(id)` without the tag itself.
    pub fn descendants(&self, id: TagId) -> BTreeSet<TagId> {
        let mut set = self.closure(id);
        set.remove(&id);
        set
    }

    /// Every tag whose closure contains `id`, excluding `id`.
    pub fn ancestors(&self, id: TagId) -> BTreeSet<TagId> {
        let mut set = self.walk(id, |graph, node| {
            graph
                .hierarchy_parent(node)
                .into_iter()
                .chain(graph.reference_parents(node).iter().copied())
                .collect()
        });
        set.remove(&id);
        set
    }

    /// Hierarchy-only ancestors, nearest first.
    pub fn hierarchy_ancestors(&self, id: TagId) -> Vec<TagId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut current = self.hierarchy_parent(id);
        while let Some(parent) = current {
            if !seen.insert(parent) {
                break;
            }
            chain.push(parent);
            current = self.hierarchy_parent(parent);
        }
        chain
    }

    fn walk<F>(&self, start: TagId, next: F) -> BTreeSet<TagId>
    where
        F: Fn(&Self, TagId) -> Vec<TagId>,
    {
        let mut visited = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            for neighbor in next(self, node) {
                if !visited.contains(&neighbor) {
                    stack.push(neighbor);
                }
            }
        }
        visited
    }

    pub fn direct_paths(&self, id: TagId) -> Option<&HashSet<String>> {
        self.media.get(&id)
    }

    pub fn direct_count(&self, id: TagId) -> usize {
        self.media.get(&id).map_or(0, HashSet::len)
    }

    /// Union of media paths tagged by any id in `ids`.
    pub fn paths_for<'a, 'b, I>(&'a self, ids: I) -> HashSet<&'a str>
    where
        I: IntoIterator<Item = &'b TagId>,
    {
        ids.into_iter()
            .filter_map(|id| self.media.get(id))
            .flat_map(|paths| paths.iter().map(String::as_str))
            .collect()
    }

    /// Media paths reachable from the closure of `id`.
    pub fn closure_paths(&self, id: TagId) -> HashSet<&str> {
        let closure = self.closure(id);
        self.paths_for(closure.iter())
    }

    /// Every path carrying at least one tag.
    pub fn tagged_paths(&self) -> HashSet<&str> {
        self.media
            .iter()
            .filter(|(id, _)| **id != UNTAGGED)
            .flat_map(|(_, paths)| paths.iter().map(String::as_str))
            .collect()
    }

    pub fn incoming_reference_count(&self, id: TagId) -> usize {
        self.reference_parents(id).len()
    }
}
