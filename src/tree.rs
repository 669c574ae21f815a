//! Nested view of the tag graph for display.
//!
//! Hierarchy children nest fully. Referenced children are listed one level
//! deep under the tag holding the reference, in reference order. Siblings
//! show tags with outgoing references first, each group by its own key.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use crate::db::{ReferenceEdge, SortGroup, Tag, TagId};

#[derive(Debug, Clone, Serialize)]
pub struct ReferencedChild {
    pub tag: Tag,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagTreeNode {
    pub tag: Tag,
    pub group: SortGroup,
    pub children: Vec<TagTreeNode>,
    pub referenced: Vec<ReferencedChild>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TagTree {
    /// Graph version the tree was built from.
    pub version: u64,
    pub roots: Vec<TagTreeNode>,
}

impl TagTree {
    pub fn build(version: u64, tags: &[Tag], references: &[ReferenceEdge]) -> Self {
        let by_id: HashMap<TagId, &Tag> = tags.iter().map(|tag| (tag.id, tag)).collect();

        let mut outgoing: HashMap<TagId, Vec<&ReferenceEdge>> = HashMap::new();
        for edge in references {
            outgoing.entry(edge.parent_tag_id).or_default().push(edge);
        }
        for edges in outgoing.values_mut() {
            edges.sort_by_key(|edge| (edge.sort_order, edge.child_tag_id));
        }

        let mut children: HashMap<Option<TagId>, Vec<&Tag>> = HashMap::new();
        for tag in tags {
            // A dangling parent id puts the tag at the root.
            let parent = tag.parent_id.filter(|parent| by_id.contains_key(parent));
            children.entry(parent).or_default().push(tag);
        }

        let builder = Builder {
            by_id,
            outgoing,
            children,
        };
        let mut visited = HashSet::new();
        let roots = builder.level(None, &mut visited);
        Self { version, roots }
    }

    pub fn find(&self, id: TagId) -> Option<&TagTreeNode> {
        fn search(nodes: &[TagTreeNode], id: TagId) -> Option<&TagTreeNode> {
            nodes.iter().find_map(|node| {
                if node.tag.id == id {
                    Some(node)
                } else {
                    search(&node.children, id)
                }
            })
        }
        search(&self.roots, id)
    }

    /// Indented plain-text rendering. Referenced children are prefixed
    /// with `->`.
    pub fn render(&self) -> String {
        fn node(out: &mut String, n: &TagTreeNode, depth: usize) {
            let indent = "  ".repeat(depth);
            let _ = writeln!(out, "{}{} [{}]", indent, n.tag.name, n.tag.id);
            for r in &n.referenced {
                let _ = writeln!(out, "{}  -> {} [{}]", indent, r.tag.name, r.tag.id);
            }
            for child in &n.children {
                node(out, child, depth + 1);
            }
        }
        let mut out = String::new();
        for root in &self.roots {
            node(&mut out, root, 0);
        }
        out
    }
}

struct Builder<'a> {
    by_id: HashMap<TagId, &'a Tag>,
    outgoing: HashMap<TagId, Vec<&'a ReferenceEdge>>,
    children: HashMap<Option<TagId>, Vec<&'a Tag>>,
}

impl Builder<'_> {
    fn group(&self, id: TagId) -> SortGroup {
        SortGroup::for_reference_count(self.outgoing.get(&id).map_or(0, Vec::len))
    }

    fn level(&self, parent: Option<TagId>, visited: &mut HashSet<TagId>) -> Vec<TagTreeNode> {
        let mut siblings: Vec<&Tag> = self.children.get(&parent).cloned().unwrap_or_default();
        siblings.sort_by_key(|tag| {
            let group = self.group(tag.id);
            let rank = match group {
                SortGroup::Referenced => 0,
                SortGroup::Normal => 1,
            };
            (rank, tag.sort_order(group), tag.id)
        });

        let mut nodes = Vec::with_capacity(siblings.len());
        for tag in siblings {
            if !visited.insert(tag.id) {
                continue;
            }
            nodes.push(TagTreeNode {
                tag: tag.clone(),
                group: self.group(tag.id),
                referenced: self.referenced(tag.id),
                children: self.level(Some(tag.id), visited),
            });
        }
        nodes
    }

    fn referenced(&self, id: TagId) -> Vec<ReferencedChild> {
        self.outgoing
            .get(&id)
            .map(|edges| {
                edges
                    .iter()
                    .filter_map(|edge| {
                        self.by_id.get(&edge.child_tag_id).map(|tag| ReferencedChild {
                            tag: (*tag).clone(),
                            sort_order: edge.sort_order,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
