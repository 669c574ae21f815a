//! Structural checks run before a reference edge or a hierarchy parent is
//! written.
//!
//! The union of hierarchy edges and reference edges must stay acyclic, and a
//! tag may not reference anything it already contains through either edge
//! kind. Both checks work on a `TagGraph` snapshot taken inside the same
//! critical section as the commit.

use crate::db::{TagId, UNTAGGED};
use crate::graph::TagGraph;

/// Whether `parent -> child` may be added as a reference edge.
pub fn can_add_reference(graph: &TagGraph, parent: TagId, child: TagId) -> bool {
    if parent == child || parent == UNTAGGED || child == UNTAGGED {
        return false;
    }
    // Already contained through hierarchy or reference edges.
    if graph.descendants(parent).contains(&child) {
        return false;
    }
    // The new edge closes a loop when the parent is already reachable from
    // the child.
    !graph.closure(child).contains(&parent)
}

/// Whether `tag` may be moved under `new_parent` in the hierarchy.
///
/// Moving to the root is always allowed.
pub fn can_set_parent(graph: &TagGraph, tag: TagId, new_parent: Option<TagId>) -> bool {
    match new_parent {
        None => tag != UNTAGGED,
        Some(parent) => {
            parent != UNTAGGED && tag != UNTAGGED && !graph.closure(tag).contains(&parent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> TagGraph {
        // 1 > 2 > 3 in the hierarchy, 10 and 11 standalone
        let mut graph = TagGraph::new();
        graph.insert_tag(1, None);
        graph.insert_tag(2, Some(1));
        graph.insert_tag(3, Some(2));
        graph.insert_tag(10, None);
        graph.insert_tag(11, None);
        graph
    }

    #[test]
    fn test_self_reference_rejected() {
        let graph = chain();
        assert!(!can_add_reference(&graph, 10, 10));
    }

    #[test]
    fn test_reference_to_hierarchy_ancestor_rejected() {
        let graph = chain();
        assert!(!can_add_reference(&graph, 3, 1));
        assert!(!can_add_reference(&graph, 3, 2));
    }

    #[test]
    fn test_reference_to_hierarchy_descendant_rejected() {
        let graph = chain();
        assert!(!can_add_reference(&graph, 1, 3));
    }

    #[test]
    fn test_transitive_reference_cycle_rejected() {
        let mut graph = chain();
        graph.insert_reference(10, 11);
        graph.insert_reference(11, 1);
        // 3 is under 1, which 10 reaches through 11
        assert!(!can_add_reference(&graph, 3, 10));
        assert!(!can_add_reference(&graph, 1, 10));
        // 10 already contains 3 through 11 and 1
        assert!(!can_add_reference(&graph, 10, 3));
        assert!(!can_add_reference(&graph, 2, 11));
    }

    #[test]
    fn test_reference_to_reference_descendant_rejected() {
        let mut graph = chain();
        // 10 -> 11 by reference, 11 -> 3 by reference
        graph.insert_reference(10, 11);
        graph.insert_reference(11, 3);
        assert!(!can_add_reference(&graph, 10, 3));
        // mixed: 1 contains 2 by hierarchy, 2 -> 10 by reference
        graph.insert_reference(2, 10);
        assert!(!can_add_reference(&graph, 1, 11));
        assert!(!can_add_reference(&graph, 1, 10));
    }

    #[test]
    fn test_unrelated_reference_allowed() {
        let graph = chain();
        assert!(can_add_reference(&graph, 10, 2));
        assert!(can_add_reference(&graph, 2, 10));
    }

    #[test]
    fn test_untagged_never_referenced() {
        let graph = chain();
        assert!(!can_add_reference(&graph, UNTAGGED, 1));
        assert!(!can_add_reference(&graph, 1, UNTAGGED));
    }

    #[test]
    fn test_reparent_under_own_descendant_rejected() {
        let mut graph = chain();
        assert!(!can_set_parent(&graph, 1, Some(3)));
        graph.insert_reference(3, 10);
        assert!(!can_set_parent(&graph, 1, Some(10)));
        assert!(can_set_parent(&graph, 10, Some(1)));
        assert!(can_set_parent(&graph, 11, Some(3)));
        assert!(can_set_parent(&graph, 3, None));
    }

    #[test]
    fn test_guard_terminates_on_corrupt_graph() {
        let mut graph = chain();
        graph.insert_reference(3, 1);
        assert!(can_add_reference(&graph, 2, 10));
        assert!(!can_add_reference(&graph, 3, 2));
    }
}
