//! Per-tag image counts and their cache.
//!
//! Counts are derived from a `TagGraph` snapshot and the media universe and
//! are never the source of truth. Invalidating a tag also drops every
//! ancestor's entry, because their totals include it.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::db::{TagId, UNTAGGED};
use crate::graph::TagGraph;
use crate::media::MediaItem;
use crate::tasks::{KeyedTaskManager, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TagStatistics {
    pub tag_id: TagId,
    /// Media items carrying the tag itself.
    pub direct_image_count: usize,
    /// Distinct media items reachable from the tag's closure.
    pub total_image_count: usize,
    /// Tags holding a reference edge to this tag.
    pub referenced_count: usize,
}

pub type StatisticsMap = HashMap<TagId, TagStatistics>;

/// Compute statistics for `tag` against a snapshot.
pub fn compute(graph: &TagGraph, universe: &[MediaItem], tag: TagId) -> TagStatistics {
    if tag == UNTAGGED {
        let tagged = graph.tagged_paths();
        let untagged: HashSet<&str> = universe
            .iter()
            .map(|item| item.path.as_str())
            .filter(|path| !tagged.contains(path))
            .collect();
        return TagStatistics {
            tag_id: UNTAGGED,
            direct_image_count: untagged.len(),
            total_image_count: untagged.len(),
            referenced_count: 0,
        };
    }

    TagStatistics {
        tag_id: tag,
        direct_image_count: graph.direct_count(tag),
        total_image_count: graph.closure_paths(tag).len(),
        referenced_count: graph.incoming_reference_count(tag),
    }
}

/// The tag plus every tag whose aggregate depends on it.
pub fn dependents(graph: &TagGraph, tag: TagId) -> BTreeSet<TagId> {
    let mut set = graph.ancestors(tag);
    set.insert(tag);
    set
}

/// Cached statistics with keyed background computation.
pub struct StatisticsEngine {
    cache: Mutex<StatisticsMap>,
    tasks: Mutex<KeyedTaskManager<TagId>>,
    publisher: watch::Sender<StatisticsMap>,
}

impl StatisticsEngine {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(StatisticsMap::new());
        Self {
            cache: Mutex::new(StatisticsMap::new()),
            tasks: Mutex::new(KeyedTaskManager::new()),
            publisher,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatisticsMap> {
        self.publisher.subscribe()
    }

    pub fn cached(&self, tag: TagId) -> Option<TagStatistics> {
        self.lock_cache().get(&tag).copied()
    }

    pub fn snapshot(&self) -> StatisticsMap {
        self.lock_cache().clone()
    }

    /// Start a computation for `tag`, superseding any in flight.
    pub fn begin(&self, tag: TagId) -> Ticket<TagId> {
        self.lock_tasks().begin(tag)
    }

    pub fn attach(&self, ticket: Ticket<TagId>, handle: AbortHandle) {
        self.lock_tasks().attach(ticket, handle);
    }

    /// Store a finished computation. Returns `false`, discarding `stats`, when
    /// a newer computation or an invalidation happened after `ticket` was
    /// issued.
    pub fn complete(&self, ticket: Ticket<TagId>, stats: TagStatistics) -> bool {
        // Hold the task lock across the cache write so an invalidation cannot
        // slip in between the currency check and the insert.
        let mut tasks = self.lock_tasks();
        if !tasks.finish(&ticket) {
            debug!(tag = ticket.key, "Discarding superseded statistics");
            return false;
        }
        self.lock_cache().insert(stats.tag_id, stats);
        drop(tasks);
        self.publish();
        true
    }

    /// Drop the cached entry of `tag` and of everything depending on it,
    /// cancelling their in-flight computations. Returns the ids dropped.
    pub fn invalidate(&self, graph: &TagGraph, tag: TagId) -> BTreeSet<TagId> {
        let keys = dependents(graph, tag);
        self.invalidate_keys(keys.iter().copied());
        keys
    }

    pub fn invalidate_keys<I>(&self, keys: I)
    where
        I: IntoIterator<Item = TagId>,
    {
        let mut tasks = self.lock_tasks();
        let mut cache = self.lock_cache();
        let mut dropped = 0usize;
        for key in keys {
            tasks.cancel(key);
            if cache.remove(&key).is_some() {
                dropped += 1;
            }
        }
        drop(cache);
        drop(tasks);
        debug!(dropped, "Invalidated statistics");
        self.publish();
    }

    pub fn clear(&self) {
        self.lock_tasks().cancel_all();
        self.lock_cache().clear();
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.publisher.send_replace(snapshot);
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, StatisticsMap> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, KeyedTaskManager<TagId>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for StatisticsEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe(paths: &[&str]) -> Vec<MediaItem> {
        paths
            .iter()
            .enumerate()
            .map(|(i, p)| MediaItem::new(*p, i as i64))
            .collect()
    }

    fn graph() -> TagGraph {
        // animals > cats, pets references cats
        let mut graph = TagGraph::new();
        graph.insert_tag(1, None);
        graph.insert_tag(2, Some(1));
        graph.insert_tag(3, None);
        graph.insert_reference(3, 2);
        graph.insert_media(1, "a");
        graph.insert_media(2, "a");
        graph.insert_media(2, "b");
        graph
    }

    #[test]
    fn test_counts() {
        let graph = graph();
        let media = universe(&["a", "b", "c", "d"]);

        let animals = compute(&graph, &media, 1);
        assert_eq!(animals.direct_image_count, 1);
        assert_eq!(animals.total_image_count, 2);

        let cats = compute(&graph, &media, 2);
        assert_eq!(cats.direct_image_count, 2);
        assert_eq!(cats.referenced_count, 1);

        let pets = compute(&graph, &media, 3);
        assert_eq!(pets.direct_image_count, 0);
        assert_eq!(pets.total_image_count, 2);
    }

    #[test]
    fn test_untagged_counts_universe_minus_tagged() {
        let graph = graph();
        let media = universe(&["a", "b", "c", "d"]);
        let untagged = compute(&graph, &media, UNTAGGED);
        assert_eq!(untagged.total_image_count, 2);
        assert_eq!(untagged.direct_image_count, 2);
    }

    #[test]
    fn test_invalidate_drops_ancestors_only() {
        let graph = graph();
        let media = universe(&["a", "b"]);
        let engine = StatisticsEngine::new();
        for tag in [1, 2, 3] {
            let ticket = engine.begin(tag);
            assert!(engine.complete(ticket, compute(&graph, &media, tag)));
        }

        let dropped = engine.invalidate(&graph, 2);
        assert_eq!(dropped, BTreeSet::from([1, 2, 3]));
        assert!(engine.snapshot().is_empty());

        let ticket = engine.begin(1);
        engine.complete(ticket, compute(&graph, &media, 1));
        engine.invalidate(&graph, 3);
        assert!(engine.cached(1).is_some());
        assert!(engine.cached(3).is_none());
    }

    #[test]
    fn test_stale_result_is_discarded() {
        let graph = graph();
        let media = universe(&["a", "b"]);
        let engine = StatisticsEngine::new();

        let stale = engine.begin(2);
        engine.invalidate(&graph, 2);
        assert!(!engine.complete(stale, compute(&graph, &media, 2)));
        assert!(engine.cached(2).is_none());

        let old = engine.begin(2);
        let fresh = engine.begin(2);
        assert!(engine.complete(fresh, compute(&graph, &media, 2)));
        assert!(!engine.complete(old, compute(&graph, &media, 2)));
    }

    #[test]
    fn test_subscribers_see_updates() {
        let graph = graph();
        let media = universe(&["a"]);
        let engine = StatisticsEngine::new();
        let rx = engine.subscribe();
        let ticket = engine.begin(1);
        engine.complete(ticket, compute(&graph, &media, 1));
        assert!(rx.borrow().contains_key(&1));
    }
}
