//! The single entry point for mutating and querying the tag graph.
//!
//! Every store access runs on the blocking pool behind one lock. Structural
//! checks and the write they guard happen inside the same lock acquisition
//! and transaction. After a change the service bumps its version, drops the
//! affected statistics, republishes the tree and schedules a filter refresh.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cycle;
use crate::db::{Tag, TagId, TagStore, UNTAGGED};
use crate::error::{GraphError, Result};
use crate::filter::{self, FilterEngine, FilterFingerprint, FilterMark, FilterState, FilteredMedia};
use crate::graph::TagGraph;
use crate::media::{MediaItem, MediaSource};
use crate::outcome::BatchOutcome;
use crate::stats::{self, StatisticsEngine, StatisticsMap, TagStatistics};
use crate::tasks::{Debouncer, Ticket};
use crate::tree::TagTree;
use crate::undo::{self, DeletedTagSnapshot, RestoreReport, UndoCache, UndoState};

struct Inner {
    store: Arc<Mutex<TagStore>>,
    media: Arc<dyn MediaSource>,
    stats: StatisticsEngine,
    filter: FilterEngine,
    filter_debounce: Debouncer,
    undo: Arc<UndoCache>,
    /// Bumped by every structural or media change.
    version: AtomicU64,
    tree: watch::Sender<TagTree>,
}

/// Result of a write together with the graph on either side of it.
struct Mutation<R> {
    value: R,
    before: TagGraph,
    after: TagGraph,
}

#[derive(Clone)]
pub struct TagGraphService {
    inner: Arc<Inner>,
}

impl TagGraphService {
    pub fn new(store: TagStore, media: Arc<dyn MediaSource>, config: &Config) -> Self {
        let (tree, _) = watch::channel(TagTree::default());
        Self {
            inner: Arc::new(Inner {
                store: Arc::new(Mutex::new(store)),
                media,
                stats: StatisticsEngine::new(),
                filter: FilterEngine::new(),
                filter_debounce: Debouncer::new(Duration::from_millis(config.filter.debounce_ms)),
                undo: UndoCache::new(Duration::from_millis(config.undo.window_ms)),
                version: AtomicU64::new(0),
                tree,
            }),
        }
    }

    /// Open the configured store and publish the initial tree.
    pub async fn open(config: &Config, media: Arc<dyn MediaSource>) -> Result<Self> {
        let config_owned = config.clone();
        let store = tokio::task::spawn_blocking(move || crate::db::open(&config_owned)).await??;
        let service = Self::new(store, media, config);
        service.refresh_tree().await?;
        Ok(service)
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Store access
    // ========================================================================

    async fn with_store<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TagStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|_| GraphError::Poisoned)?;
            f(&guard)
        })
        .await?
    }

    /// Run `f` in one transaction, handing it the graph as it was before.
    async fn mutate<R, F>(&self, f: F) -> Result<Mutation<R>>
    where
        F: FnOnce(&TagStore, &TagGraph) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.with_store(move |store| {
            store.atomically(|store| {
                let before = store.load_graph()?;
                let value = f(store, &before)?;
                let after = store.load_graph()?;
                Ok(Mutation {
                    value,
                    before,
                    after,
                })
            })
        })
        .await
    }

    pub async fn graph(&self) -> Result<TagGraph> {
        self.with_store(|store| store.load_graph()).await
    }

    async fn universe(&self) -> Result<Vec<MediaItem>> {
        let media = self.inner.media.clone();
        tokio::task::spawn_blocking(move || media.media()).await?
    }

    // ========================================================================
    // Change propagation
    // ========================================================================

    /// Drop statistics for `tags` and everything depending on them in both
    /// graphs, then republish.
    async fn changed<R>(
        &self,
        mutation: &Mutation<R>,
        tags: &[TagId],
        untagged: bool,
        structural: bool,
    ) -> Result<()> {
        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut keys = BTreeSet::new();
        for &tag in tags {
            keys.extend(stats::dependents(&mutation.before, tag));
            keys.extend(stats::dependents(&mutation.after, tag));
        }
        if untagged {
            keys.insert(UNTAGGED);
        }
        debug!(version, ?keys, "Graph changed");
        self.inner.stats.invalidate_keys(keys);

        if structural {
            self.refresh_tree().await?;
        }
        self.schedule_filter_refresh();
        Ok(())
    }

    /// A change that only affects how the tree is shown: names, order or
    /// expansion. Statistics and filter results stay valid.
    async fn tree_changed(&self) -> Result<()> {
        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(version, "Tree changed");
        self.refresh_tree().await
    }

    // ========================================================================
    // Tags
    // ========================================================================

    pub async fn create_tag(&self, name: &str, parent_id: Option<TagId>) -> Result<TagId> {
        let name = name.to_string();
        let mutation = self
            .mutate(move |store, _| store.create_tag(&name, parent_id))
            .await?;
        let id = mutation.value;
        self.changed(&mutation, &[id], false, true).await?;
        Ok(id)
    }

    pub async fn get_or_create_tag(&self, name: &str) -> Result<Tag> {
        let name = name.to_string();
        let mutation = self
            .mutate(move |store, _| store.get_or_create_tag(&name))
            .await?;
        if !mutation.before.contains(mutation.value.id) {
            self.changed(&mutation, &[mutation.value.id], false, true)
                .await?;
        }
        Ok(mutation.value)
    }

    pub async fn rename_tag(&self, id: TagId, name: &str) -> Result<()> {
        let name = name.to_string();
        self.with_store(move |store| store.rename_tag(id, &name))
            .await?;
        info!(id, "Renamed tag");
        self.tree_changed().await
    }

    pub async fn set_expanded(&self, id: TagId, expanded: bool) -> Result<()> {
        self.with_store(move |store| store.set_expanded(id, expanded))
            .await?;
        self.tree_changed().await
    }

    /// Move `id` under `parent_id` (or to the root). Returns `false`, leaving
    /// the graph unchanged, when the move would create a cycle.
    pub async fn set_hierarchy_parent(&self, id: TagId, parent_id: Option<TagId>) -> Result<bool> {
        let mutation = self
            .mutate(move |store, graph| {
                store.require_tag(id)?;
                if let Some(parent) = parent_id {
                    store.require_tag(parent)?;
                }
                if !cycle::can_set_parent(graph, id, parent_id) {
                    return Ok(false);
                }
                store.set_hierarchy_parent(id, parent_id)?;
                Ok(true)
            })
            .await?;
        if !mutation.value {
            warn!(id, ?parent_id, "Rejected reparent that would create a cycle");
            return Ok(false);
        }
        info!(id, ?parent_id, "Reparented tag");
        self.changed(&mutation, &[id], false, true).await?;
        Ok(true)
    }

    /// Add a reference edge. Returns `false`, leaving the graph unchanged,
    /// when the edge would create a cycle, already exists, or involves the
    /// untagged pseudo-tag.
    pub async fn add_reference(&self, parent: TagId, child: TagId) -> Result<bool> {
        if parent == UNTAGGED || child == UNTAGGED {
            return Ok(false);
        }
        let mutation = self
            .mutate(move |store, graph| {
                store.require_tag(parent)?;
                store.require_tag(child)?;
                if !cycle::can_add_reference(graph, parent, child) {
                    warn!(parent, child, "Rejected reference that would create a cycle");
                    return Ok(false);
                }
                store.add_reference(parent, child)
            })
            .await?;
        if !mutation.value {
            return Ok(false);
        }
        info!(parent, child, "Added reference");
        self.changed(&mutation, &[parent, child], false, true).await?;
        Ok(true)
    }

    pub async fn remove_reference(&self, parent: TagId, child: TagId) -> Result<bool> {
        let mutation = self
            .mutate(move |store, _| store.remove_reference(parent, child))
            .await?;
        if !mutation.value {
            return Ok(false);
        }
        info!(parent, child, "Removed reference");
        self.changed(&mutation, &[parent, child], false, true).await?;
        Ok(true)
    }

    pub async fn move_tag(&self, id: TagId, target_index: usize) -> Result<()> {
        self.with_store(move |store| store.move_tag(id, target_index))
            .await?;
        self.tree_changed().await
    }

    pub async fn move_reference(&self, parent: TagId, child: TagId, target_index: usize) -> Result<bool> {
        let moved = self
            .with_store(move |store| store.move_reference(parent, child, target_index))
            .await?;
        if moved {
            self.tree_changed().await?;
        }
        Ok(moved)
    }

    /// Delete a tag and hold its snapshot for the undo window.
    pub async fn delete_tag(&self, id: TagId) -> Result<()> {
        let mutation = self
            .mutate(move |store, _| {
                let snapshot = DeletedTagSnapshot::capture(store, id)?;
                store.delete_tag(id)?;
                Ok(snapshot)
            })
            .await?;

        // Targets of its references each lost an incoming edge.
        let mut touched = vec![id];
        touched.extend(mutation.value.outgoing_references.iter().map(|edge| edge.child_tag_id));

        self.inner.undo.arm(mutation.value.clone());
        info!(
            id,
            window_ms = self.inner.undo.window().as_millis() as u64,
            "Deleted tag, undo available"
        );
        if self.inner.filter.update(|state| {
            state.remove(id);
        }) {
            debug!(id, "Dropped deleted tag from the filter");
        }
        self.changed(&mutation, &touched, true, true).await
    }

    /// Restore the most recently deleted tag under a new id. `None` when
    /// there is nothing to restore or the undo window has closed.
    pub async fn restore_deleted(&self) -> Result<Option<RestoreReport>> {
        let Some(claim) = self.inner.undo.take_for_restore() else {
            return Ok(None);
        };
        let generation = claim.generation;
        let snapshot = claim.snapshot;
        let old_id = snapshot.tag.id;
        let referenced: Vec<TagId> = snapshot
            .outgoing_references
            .iter()
            .map(|edge| edge.child_tag_id)
            .collect();
        let result = self
            .mutate(move |store, _| undo::replay(store, &snapshot))
            .await;
        let mutation = match result {
            Ok(mutation) => mutation,
            Err(e) => {
                self.inner.undo.mark_failed(generation, old_id);
                return Err(e);
            }
        };
        let report = mutation.value;
        self.inner.undo.mark_restored(generation, old_id, report.new_id);

        let mut touched = vec![report.new_id];
        touched.extend(referenced.into_iter().filter(|&tag| mutation.after.contains(tag)));
        self.changed(&mutation, &touched, true, true).await?;
        Ok(Some(report))
    }

    pub fn dismiss_undo(&self) -> bool {
        self.inner.undo.dismiss()
    }

    pub fn undo_state(&self) -> UndoState {
        self.inner.undo.state()
    }

    // ========================================================================
    // Media associations
    // ========================================================================

    /// Apply every tag in `tag_ids` to every path. Items that fail are
    /// counted and skipped.
    pub async fn apply_tags(&self, tag_ids: &[TagId], paths: &[String]) -> Result<BatchOutcome> {
        self.change_media(tag_ids, paths, true).await
    }

    pub async fn remove_tags(&self, tag_ids: &[TagId], paths: &[String]) -> Result<BatchOutcome> {
        self.change_media(tag_ids, paths, false).await
    }

    async fn change_media(&self, tag_ids: &[TagId], paths: &[String], apply: bool) -> Result<BatchOutcome> {
        let tags = tag_ids.to_vec();
        let paths = paths.to_vec();
        let mutation = self
            .mutate(move |store, _| {
                let mut outcome = BatchOutcome::new();
                for &tag in &tags {
                    for path in &paths {
                        let result = if apply {
                            store.add_media_tag(path, tag)
                        } else {
                            store.remove_media_tag(path, tag)
                        };
                        match result {
                            Ok(_) => outcome.success(),
                            Err(e) if e.is_item_failure() => {
                                debug!(tag, path = %path, "Skipped: {}", e);
                                outcome.failure();
                            }
                            Err(e) => {
                                warn!(tag, path = %path, "Failed to update media tag: {}", e);
                                outcome.failure();
                            }
                        }
                    }
                }
                Ok(outcome)
            })
            .await?;

        let outcome = mutation.value;
        let action = if apply { "Tagged" } else { "Untagged" };
        info!("{}", outcome.summary(action));
        self.changed(&mutation, tag_ids, true, false).await?;
        Ok(outcome)
    }

    /// Re-point associations after a media item was moved.
    pub async fn update_media_path(&self, old_path: &str, new_path: &str) -> Result<usize> {
        let old = old_path.to_string();
        let new = new_path.to_string();
        let mutation = self
            .mutate(move |store, _| {
                let tags: Vec<TagId> = store.tags_for_media(&old)?.iter().map(|t| t.id).collect();
                let moved = store.update_media_path(&old, &new)?;
                Ok((tags, moved))
            })
            .await?;
        let (tags, moved) = (mutation.value.0.clone(), mutation.value.1);
        self.changed(&mutation, &tags, true, false).await?;
        Ok(moved)
    }

    /// Drop associations for paths no longer in the media universe.
    pub async fn prune_missing_media(&self) -> Result<usize> {
        let present: HashSet<String> = self
            .universe()
            .await?
            .into_iter()
            .map(|item| item.path)
            .collect();
        let mutation = self
            .mutate(move |store, _| {
                let missing: Vec<String> = store
                    .get_all_tagged_paths()?
                    .into_iter()
                    .filter(|path| !present.contains(path))
                    .collect();
                store.remove_media_paths(missing.iter().map(String::as_str))
            })
            .await?;
        let removed = mutation.value;
        if removed > 0 {
            info!(removed, "Pruned associations for missing media");
            self.inner.stats.clear();
            self.changed(&mutation, &[], true, false).await?;
        }
        Ok(removed)
    }

    /// The media universe changed outside the graph.
    pub fn media_changed(&self) {
        self.inner.version.fetch_add(1, Ordering::SeqCst);
        self.inner.stats.invalidate_keys([UNTAGGED]);
        self.schedule_filter_refresh();
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_tag(&self, id: TagId) -> Result<Option<Tag>> {
        self.with_store(move |store| store.get_tag(id)).await
    }

    pub async fn all_tags(&self) -> Result<Vec<Tag>> {
        self.with_store(|store| store.get_all_tags()).await
    }

    pub async fn find_tag(&self, name: &str) -> Result<Option<Tag>> {
        let name = name.to_string();
        self.with_store(move |store| store.find_tag_by_name(&name))
            .await
    }

    pub async fn search_tags(&self, prefix: &str) -> Result<Vec<Tag>> {
        let prefix = prefix.to_string();
        self.with_store(move |store| store.search_tags(&prefix))
            .await
    }

    pub async fn tags_for_media(&self, path: &str) -> Result<Vec<Tag>> {
        let path = path.to_string();
        self.with_store(move |store| store.tags_for_media(&path))
            .await
    }

    pub async fn ancestors(&self, id: TagId) -> Result<BTreeSet<TagId>> {
        self.with_store(move |store| store.get_ancestors(id)).await
    }

    pub async fn descendants(&self, id: TagId) -> Result<BTreeSet<TagId>> {
        self.with_store(move |store| store.get_descendants(id))
            .await
    }

    pub async fn closure(&self, id: TagId) -> Result<BTreeSet<TagId>> {
        let graph = self.graph().await?;
        if !graph.contains(id) {
            return Err(GraphError::NotFound(id));
        }
        Ok(graph.closure(id))
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Statistics for `tag`, computed now unless cached.
    pub async fn statistics(&self, tag: TagId) -> Result<TagStatistics> {
        if let Some(cached) = self.inner.stats.cached(tag) {
            return Ok(cached);
        }
        let ticket = self.inner.stats.begin(tag);
        self.compute_statistics(ticket).await
    }

    /// Compute statistics for `tag` in the background, superseding any
    /// computation already running for it.
    pub fn request_statistics(&self, tag: TagId) {
        let ticket = self.inner.stats.begin(tag);
        let service = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = service.compute_statistics(ticket).await {
                warn!(tag, "Statistics computation failed: {}", e);
            }
        });
        self.inner.stats.attach(ticket, handle.abort_handle());
    }

    /// Request statistics for every tag and the untagged pseudo-tag.
    pub async fn refresh_all_statistics(&self) -> Result<()> {
        let graph = self.graph().await?;
        for tag in graph.tag_ids().chain([UNTAGGED]) {
            self.request_statistics(tag);
        }
        Ok(())
    }

    pub fn cached_statistics(&self) -> StatisticsMap {
        self.inner.stats.snapshot()
    }

    pub fn subscribe_statistics(&self) -> watch::Receiver<StatisticsMap> {
        self.inner.stats.subscribe()
    }

    async fn compute_statistics(&self, ticket: Ticket<TagId>) -> Result<TagStatistics> {
        let tag = ticket.key;
        let graph = self.graph().await?;
        if tag != UNTAGGED && !graph.contains(tag) {
            self.inner.stats.invalidate_keys([tag]);
            return Err(GraphError::NotFound(tag));
        }
        let universe = if tag == UNTAGGED {
            self.universe().await?
        } else {
            Vec::new()
        };

        let computed = stats::compute(&graph, &universe, tag);
        if self.inner.stats.complete(ticket, computed) && tag != UNTAGGED {
            let total = computed.total_image_count as i64;
            self.with_store(move |store| store.set_cached_image_count(tag, total))
                .await?;
        }
        Ok(computed)
    }

    // ========================================================================
    // Tree
    // ========================================================================

    pub async fn tree(&self) -> Result<TagTree> {
        let version = self.version();
        self.with_store(move |store| {
            let tags = store.get_all_tags()?;
            let references = store.all_references()?;
            Ok(TagTree::build(version, &tags, &references))
        })
        .await
    }

    pub fn subscribe_tree(&self) -> watch::Receiver<TagTree> {
        self.inner.tree.subscribe()
    }

    async fn refresh_tree(&self) -> Result<()> {
        let tree = self.tree().await?;
        self.inner.tree.send_replace(tree);
        Ok(())
    }

    // ========================================================================
    // Filter
    // ========================================================================

    pub fn filter_state(&self) -> FilterState {
        self.inner.filter.state()
    }

    pub fn set_filter(&self, state: FilterState) {
        if self.inner.filter.update(|current| *current = state) {
            self.schedule_filter_refresh();
        }
    }

    /// Cycle a tag through none, active and excluded.
    pub fn toggle_filter(&self, tag: TagId) -> FilterMark {
        let mut mark = FilterMark::None;
        self.inner.filter.update(|state| mark = state.toggle(tag));
        self.schedule_filter_refresh();
        mark
    }

    pub fn clear_filter(&self) {
        if self.inner.filter.update(FilterState::clear) {
            self.schedule_filter_refresh();
        }
    }

    /// Evaluate the current filter now, reusing the last result when its
    /// inputs have not changed. Supersedes any pending background refresh.
    pub async fn filtered_media(&self) -> Result<Vec<MediaItem>> {
        self.inner.filter_debounce.cancel();
        self.evaluate_filter().await
    }

    async fn evaluate_filter(&self) -> Result<Vec<MediaItem>> {
        let state = self.inner.filter.state();
        let version = self.version();
        let universe = self.universe().await?;
        let fingerprint = FilterFingerprint::new(&state, universe.len(), version);
        if let Some(items) = self.inner.filter.reusable(&fingerprint) {
            debug!("Filter inputs unchanged, reusing result");
            return Ok(items);
        }

        let items = if state.is_empty() {
            universe
        } else {
            let graph = self.graph().await?;
            filter::evaluate(&graph, &universe, state.active(), state.excluded())
        };
        debug!(count = items.len(), "Filter evaluated");
        self.inner.filter.publish(fingerprint, items.clone());
        Ok(items)
    }

    pub fn latest_filtered(&self) -> FilteredMedia {
        self.inner.filter.latest()
    }

    pub fn subscribe_filtered(&self) -> watch::Receiver<FilteredMedia> {
        self.inner.filter.subscribe()
    }

    fn schedule_filter_refresh(&self) {
        let service = self.clone();
        self.inner.filter_debounce.schedule(async move {
            if let Err(e) = service.evaluate_filter().await {
                warn!("Filter refresh failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SortGroup;
    use crate::media::StaticMediaSource;

    fn config() -> Config {
        let mut config = Config::default();
        config.filter.debounce_ms = 10;
        config
    }

    fn service_with(paths: &[&str]) -> (TagGraphService, Arc<StaticMediaSource>) {
        let store = TagStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let media = Arc::new(StaticMediaSource::from_paths(paths.iter().copied()));
        let service = TagGraphService::new(store, media.clone(), &config());
        (service, media)
    }

    fn strings(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    async fn closure_paths(service: &TagGraphService, tag: TagId) -> BTreeSet<String> {
        let graph = service.graph().await.unwrap();
        graph
            .closure_paths(tag)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_undo_round_trip() {
        let (service, _) = service_with(&["/a", "/b", "/c"]);
        let doomed = service.create_tag("doomed", None).await.unwrap();
        let child = service.create_tag("child", Some(doomed)).await.unwrap();
        let target = service.create_tag("target", None).await.unwrap();
        assert!(service.add_reference(doomed, target).await.unwrap());
        service
            .apply_tags(&[doomed], &strings(&["/a", "/b"]))
            .await
            .unwrap();
        service.apply_tags(&[target], &strings(&["/c"])).await.unwrap();

        let before_paths = closure_paths(&service, doomed).await;
        let before_descendants = service.descendants(doomed).await.unwrap();

        service.delete_tag(doomed).await.unwrap();
        assert!(service.get_tag(doomed).await.unwrap().is_none());
        assert!(matches!(service.undo_state(), UndoState::Deleted { tag_id, .. } if tag_id == doomed));

        let report = service.restore_deleted().await.unwrap().unwrap();
        assert!(report.is_complete());
        assert_ne!(report.new_id, doomed);
        assert_eq!(report.media.succeeded, 2);

        assert_eq!(closure_paths(&service, report.new_id).await, before_paths);
        assert_eq!(
            service.descendants(report.new_id).await.unwrap(),
            before_descendants
        );
        let graph = service.graph().await.unwrap();
        assert_eq!(graph.hierarchy_children(report.new_id), &[child]);
        assert_eq!(graph.reference_children(report.new_id), &[target]);
        assert_eq!(
            service.undo_state(),
            UndoState::Restored {
                old_id: doomed,
                new_id: report.new_id
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_after_window_is_noop() {
        let (service, _) = service_with(&["/a"]);
        let id = service.create_tag("gone", None).await.unwrap();
        service.delete_tag(id).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(service.restore_deleted().await.unwrap().is_none());
        assert!(service.all_tags().await.unwrap().is_empty());
        assert_eq!(service.undo_state(), UndoState::Expired { tag_id: id });
    }

    #[tokio::test]
    async fn test_cycle_rejection_leaves_edges_unchanged() {
        let (service, _) = service_with(&[]);
        let a = service.create_tag("a", None).await.unwrap();
        let b = service.create_tag("b", None).await.unwrap();
        let c = service.create_tag("c", Some(b)).await.unwrap();
        assert!(service.add_reference(a, b).await.unwrap());

        let before = service.graph().await.unwrap();
        assert!(!service.add_reference(c, a).await.unwrap());
        assert!(!service.add_reference(b, a).await.unwrap());
        assert!(!service.add_reference(a, a).await.unwrap());
        assert!(!service.add_reference(UNTAGGED, a).await.unwrap());
        assert!(!service.set_hierarchy_parent(b, Some(c)).await.unwrap());

        let after = service.graph().await.unwrap();
        for tag in [a, b, c] {
            assert_eq!(before.reference_children(tag), after.reference_children(tag));
            assert_eq!(before.hierarchy_parent(tag), after.hierarchy_parent(tag));
        }
        assert!(matches!(
            service.set_hierarchy_parent(UNTAGGED, None).await,
            Err(GraphError::ReservedTag(_))
        ));
    }

    #[tokio::test]
    async fn test_statistics_match_closure_after_mutations() {
        let (service, _) = service_with(&["/1", "/2", "/3", "/4", "/5"]);
        let animals = service.create_tag("animals", None).await.unwrap();
        let cats = service.create_tag("cats", Some(animals)).await.unwrap();
        let pets = service.create_tag("pets", None).await.unwrap();
        let dogs = service.create_tag("dogs", None).await.unwrap();

        service
            .apply_tags(&[cats], &strings(&["/1", "/2"]))
            .await
            .unwrap();
        service.apply_tags(&[dogs], &strings(&["/3"])).await.unwrap();
        service.apply_tags(&[animals], &strings(&["/2"])).await.unwrap();

        // Populate the cache, then mutate so it must be invalidated.
        for tag in [animals, cats, pets, dogs, UNTAGGED] {
            service.statistics(tag).await.unwrap();
        }
        service.add_reference(pets, cats).await.unwrap();
        service.add_reference(pets, dogs).await.unwrap();
        service.set_hierarchy_parent(dogs, Some(animals)).await.unwrap();
        service.remove_tags(&[cats], &strings(&["/1"])).await.unwrap();

        for tag in [animals, cats, pets, dogs] {
            let stats = service.statistics(tag).await.unwrap();
            assert_eq!(
                stats.total_image_count,
                closure_paths(&service, tag).await.len(),
                "tag {tag}"
            );
        }
        assert_eq!(service.statistics(pets).await.unwrap().total_image_count, 2);
        assert_eq!(service.statistics(cats).await.unwrap().referenced_count, 1);
        assert_eq!(service.statistics(UNTAGGED).await.unwrap().total_image_count, 3);

        let stored = service.get_tag(animals).await.unwrap().unwrap();
        assert_eq!(stored.cached_image_count, 2);
    }

    #[tokio::test]
    async fn test_batch_counts_failures() {
        let (service, _) = service_with(&["/a", "/b"]);
        let tag = service.create_tag("t", None).await.unwrap();
        let outcome = service
            .apply_tags(&[tag, 404, UNTAGGED], &strings(&["/a", "/b"]))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 4);
        assert_eq!(service.tags_for_media("/a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sort_orders_stay_unique() {
        let (service, _) = service_with(&[]);
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(service.create_tag(&format!("t{i}"), None).await.unwrap());
        }
        for round in 0..40usize {
            let id = ids[(round * 5) % ids.len()];
            match round % 4 {
                0 | 1 => service.move_tag(id, (round * 3) % ids.len()).await.unwrap(),
                2 => {
                    let other = ids[(round * 7 + 1) % ids.len()];
                    service.add_reference(id, other).await.unwrap();
                }
                _ => {
                    let other = ids[(round * 7 + 1) % ids.len()];
                    service.remove_reference(id, other).await.unwrap();
                }
            }
        }

        let tags = service.all_tags().await.unwrap();
        let graph = service.graph().await.unwrap();
        for group in [SortGroup::Normal, SortGroup::Referenced] {
            let keys: Vec<i64> = tags
                .iter()
                .filter(|t| {
                    SortGroup::for_reference_count(graph.reference_children(t.id).len()) == group
                })
                .map(|t| t.sort_order(group))
                .collect();
            let unique: HashSet<i64> = keys.iter().copied().collect();
            assert_eq!(keys.len(), unique.len(), "{group:?}");
        }
    }

    #[tokio::test]
    async fn test_filter_results() {
        let (service, _) = service_with(&["a", "b", "c", "d"]);
        let one = service.create_tag("one", None).await.unwrap();
        let two = service.create_tag("two", None).await.unwrap();
        service.apply_tags(&[one], &strings(&["a", "c"])).await.unwrap();
        service.apply_tags(&[two], &strings(&["b", "c"])).await.unwrap();

        let paths = |items: Vec<MediaItem>| -> Vec<String> {
            items.into_iter().map(|item| item.path).collect()
        };

        service.set_filter(FilterState::new([one, two], []));
        assert_eq!(paths(service.filtered_media().await.unwrap()), vec!["c"]);

        service.set_filter(FilterState::new([], [two]));
        assert_eq!(paths(service.filtered_media().await.unwrap()), vec!["a", "d"]);

        service.set_filter(FilterState::new([UNTAGGED], []));
        assert_eq!(paths(service.filtered_media().await.unwrap()), vec!["d"]);

        // Deleting a filtered tag removes it from the selection.
        service.set_filter(FilterState::new([one], []));
        service.delete_tag(one).await.unwrap();
        assert!(service.filter_state().is_empty());
    }

    #[tokio::test]
    async fn test_filter_change_is_published() {
        let (service, media) = service_with(&["a", "b"]);
        let tag = service.create_tag("t", None).await.unwrap();
        service.apply_tags(&[tag], &strings(&["a"])).await.unwrap();

        let mut rx = service.subscribe_filtered();
        assert_eq!(service.toggle_filter(tag), FilterMark::Active);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                rx.changed().await.unwrap();
                let latest = rx.borrow_and_update().clone();
                if latest.fingerprint.as_ref().is_some_and(|f| f.active == vec![tag]) {
                    assert_eq!(latest.items.len(), 1);
                    break;
                }
            }
        })
        .await
        .unwrap();

        media
            .replace(vec![MediaItem::new("a", 1), MediaItem::new("z", 2)])
            .unwrap();
        service.media_changed();
        service.prune_missing_media().await.unwrap();
        assert_eq!(service.statistics(UNTAGGED).await.unwrap().total_image_count, 1);
    }

    #[tokio::test]
    async fn test_tree_is_published_on_structural_change() {
        let (service, _) = service_with(&[]);
        let rx = service.subscribe_tree();
        let parent = service.create_tag("parent", None).await.unwrap();
        let child = service.create_tag("child", Some(parent)).await.unwrap();
        let other = service.create_tag("other", None).await.unwrap();
        service.add_reference(other, child).await.unwrap();

        let tree = rx.borrow().clone();
        assert_eq!(tree.roots[0].tag.id, other);
        assert_eq!(tree.roots[0].referenced[0].tag.id, child);
        assert_eq!(tree.find(parent).unwrap().children[0].tag.id, child);
        assert_eq!(tree.version, service.version());
    }

    #[tokio::test]
    async fn test_background_statistics_publish() {
        let (service, _) = service_with(&["a"]);
        let tag = service.create_tag("t", None).await.unwrap();
        service.apply_tags(&[tag], &strings(&["a"])).await.unwrap();

        let mut rx = service.subscribe_statistics();
        service.refresh_all_statistics().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().len() == 2 {
                    break;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(service.cached_statistics()[&tag].direct_image_count, 1);
        assert_eq!(service.cached_statistics()[&UNTAGGED].total_image_count, 0);
    }

    #[tokio::test]
    async fn test_reference_changes_refresh_child_statistics() {
        let (service, _) = service_with(&["/a"]);
        let parent = service.create_tag("parent", None).await.unwrap();
        let child = service.create_tag("child", None).await.unwrap();
        let other = service.create_tag("other", None).await.unwrap();
        assert_eq!(service.statistics(child).await.unwrap().referenced_count, 0);

        assert!(service.add_reference(parent, child).await.unwrap());
        assert_eq!(service.statistics(child).await.unwrap().referenced_count, 1);

        assert!(service.remove_reference(parent, child).await.unwrap());
        assert_eq!(service.statistics(child).await.unwrap().referenced_count, 0);

        // Deleting a referencing tag takes an incoming edge away too.
        assert!(service.add_reference(other, child).await.unwrap());
        assert_eq!(service.statistics(child).await.unwrap().referenced_count, 1);
        service.delete_tag(other).await.unwrap();
        assert_eq!(service.statistics(child).await.unwrap().referenced_count, 0);

        service.restore_deleted().await.unwrap().unwrap();
        let graph = service.graph().await.unwrap();
        let fresh = stats::compute(&graph, &[], child);
        assert_eq!(service.statistics(child).await.unwrap(), fresh);
        assert_eq!(fresh.referenced_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_conflicting_mutations_keep_graph_acyclic() {
        let (service, _) = service_with(&[]);
        for round in 0..25 {
            let a = service.create_tag(&format!("a{round}"), None).await.unwrap();
            let b = service.create_tag(&format!("b{round}"), None).await.unwrap();

            let (left, right) = (service.clone(), service.clone());
            let (ab, ba) = tokio::join!(
                tokio::spawn(async move { left.add_reference(a, b).await.unwrap() }),
                tokio::spawn(async move { right.add_reference(b, a).await.unwrap() }),
            );
            assert!(ab.unwrap() ^ ba.unwrap(), "round {round}");

            let c = service.create_tag(&format!("c{round}"), None).await.unwrap();
            let d = service.create_tag(&format!("d{round}"), None).await.unwrap();
            let (left, right) = (service.clone(), service.clone());
            let (referenced, moved) = tokio::join!(
                tokio::spawn(async move { left.add_reference(c, d).await.unwrap() }),
                tokio::spawn(async move { right.set_hierarchy_parent(c, Some(d)).await.unwrap() }),
            );
            assert!(referenced.unwrap() ^ moved.unwrap(), "round {round}");
        }

        let graph = service.graph().await.unwrap();
        for tag in graph.tag_ids() {
            assert!(
                graph.descendants(tag).is_disjoint(&graph.ancestors(tag)),
                "tag {tag} is on a cycle"
            );
        }
    }

    #[tokio::test]
    async fn test_reordering_advances_tree_version() {
        let (service, _) = service_with(&[]);
        let rx = service.subscribe_tree();
        let first = service.create_tag("first", None).await.unwrap();
        let second = service.create_tag("second", None).await.unwrap();
        let before = rx.borrow().version;

        service.move_tag(first, 0).await.unwrap();
        let tree = rx.borrow().clone();
        assert!(tree.version > before);
        assert_eq!(tree.version, service.version());
        assert_eq!(tree.roots[0].tag.id, first);
        assert_eq!(tree.roots[1].tag.id, second);

        service.rename_tag(second, "renamed").await.unwrap();
        let renamed = rx.borrow().clone();
        assert!(renamed.version > tree.version);
        assert_eq!(renamed.find(second).unwrap().tag.name, "renamed");
    }
}
