//! Set-based media filtering over tag closures.
//!
//! Active tags combine with AND: a media item survives when, for every
//! active tag, it carries some tag in that tag's closure. Excluded tags
//! combine with OR and are subtracted afterwards. The untagged pseudo-tag
//! stands for media carrying no tag at all.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;
use tokio::sync::watch;

use crate::db::{TagId, UNTAGGED};
use crate::graph::TagGraph;
use crate::media::MediaItem;

/// Filter `all_media`, preserving its order.
pub fn evaluate(
    graph: &TagGraph,
    all_media: &[MediaItem],
    active: &BTreeSet<TagId>,
    excluded: &BTreeSet<TagId>,
) -> Vec<MediaItem> {
    if active.is_empty() && excluded.is_empty() {
        return all_media.to_vec();
    }

    let tagged = graph.tagged_paths();

    // None means "no restriction from the active set".
    let allowed: Option<HashSet<&str>> = if active.len() == 1 && active.contains(&UNTAGGED) {
        Some(
            all_media
                .iter()
                .map(|item| item.path.as_str())
                .filter(|path| !tagged.contains(path))
                .collect(),
        )
    } else {
        intersect_closures(graph, active.iter().copied().filter(|id| *id != UNTAGGED))
    };

    if allowed.as_ref().is_some_and(HashSet::is_empty) {
        return Vec::new();
    }

    let mut rejected: HashSet<&str> = HashSet::new();
    for &tag in excluded {
        if tag == UNTAGGED {
            rejected.extend(
                all_media
                    .iter()
                    .map(|item| item.path.as_str())
                    .filter(|path| !tagged.contains(path)),
            );
        } else {
            rejected.extend(graph.closure_paths(tag));
        }
    }

    all_media
        .iter()
        .filter(|item| {
            let path = item.path.as_str();
            allowed.as_ref().map_or(true, |set| set.contains(path)) && !rejected.contains(path)
        })
        .cloned()
        .collect()
}

/// Intersection of the closure path sets of `tags`, stopping as soon as it
/// becomes empty. `None` when `tags` is empty.
fn intersect_closures<I>(graph: &TagGraph, tags: I) -> Option<HashSet<&str>>
where
    I: IntoIterator<Item = TagId>,
{
    let mut running: Option<HashSet<&str>> = None;
    for tag in tags {
        let paths = graph.closure_paths(tag);
        let next = match running {
            None => paths,
            Some(current) => current.into_iter().filter(|p| paths.contains(p)).collect(),
        };
        if next.is_empty() {
            return Some(next);
        }
        running = Some(next);
    }
    running
}

/// What the user has selected. A tag is never both active and excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterState {
    active: BTreeSet<TagId>,
    excluded: BTreeSet<TagId>,
}

/// Where a tag currently sits in the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMark {
    None,
    Active,
    Excluded,
}

impl FilterState {
    pub fn new<A, E>(active: A, excluded: E) -> Self
    where
        A: IntoIterator<Item = TagId>,
        E: IntoIterator<Item = TagId>,
    {
        let excluded: BTreeSet<TagId> = excluded.into_iter().collect();
        let active = active
            .into_iter()
            .filter(|id| !excluded.contains(id))
            .collect();
        Self { active, excluded }
    }

    pub fn active(&self) -> &BTreeSet<TagId> {
        &self.active
    }

    pub fn excluded(&self) -> &BTreeSet<TagId> {
        &self.excluded
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.excluded.is_empty()
    }

    pub fn mark(&self, tag: TagId) -> FilterMark {
        if self.active.contains(&tag) {
            FilterMark::Active
        } else if self.excluded.contains(&tag) {
            FilterMark::Excluded
        } else {
            FilterMark::None
        }
    }

    /// Cycle `tag` through none, active, excluded and back to none.
    pub fn toggle(&mut self, tag: TagId) -> FilterMark {
        match self.mark(tag) {
            FilterMark::None => self.activate(tag),
            FilterMark::Active => self.exclude(tag),
            FilterMark::Excluded => {
                self.excluded.remove(&tag);
            }
        }
        self.mark(tag)
    }

    pub fn activate(&mut self, tag: TagId) {
        self.excluded.remove(&tag);
        self.active.insert(tag);
    }

    pub fn exclude(&mut self, tag: TagId) {
        self.active.remove(&tag);
        self.excluded.insert(tag);
    }

    /// Forget `tag` entirely, e.g. after it was deleted.
    pub fn remove(&mut self, tag: TagId) -> bool {
        self.active.remove(&tag) | self.excluded.remove(&tag)
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.excluded.clear();
    }
}

/// Inputs that fully determine a filter result. Equal fingerprints mean the
/// previous result can be reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterFingerprint {
    pub active: Vec<TagId>,
    pub excluded: Vec<TagId>,
    pub media_count: usize,
    pub graph_version: u64,
}

impl FilterFingerprint {
    pub fn new(state: &FilterState, media_count: usize, graph_version: u64) -> Self {
        Self {
            active: state.active.iter().copied().collect(),
            excluded: state.excluded.iter().copied().collect(),
            media_count,
            graph_version,
        }
    }
}

/// The most recently published filter result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilteredMedia {
    pub items: Vec<MediaItem>,
    pub fingerprint: Option<FilterFingerprint>,
}

/// Filter selection plus the last published result.
pub struct FilterEngine {
    state: Mutex<FilterState>,
    publisher: watch::Sender<FilteredMedia>,
}

impl FilterEngine {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(FilteredMedia::default());
        Self {
            state: Mutex::new(FilterState::default()),
            publisher,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FilteredMedia> {
        self.publisher.subscribe()
    }

    pub fn state(&self) -> FilterState {
        self.lock_state().clone()
    }

    /// Apply `f` to the selection. Returns whether anything changed.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut FilterState),
    {
        let mut state = self.lock_state();
        let before = state.clone();
        f(&mut state);
        *state != before
    }

    /// The published result, if it was computed from `fingerprint`.
    pub fn reusable(&self, fingerprint: &FilterFingerprint) -> Option<Vec<MediaItem>> {
        let current = self.publisher.borrow();
        (current.fingerprint.as_ref() == Some(fingerprint)).then(|| current.items.clone())
    }

    pub fn publish(&self, fingerprint: FilterFingerprint, items: Vec<MediaItem>) {
        self.publisher.send_replace(FilteredMedia {
            items,
            fingerprint: Some(fingerprint),
        });
    }

    pub fn latest(&self) -> FilteredMedia {
        self.publisher.borrow().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FilterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new()
    }
}
