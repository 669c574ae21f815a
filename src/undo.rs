//! Single-slot undo for tag deletion.
//!
//! Deleting a tag captures everything needed to rebuild it. The snapshot is
//! held for a bounded window; restoring creates a fresh tag (new id) and
//! replays each relationship category independently. A newer deletion
//! replaces the pending snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cycle;
use crate::db::{ReferenceEdge, Tag, TagId, TagStore};
use crate::error::Result;
use crate::outcome::BatchOutcome;

/// Everything a deleted tag was connected to, captured before deletion.
#[derive(Debug, Clone, Serialize)]
pub struct DeletedTagSnapshot {
    pub tag: Tag,
    pub media_paths: Vec<String>,
    pub outgoing_references: Vec<ReferenceEdge>,
    pub incoming_references: Vec<ReferenceEdge>,
    pub hierarchy_children: Vec<TagId>,
    pub deleted_at: DateTime<Utc>,
}

impl DeletedTagSnapshot {
    /// Read the tag's full relationship set. Run this in the same
    /// transaction as the delete.
    pub fn capture(store: &TagStore, id: TagId) -> Result<Self> {
        let tag = store.require_tag(id)?;
        Ok(Self {
            media_paths: store.media_paths_for_tag(id)?,
            outgoing_references: store.outgoing_references(id)?,
            incoming_references: store.incoming_references(id)?,
            hierarchy_children: store.hierarchy_children(id)?,
            deleted_at: Utc::now(),
            tag,
        })
    }
}

/// How much of a snapshot made it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub old_id: TagId,
    pub new_id: TagId,
    pub media: BatchOutcome,
    pub hierarchy_children: BatchOutcome,
    pub outgoing_references: BatchOutcome,
    pub incoming_references: BatchOutcome,
}

impl RestoreReport {
    /// Every category counted together.
    pub fn total(&self) -> BatchOutcome {
        let mut total = self.media;
        total.merge(self.hierarchy_children);
        total.merge(self.outgoing_references);
        total.merge(self.incoming_references);
        total
    }

    pub fn is_complete(&self) -> bool {
        self.total().is_complete()
    }
}

/// Recreate the tag and replay its relationships.
///
/// Only creating the tag itself can fail the call. Each relationship is
/// replayed on its own; one that no longer resolves or would now form a
/// cycle is logged and counted as failed.
pub fn replay(store: &TagStore, snapshot: &DeletedTagSnapshot) -> Result<RestoreReport> {
    let old = &snapshot.tag;
    let parent = match old.parent_id {
        Some(parent) if store.get_tag(parent)?.is_some() => Some(parent),
        Some(parent) => {
            warn!(parent, "Original parent is gone, restoring at root");
            None
        }
        None => None,
    };
    let new_id = store.create_tag(&old.name, parent)?;
    if old.is_expanded {
        if let Err(e) = store.set_expanded(new_id, true) {
            warn!(new_id, "Failed to restore expansion state: {}", e);
        }
    }

    let mut media = BatchOutcome::new();
    for path in &snapshot.media_paths {
        match store.add_media_tag(path, new_id) {
            Ok(_) => media.success(),
            Err(e) => {
                warn!(path = %path, "Failed to restore media association: {}", e);
                media.failure();
            }
        }
    }

    let mut children = BatchOutcome::new();
    for &child in &snapshot.hierarchy_children {
        children.record(restore_child(store, child, new_id));
    }

    // Re-adding places each edge first among its siblings, so walk the
    // original order backwards to end up with the same order.
    let mut outgoing = BatchOutcome::new();
    for edge in snapshot.outgoing_references.iter().rev() {
        outgoing.record(restore_reference(store, new_id, edge.child_tag_id));
    }

    let mut incoming = BatchOutcome::new();
    for edge in &snapshot.incoming_references {
        incoming.record(restore_reference(store, edge.parent_tag_id, new_id));
    }

    let report = RestoreReport {
        old_id: old.id,
        new_id,
        media,
        hierarchy_children: children,
        outgoing_references: outgoing,
        incoming_references: incoming,
    };
    info!(
        old_id = old.id,
        new_id,
        media = %report.media,
        children = %report.hierarchy_children,
        outgoing = %report.outgoing_references,
        incoming = %report.incoming_references,
        "Restored deleted tag"
    );
    Ok(report)
}

fn restore_child(store: &TagStore, child: TagId, new_parent: TagId) -> bool {
    let attempt = || -> Result<bool> {
        if store.get_tag(child)?.is_none() {
            return Ok(false);
        }
        let graph = store.load_graph()?;
        if !cycle::can_set_parent(&graph, child, Some(new_parent)) {
            return Ok(false);
        }
        store.set_hierarchy_parent(child, Some(new_parent))?;
        Ok(true)
    };
    match attempt() {
        Ok(true) => true,
        Ok(false) => {
            warn!(child, new_parent, "Skipped hierarchy child that no longer fits");
            false
        }
        Err(e) => {
            warn!(child, new_parent, "Failed to restore hierarchy child: {}", e);
            false
        }
    }
}

fn restore_reference(store: &TagStore, parent: TagId, child: TagId) -> bool {
    let attempt = || -> Result<bool> {
        if store.get_tag(parent)?.is_none() || store.get_tag(child)?.is_none() {
            return Ok(false);
        }
        let graph = store.load_graph()?;
        if !cycle::can_add_reference(&graph, parent, child) {
            return Ok(false);
        }
        store.add_reference(parent, child)?;
        Ok(true)
    };
    match attempt() {
        Ok(true) => true,
        Ok(false) => {
            warn!(parent, child, "Skipped reference that no longer fits");
            false
        }
        Err(e) => {
            warn!(parent, child, "Failed to restore reference: {}", e);
            false
        }
    }
}

/// Observable state of the undo slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoState {
    Idle,
    Deleted {
        tag_id: TagId,
        name: String,
        deadline: Instant,
    },
    Restored {
        old_id: TagId,
        new_id: TagId,
    },
    Expired {
        tag_id: TagId,
    },
}

/// A snapshot taken out of the slot for restoration.
pub struct RestoreClaim {
    pub generation: u64,
    pub snapshot: DeletedTagSnapshot,
}

struct Pending {
    snapshot: DeletedTagSnapshot,
    deadline: Instant,
    timer: Option<AbortHandle>,
}

struct Slot {
    generation: u64,
    pending: Option<Pending>,
    state: UndoState,
}

pub struct UndoCache {
    window: Duration,
    slot: Mutex<Slot>,
}

impl UndoCache {
    pub fn new(window: Duration) -> Arc<Self> {
        Arc::new(Self {
            window,
            slot: Mutex::new(Slot {
                generation: 0,
                pending: None,
                state: UndoState::Idle,
            }),
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state(&self) -> UndoState {
        self.lock_slot().state.clone()
    }

    /// Hold `snapshot` for the undo window, discarding any earlier one.
    /// Must be called from within a tokio runtime.
    pub fn arm(self: &Arc<Self>, snapshot: DeletedTagSnapshot) {
        let deadline = Instant::now() + self.window;
        let mut slot = self.lock_slot();
        slot.generation += 1;
        let generation = slot.generation;

        if let Some(previous) = slot.pending.take() {
            if let Some(timer) = previous.timer {
                timer.abort();
            }
            debug!(tag_id = previous.snapshot.tag.id, "Discarding earlier undo snapshot");
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(cache) = weak.upgrade() {
                cache.expire(generation);
            }
        });

        slot.state = UndoState::Deleted {
            tag_id: snapshot.tag.id,
            name: snapshot.tag.name.clone(),
            deadline,
        };
        slot.pending = Some(Pending {
            snapshot,
            deadline,
            timer: Some(timer.abort_handle()),
        });
    }

    /// Claim the pending snapshot for restoration. `None` when there is
    /// nothing to restore or the window has passed.
    pub fn take_for_restore(&self) -> Option<RestoreClaim> {
        let mut slot = self.lock_slot();
        let pending = slot.pending.take()?;
        // Stop the timer before looking at the clock.
        if let Some(timer) = &pending.timer {
            timer.abort();
        }
        if Instant::now() >= pending.deadline {
            slot.state = UndoState::Expired {
                tag_id: pending.snapshot.tag.id,
            };
            debug!(tag_id = pending.snapshot.tag.id, "Undo window already closed");
            return None;
        }
        Some(RestoreClaim {
            generation: slot.generation,
            snapshot: pending.snapshot,
        })
    }

    /// Record a finished restore. Ignored, returning `false`, when another
    /// deletion has armed the slot since the claim was taken.
    pub fn mark_restored(&self, generation: u64, old_id: TagId, new_id: TagId) -> bool {
        self.settle(generation, UndoState::Restored { old_id, new_id })
    }

    /// A claimed snapshot could not be restored.
    pub fn mark_failed(&self, generation: u64, old_id: TagId) -> bool {
        self.settle(generation, UndoState::Expired { tag_id: old_id })
    }

    fn settle(&self, generation: u64, state: UndoState) -> bool {
        let mut slot = self.lock_slot();
        if slot.generation != generation {
            debug!(?state, "Newer deletion pending, keeping its undo state");
            return false;
        }
        slot.state = state;
        true
    }

    /// Close the window early. Returns whether a snapshot was discarded.
    pub fn dismiss(&self) -> bool {
        let mut slot = self.lock_slot();
        match slot.pending.take() {
            Some(pending) => {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                slot.state = UndoState::Expired {
                    tag_id: pending.snapshot.tag.id,
                };
                true
            }
            None => false,
        }
    }

    fn expire(&self, generation: u64) {
        let mut slot = self.lock_slot();
        if slot.generation != generation {
            return;
        }
        if let Some(pending) = slot.pending.take() {
            debug!(tag_id = pending.snapshot.tag.id, "Undo window expired");
            slot.state = UndoState::Expired {
                tag_id: pending.snapshot.tag.id,
            };
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn store() -> TagStore {
        let store = TagStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn snapshot(id: TagId) -> DeletedTagSnapshot {
        DeletedTagSnapshot {
            tag: Tag {
                id,
                name: format!("tag{id}"),
                parent_id: None,
                normal_group_sort_order: 1000,
                referenced_group_sort_order: 0,
                is_expanded: false,
                cached_image_count: 0,
            },
            media_paths: Vec::new(),
            outgoing_references: Vec::new(),
            incoming_references: Vec::new(),
            hierarchy_children: Vec::new(),
            deleted_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_within_window() {
        let cache = UndoCache::new(Duration::from_secs(5));
        cache.arm(snapshot(7));
        assert!(matches!(cache.state(), UndoState::Deleted { tag_id: 7, .. }));

        tokio::time::sleep(Duration::from_secs(4)).await;
        let claim = cache.take_for_restore().unwrap();
        assert_eq!(claim.snapshot.tag.id, 7);
        assert!(cache.take_for_restore().is_none());

        assert!(cache.mark_restored(claim.generation, 7, 8));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.state(), UndoState::Restored { old_id: 7, new_id: 8 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_discards_snapshot() {
        let cache = UndoCache::new(Duration::from_secs(5));
        cache.arm(snapshot(7));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.state(), UndoState::Expired { tag_id: 7 });
        assert!(cache.take_for_restore().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_delete_replaces_pending() {
        let cache = UndoCache::new(Duration::from_secs(5));
        cache.arm(snapshot(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        cache.arm(snapshot(2));

        // The first snapshot's timer would have fired by now.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(cache.state(), UndoState::Deleted { tag_id: 2, .. }));
        assert_eq!(cache.take_for_restore().unwrap().snapshot.tag.id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_result_does_not_clobber_newer_delete() {
        let cache = UndoCache::new(Duration::from_secs(5));
        cache.arm(snapshot(1));
        let claim = cache.take_for_restore().unwrap();

        // Another tag is deleted while the first restore is running.
        cache.arm(snapshot(2));
        assert!(!cache.mark_restored(claim.generation, 1, 10));
        assert!(matches!(cache.state(), UndoState::Deleted { tag_id: 2, .. }));
        assert!(!cache.mark_failed(claim.generation, 1));
        assert!(matches!(cache.state(), UndoState::Deleted { tag_id: 2, .. }));
        assert_eq!(cache.take_for_restore().unwrap().snapshot.tag.id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss() {
        let cache = UndoCache::new(Duration::from_secs(5));
        assert!(!cache.dismiss());
        cache.arm(snapshot(3));
        assert!(cache.dismiss());
        assert_eq!(cache.state(), UndoState::Expired { tag_id: 3 });
        assert!(cache.take_for_restore().is_none());
    }

    #[test]
    fn test_replay_rebuilds_relationships() {
        let store = store();
        let root = store.create_tag("root", None).unwrap();
        let doomed = store.create_tag("doomed", Some(root)).unwrap();
        let child = store.create_tag("child", Some(doomed)).unwrap();
        let target = store.create_tag("target", None).unwrap();
        let referrer = store.create_tag("referrer", None).unwrap();
        store.add_reference(doomed, target).unwrap();
        store.add_reference(referrer, doomed).unwrap();
        store.add_media_tag("/a.jpg", doomed).unwrap();
        store.add_media_tag("/b.jpg", doomed).unwrap();
        store.add_media_tag("/c.jpg", target).unwrap();

        let before = store.load_graph().unwrap();
        let closure_paths: BTreeSet<String> = before
            .closure_paths(doomed)
            .into_iter()
            .map(str::to_string)
            .collect();

        let snap = DeletedTagSnapshot::capture(&store, doomed).unwrap();
        store.delete_tag(doomed).unwrap();
        let report = replay(&store, &snap).unwrap();

        assert!(report.is_complete());
        assert_ne!(report.new_id, doomed);
        let restored = store.require_tag(report.new_id).unwrap();
        assert_eq!(restored.name, "doomed");
        assert_eq!(restored.parent_id, Some(root));

        let after = store.load_graph().unwrap();
        let restored_paths: BTreeSet<String> = after
            .closure_paths(report.new_id)
            .into_iter()
            .map(str::to_string)
            .collect();
        assert_eq!(restored_paths, closure_paths);
        assert_eq!(after.hierarchy_children(report.new_id), &[child]);
        assert_eq!(after.reference_children(report.new_id), &[target]);
        assert_eq!(after.reference_parents(report.new_id), &[referrer]);
    }

    #[test]
    fn test_replay_skips_vanished_relations() {
        let store = store();
        let doomed = store.create_tag("doomed", None).unwrap();
        let target = store.create_tag("target", None).unwrap();
        store.add_reference(doomed, target).unwrap();
        store.add_media_tag("/a.jpg", doomed).unwrap();

        let snap = DeletedTagSnapshot::capture(&store, doomed).unwrap();
        store.delete_tag(doomed).unwrap();
        store.delete_tag(target).unwrap();

        let report = replay(&store, &snap).unwrap();
        assert_eq!(report.media.succeeded, 1);
        assert_eq!(report.outgoing_references.failed, 1);
        assert_eq!(
            report.total(),
            BatchOutcome {
                succeeded: 1,
                failed: 1
            }
        );
        assert!(!report.is_complete());
        assert!(store.get_tag(report.new_id).unwrap().is_some());
    }
}
