//! Sparse integer sort keys for the two tag ordering groups and for
//! reference siblings.
//!
//! Keys are spaced `step` apart so that a move normally rewrites a single
//! row. When a move would leave less than `min_gap` between neighbours the
//! whole group is renumbered to `(index + 1) * step`.

use tracing::debug;

use crate::config::OrderingConfig;
use crate::db::TagId;

/// A `(member, new key)` pair to be written back to the store.
pub type Assignment = (TagId, i64);

#[derive(Debug, Clone, Copy)]
pub struct SortOrderAllocator {
    step: i64,
    min_gap: i64,
}

impl Default for SortOrderAllocator {
    fn default() -> Self {
        Self::new(&OrderingConfig::default())
    }
}

impl SortOrderAllocator {
    pub fn new(config: &OrderingConfig) -> Self {
        Self {
            step: config.step.max(2),
            min_gap: config.min_gap.max(1),
        }
    }

    /// Key that sorts before every existing key, or `step` for an empty group.
    pub fn top_key<I>(&self, existing: I) -> i64
    where
        I: IntoIterator<Item = i64>,
    {
        existing
            .into_iter()
            .min()
            .map_or(self.step, |min| min - self.step)
    }

    /// Move `moving` to `target_index` within `members`.
    ///
    /// `members` must be in current display order and may or may not contain
    /// `moving`. The index is interpreted against the list with `moving`
    /// removed and is clamped to its length. Returns only the keys that need
    /// writing.
    pub fn insert_at(
        &self,
        members: &[Assignment],
        moving: TagId,
        target_index: usize,
    ) -> Vec<Assignment> {
        let others: Vec<Assignment> = members
            .iter()
            .copied()
            .filter(|(id, _)| *id != moving)
            .collect();
        let index = target_index.min(others.len());

        let before = index.checked_sub(1).map(|i| others[i].1);
        let after = others.get(index).map(|(_, key)| *key);

        let half = self.step / 2;
        let key = match (before, after) {
            (None, None) => self.step,
            (Some(b), None) => b + half,
            (None, Some(a)) => a - half,
            (Some(b), Some(a)) => b + (a - b) / 2,
        };

        let cramped = before.is_some_and(|b| key - b < self.min_gap)
            || after.is_some_and(|a| a - key < self.min_gap);

        if cramped || !strictly_increasing(&others) {
            debug!(moving, index, "Sort keys exhausted, redistributing group");
            let mut order: Vec<TagId> = others.iter().map(|(id, _)| *id).collect();
            order.insert(index, moving);
            return self.redistribute(&order);
        }

        vec![(moving, key)]
    }

    /// Evenly spaced keys for `order`, restoring headroom between members.
    pub fn redistribute(&self, order: &[TagId]) -> Vec<Assignment> {
        order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, (i as i64 + 1) * self.step))
            .collect()
    }
}

fn strictly_increasing(members: &[Assignment]) -> bool {
    members.windows(2).all(|pair| pair[0].1 < pair[1].1)
}
