//! SQLite-backed tag store.

use rusqlite::{Connection, OptionalExtension};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info};

use super::schema::{MIGRATIONS, SCHEMA};
use super::tags::{MediaTagAssociation, ReferenceEdge, SortGroup, Tag, TagId, UNTAGGED};
use crate::error::{GraphError, Result};
use crate::graph::TagGraph;
use crate::ordering::{Assignment, SortOrderAllocator};

const TAG_COLUMNS: &str = "id, name, parent_id, normal_group_sort_order, \
     referenced_group_sort_order, is_expanded, cached_image_count";

pub struct TagStore {
    pub(crate) conn: Connection,
    allocator: SortOrderAllocator,
}

impl TagStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn,
            allocator: SortOrderAllocator::default(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn,
            allocator: SortOrderAllocator::default(),
        })
    }

    pub fn with_allocator(mut self, allocator: SortOrderAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        self.run_migrations()?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        for migration in MIGRATIONS {
            let _ = self.conn.execute(migration, []);
        }
        Ok(())
    }

    /// Run `f` inside a transaction. Nested calls join the outer transaction.
    pub fn atomically<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Self) -> Result<R>,
    {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        let tx = self.conn.unchecked_transaction()?;
        let result = f(self)?;
        tx.commit()?;
        Ok(result)
    }

    // ========================================================================
    // Tag rows
    // ========================================================================

    /// Create a tag at the top of the no-reference group.
    pub fn create_tag(&self, name: &str, parent_id: Option<TagId>) -> Result<TagId> {
        let name = validate_name(name)?;
        self.atomically(|store| {
            if let Some(parent) = parent_id {
                store.require_tag(parent)?;
            }
            let keys = store.group_members(SortGroup::Normal)?;
            let key = store.allocator.top_key(keys.iter().map(|(_, k)| *k));
            store.conn.execute(
                "INSERT INTO tags (name, parent_id, normal_group_sort_order) VALUES (?, ?, ?)",
                rusqlite::params![name, parent_id, key],
            )?;
            let id = store.conn.last_insert_rowid();
            info!(id, name, ?parent_id, "Created tag");
            Ok(id)
        })
    }

    pub fn get_tag(&self, id: TagId) -> Result<Option<Tag>> {
        if id == UNTAGGED {
            return Ok(None);
        }
        let tag = self
            .conn
            .query_row(
                &format!("SELECT {TAG_COLUMNS} FROM tags WHERE id = ?"),
                [id],
                row_to_tag,
            )
            .optional()?;
        Ok(tag)
    }

    /// Fetch a tag that must exist. The untagged id is rejected outright.
    pub fn require_tag(&self, id: TagId) -> Result<Tag> {
        if id == UNTAGGED {
            return Err(GraphError::ReservedTag(id));
        }
        self.get_tag(id)?.ok_or(GraphError::NotFound(id))
    }

    pub fn get_all_tags(&self) -> Result<Vec<Tag>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TAG_COLUMNS} FROM tags ORDER BY id"))?;
        let tags = stmt
            .query_map([], row_to_tag)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    pub fn find_tag_by_name(&self, name: &str) -> Result<Option<Tag>> {
        let tag = self
            .conn
            .query_row(
                &format!("SELECT {TAG_COLUMNS} FROM tags WHERE name = ? COLLATE NOCASE ORDER BY id LIMIT 1"),
                [name.trim()],
                row_to_tag,
            )
            .optional()?;
        Ok(tag)
    }

    pub fn get_or_create_tag(&self, name: &str) -> Result<Tag> {
        self.atomically(|store| match store.find_tag_by_name(name)? {
            Some(tag) => Ok(tag),
            None => {
                let id = store.create_tag(name, None)?;
                store.require_tag(id)
            }
        })
    }

    pub fn search_tags(&self, prefix: &str) -> Result<Vec<Tag>> {
        let pattern = format!("{}%", prefix.trim());
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TAG_COLUMNS} FROM tags WHERE name LIKE ? COLLATE NOCASE ORDER BY name LIMIT 10"
        ))?;
        let tags = stmt
            .query_map([pattern], row_to_tag)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    pub fn rename_tag(&self, id: TagId, new_name: &str) -> Result<()> {
        let new_name = validate_name(new_name)?;
        self.require_tag(id)?;
        self.conn.execute(
            "UPDATE tags SET name = ? WHERE id = ?",
            rusqlite::params![new_name, id],
        )?;
        Ok(())
    }

    pub fn set_expanded(&self, id: TagId, expanded: bool) -> Result<()> {
        self.require_tag(id)?;
        self.conn.execute(
            "UPDATE tags SET is_expanded = ? WHERE id = ?",
            rusqlite::params![expanded, id],
        )?;
        Ok(())
    }

    pub fn set_cached_image_count(&self, id: TagId, count: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tags SET cached_image_count = ? WHERE id = ?",
            rusqlite::params![count, id],
        )?;
        Ok(())
    }

    /// Write the hierarchy parent without structural validation; callers run
    /// the cycle check in the same critical section.
    pub fn set_hierarchy_parent(&self, id: TagId, parent_id: Option<TagId>) -> Result<()> {
        self.require_tag(id)?;
        if let Some(parent) = parent_id {
            self.require_tag(parent)?;
        }
        self.conn.execute(
            "UPDATE tags SET parent_id = ? WHERE id = ?",
            rusqlite::params![parent_id, id],
        )?;
        Ok(())
    }

    pub fn hierarchy_children(&self, id: TagId) -> Result<Vec<TagId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM tags WHERE parent_id = ? ORDER BY id")?;
        let ids = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Delete a tag together with its media associations and every reference
    /// edge touching it. Hierarchy children move up to the deleted tag's
    /// parent.
    pub fn delete_tag(&self, id: TagId) -> Result<()> {
        self.atomically(|store| {
            let tag = store.require_tag(id)?;
            let referencing: Vec<TagId> = store
                .incoming_references(id)?
                .iter()
                .map(|edge| edge.parent_tag_id)
                .collect();

            store.conn.execute(
                "UPDATE tags SET parent_id = ? WHERE parent_id = ?",
                rusqlite::params![tag.parent_id, id],
            )?;
            store.conn.execute(
                "DELETE FROM tag_references WHERE parent_tag_id = ? OR child_tag_id = ?",
                rusqlite::params![id, id],
            )?;
            store
                .conn
                .execute("DELETE FROM media_tags WHERE tag_id = ?", [id])?;
            store.conn.execute("DELETE FROM tags WHERE id = ?", [id])?;

            // Tags that only referenced the deleted tag drop back to the
            // no-reference group.
            for parent in referencing {
                if store.reference_count(parent)? == 0 {
                    store.switch_group(parent, SortGroup::Normal)?;
                }
            }
            info!(id, name = %tag.name, "Deleted tag");
            Ok(())
        })
    }

    // ========================================================================
    // Reference edges
    // ========================================================================

    /// Insert `parent -> child`. Returns `false` when the edge already exists.
    ///
    /// A parent gaining its first reference switches to the referenced
    /// ordering group.
    pub fn add_reference(&self, parent: TagId, child: TagId) -> Result<bool> {
        self.atomically(|store| {
            store.require_tag(parent)?;
            store.require_tag(child)?;
            let siblings = store.outgoing_references(parent)?;
            if siblings.iter().any(|edge| edge.child_tag_id == child) {
                return Ok(false);
            }
            let key = store
                .allocator
                .top_key(siblings.iter().map(|edge| edge.sort_order));
            store.conn.execute(
                "INSERT INTO tag_references (parent_tag_id, child_tag_id, sort_order) VALUES (?, ?, ?)",
                rusqlite::params![parent, child, key],
            )?;
            if siblings.is_empty() {
                store.switch_group(parent, SortGroup::Referenced)?;
            }
            Ok(true)
        })
    }

    /// Remove `parent -> child`. Returns `false` when there was no such edge.
    pub fn remove_reference(&self, parent: TagId, child: TagId) -> Result<bool> {
        self.atomically(|store| {
            let removed = store.conn.execute(
                "DELETE FROM tag_references WHERE parent_tag_id = ? AND child_tag_id = ?",
                rusqlite::params![parent, child],
            )?;
            if removed == 0 {
                return Ok(false);
            }
            if store.reference_count(parent)? == 0 {
                store.switch_group(parent, SortGroup::Normal)?;
            }
            Ok(true)
        })
    }

    pub fn outgoing_references(&self, id: TagId) -> Result<Vec<ReferenceEdge>> {
        self.query_references(
            "SELECT parent_tag_id, child_tag_id, sort_order FROM tag_references
             WHERE parent_tag_id = ? ORDER BY sort_order, child_tag_id",
            id,
        )
    }

    pub fn incoming_references(&self, id: TagId) -> Result<Vec<ReferenceEdge>> {
        self.query_references(
            "SELECT parent_tag_id, child_tag_id, sort_order FROM tag_references
             WHERE child_tag_id = ? ORDER BY parent_tag_id",
            id,
        )
    }

    fn query_references(&self, sql: &str, id: TagId) -> Result<Vec<ReferenceEdge>> {
        let mut stmt = self.conn.prepare(sql)?;
        let edges = stmt
            .query_map([id], |row| {
                Ok(ReferenceEdge {
                    parent_tag_id: row.get(0)?,
                    child_tag_id: row.get(1)?,
                    sort_order: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    pub fn all_references(&self) -> Result<Vec<ReferenceEdge>> {
        let mut stmt = self.conn.prepare(
            "SELECT parent_tag_id, child_tag_id, sort_order FROM tag_references
             ORDER BY parent_tag_id, sort_order, child_tag_id",
        )?;
        let edges = stmt
            .query_map([], |row| {
                Ok(ReferenceEdge {
                    parent_tag_id: row.get(0)?,
                    child_tag_id: row.get(1)?,
                    sort_order: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    pub fn reference_count(&self, id: TagId) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tag_references WHERE parent_tag_id = ?",
            [id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Move a reference edge to `target_index` among its siblings.
    pub fn move_reference(&self, parent: TagId, child: TagId, target_index: usize) -> Result<bool> {
        self.atomically(|store| {
            let siblings: Vec<Assignment> = store
                .outgoing_references(parent)?
                .iter()
                .map(|edge| (edge.child_tag_id, edge.sort_order))
                .collect();
            if !siblings.iter().any(|(id, _)| *id == child) {
                return Ok(false);
            }
            let assignments = store.allocator.insert_at(&siblings, child, target_index);
            for (sibling, key) in assignments {
                store.conn.execute(
                    "UPDATE tag_references SET sort_order = ? WHERE parent_tag_id = ? AND child_tag_id = ?",
                    rusqlite::params![key, parent, sibling],
                )?;
            }
            Ok(true)
        })
    }

    // ========================================================================
    // Ordering groups
    // ========================================================================

    pub fn group_of(&self, id: TagId) -> Result<SortGroup> {
        Ok(SortGroup::for_reference_count(self.reference_count(id)?))
    }

    /// Members of `group` with their keys, in display order.
    pub fn group_members(&self, group: SortGroup) -> Result<Vec<Assignment>> {
        let membership = match group {
            SortGroup::Normal => "NOT EXISTS",
            SortGroup::Referenced => "EXISTS",
        };
        let sql = format!(
            "SELECT t.id, t.{col} FROM tags t
             WHERE {membership} (SELECT 1 FROM tag_references r WHERE r.parent_tag_id = t.id)
             ORDER BY t.{col}, t.id",
            col = group.column(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let members = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    /// Write several keys of one group in a single transaction.
    pub fn write_sort_orders(&self, group: SortGroup, assignments: &[Assignment]) -> Result<()> {
        self.atomically(|store| {
            let sql = format!("UPDATE tags SET {} = ? WHERE id = ?", group.column());
            let mut stmt = store.conn.prepare(&sql)?;
            for (id, key) in assignments {
                stmt.execute(rusqlite::params![key, id])?;
            }
            Ok(())
        })
    }

    /// Move `id` into `to`, placing it first there and zeroing the key of the
    /// group it left.
    pub fn switch_group(&self, id: TagId, to: SortGroup) -> Result<()> {
        self.atomically(|store| {
            let others = store.group_members(to)?;
            let key = store.allocator.top_key(
                others
                    .iter()
                    .filter(|(member, _)| *member != id)
                    .map(|(_, key)| *key),
            );
            let (normal, referenced) = match to {
                SortGroup::Normal => (key, 0),
                SortGroup::Referenced => (0, key),
            };
            store.conn.execute(
                "UPDATE tags SET normal_group_sort_order = ?, referenced_group_sort_order = ? WHERE id = ?",
                rusqlite::params![normal, referenced, id],
            )?;
            debug!(id, ?to, key, "Switched ordering group");
            Ok(())
        })
    }

    /// Move a tag to `target_index` within its current ordering group.
    pub fn move_tag(&self, id: TagId, target_index: usize) -> Result<()> {
        self.atomically(|store| {
            store.require_tag(id)?;
            let group = store.group_of(id)?;
            let members = store.group_members(group)?;
            let assignments = store.allocator.insert_at(&members, id, target_index);
            store.write_sort_orders(group, &assignments)
        })
    }

    // ========================================================================
    // Media associations
    // ========================================================================

    /// Returns `false` when the association already existed.
    pub fn add_media_tag(&self, media_path: &str, tag_id: TagId) -> Result<bool> {
        self.require_tag(tag_id)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO media_tags (media_path, tag_id) VALUES (?, ?)",
            rusqlite::params![media_path, tag_id],
        )?;
        Ok(inserted > 0)
    }

    /// Returns `false` when there was nothing to remove.
    pub fn remove_media_tag(&self, media_path: &str, tag_id: TagId) -> Result<bool> {
        self.require_tag(tag_id)?;
        let removed = self.conn.execute(
            "DELETE FROM media_tags WHERE media_path = ? AND tag_id = ?",
            rusqlite::params![media_path, tag_id],
        )?;
        Ok(removed > 0)
    }

    pub fn media_paths_for_tag(&self, tag_id: TagId) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT media_path FROM media_tags WHERE tag_id = ? ORDER BY media_path")?;
        let paths = stmt
            .query_map([tag_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(paths)
    }

    /// Union of paths tagged by any of `tag_ids`.
    pub fn get_media_paths(&self, tag_ids: &HashSet<TagId>) -> Result<HashSet<String>> {
        if tag_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders: Vec<&str> = tag_ids.iter().map(|_| "?").collect();
        let query = format!(
            "SELECT DISTINCT media_path FROM media_tags WHERE tag_id IN ({})",
            placeholders.join(",")
        );
        let mut stmt = self.conn.prepare(&query)?;
        let paths = stmt
            .query_map(rusqlite::params_from_iter(tag_ids.iter()), |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(paths)
    }

    pub fn get_all_tagged_paths(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT media_path FROM media_tags")?;
        let paths = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(paths)
    }

    pub fn tags_for_media(&self, media_path: &str) -> Result<Vec<Tag>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT t.id, t.name, t.parent_id, t.normal_group_sort_order,
                   t.referenced_group_sort_order, t.is_expanded, t.cached_image_count
            FROM tags t
            JOIN media_tags m ON m.tag_id = t.id
            WHERE m.media_path = ?
            ORDER BY t.name
            "#,
        )?;
        let tags = stmt
            .query_map([media_path], row_to_tag)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    /// Re-point every association of `old_path` to `new_path`. Returns the
    /// number of associations moved.
    pub fn update_media_path(&self, old_path: &str, new_path: &str) -> Result<usize> {
        self.atomically(|store| {
            let moved = store.conn.execute(
                "INSERT OR IGNORE INTO media_tags (media_path, tag_id, added_at)
                 SELECT ?, tag_id, added_at FROM media_tags WHERE media_path = ?",
                rusqlite::params![new_path, old_path],
            )?;
            store
                .conn
                .execute("DELETE FROM media_tags WHERE media_path = ?", [old_path])?;
            Ok(moved)
        })
    }

    /// Drop every association of the given paths. Returns rows removed.
    pub fn remove_media_paths<'a, I>(&self, paths: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.atomically(|store| {
            let mut stmt = store
                .conn
                .prepare("DELETE FROM media_tags WHERE media_path = ?")?;
            let mut removed = 0;
            for path in paths {
                removed += stmt.execute([path])?;
            }
            Ok(removed)
        })
    }

    // ========================================================================
    // Closure queries
    // ========================================================================

    /// Load the whole graph, including media associations, in one pass.
    pub fn load_graph(&self) -> Result<TagGraph> {
        let mut graph = TagGraph::new();

        let mut stmt = self.conn.prepare("SELECT id, parent_id FROM tags")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, TagId>(0)?, row.get::<_, Option<TagId>>(1)?))
        })?;
        for row in rows {
            let (id, parent) = row?;
            graph.insert_tag(id, parent);
        }

        let mut stmt = self.conn.prepare(
            "SELECT parent_tag_id, child_tag_id FROM tag_references ORDER BY parent_tag_id, sort_order",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, TagId>(0)?, row.get::<_, TagId>(1)?)))?;
        for row in rows {
            let (parent, child) = row?;
            graph.insert_reference(parent, child);
        }

        for association in self.associations()? {
            graph.insert_media(association.tag_id, association.media_path);
        }

        Ok(graph)
    }

    pub fn associations(&self) -> Result<Vec<MediaTagAssociation>> {
        let mut stmt = self
            .conn
            .prepare("SELECT media_path, tag_id FROM media_tags ORDER BY media_path, tag_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MediaTagAssociation {
                    media_path: row.get(0)?,
                    tag_id: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_ancestors(&self, id: TagId) -> Result<BTreeSet<TagId>> {
        self.require_tag(id)?;
        Ok(self.load_graph()?.ancestors(id))
    }

    pub fn get_descendants(&self, id: TagId) -> Result<BTreeSet<TagId>> {
        self.require_tag(id)?;
        Ok(self.load_graph()?.descendants(id))
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GraphError::InvalidName);
    }
    Ok(trimmed)
}

fn row_to_tag(row: &rusqlite::Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        parent_id: row.get(2)?,
        normal_group_sort_order: row.get(3)?,
        referenced_group_sort_order: row.get(4)?,
        is_expanded: row.get(5)?,
        cached_image_count: row.get(6)?,
    })
}
