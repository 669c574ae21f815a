pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Tags: single-parent hierarchy plus two independent sort-key spaces
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    parent_id INTEGER,
    normal_group_sort_order INTEGER NOT NULL DEFAULT 0,
    referenced_group_sort_order INTEGER NOT NULL DEFAULT 0,
    is_expanded INTEGER NOT NULL DEFAULT 0,
    cached_image_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (parent_id) REFERENCES tags(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_tags_parent ON tags(parent_id);
CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(name);

-- Reference edges: ordered many-to-many "includes" relation between tags
CREATE TABLE IF NOT EXISTS tag_references (
    parent_tag_id INTEGER NOT NULL,
    child_tag_id INTEGER NOT NULL,
    sort_order INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (parent_tag_id, child_tag_id),
    FOREIGN KEY (parent_tag_id) REFERENCES tags(id) ON DELETE CASCADE,
    FOREIGN KEY (child_tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_tag_references_child ON tag_references(child_tag_id);

-- Media to tag mapping
CREATE TABLE IF NOT EXISTS media_tags (
    media_path TEXT NOT NULL,
    tag_id INTEGER NOT NULL,
    added_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (media_path, tag_id),
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_media_tags_tag ON media_tags(tag_id);
"#;

/// Column additions for stores created by earlier versions. Failures (column
/// already present) are ignored.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE tags ADD COLUMN is_expanded INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE tags ADD COLUMN cached_image_count INTEGER NOT NULL DEFAULT 0",
];
