pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Images: one row per file that has had at least one face recorded
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path BLOB NOT NULL UNIQUE,        -- raw OS bytes of the path
    modified_at TEXT NOT NULL         -- RFC 3339 file modification time
);

-- Identities: ids are assigned by the embedding index (row ordinal), never by SQLite
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY,
    last_seen_at TEXT NOT NULL        -- RFC 3339, refreshed on every occurrence
);

-- Occurrences: one row per detected face per image
CREATE TABLE IF NOT EXISTS occurrences (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL,
    identity_id INTEGER NOT NULL,
    x1 INTEGER NOT NULL,
    y1 INTEGER NOT NULL,
    x2 INTEGER NOT NULL,
    y2 INTEGER NOT NULL,
    FOREIGN KEY (image_id) REFERENCES images(id),
    FOREIGN KEY (identity_id) REFERENCES identities(id)
);

CREATE INDEX IF NOT EXISTS idx_occurrences_image ON occurrences(image_id);
CREATE INDEX IF NOT EXISTS idx_occurrences_identity ON occurrences(identity_id);
"#;
