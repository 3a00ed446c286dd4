//! Writing face occurrences and reading back what has been ingested.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{path_from_key, path_key, timestamp, BoundingBox, Database, IdentityId, Occurrence};

impl Database {
    /// Record one face of `identity_id` in the image at `path`.
    ///
    /// Creates the image row if needed, creates or refreshes the identity row,
    /// and inserts the occurrence, all in one transaction.
    pub fn record_occurrence(
        &self,
        path: &Path,
        identity_id: IdentityId,
        bbox: BoundingBox,
    ) -> Result<()> {
        self.record_image_occurrences(path, &[(identity_id, bbox)])
    }

    /// Record every face found in one image in a single transaction.
    ///
    /// Nothing is written for an empty slice: an image only becomes known to
    /// the store through its first occurrence.
    pub fn record_image_occurrences(
        &self,
        path: &Path,
        faces: &[(IdentityId, BoundingBox)],
    ) -> Result<()> {
        if faces.is_empty() {
            return Ok(());
        }

        let modified_at = file_modified_at(path);
        let now = timestamp(Utc::now());
        let key = path_key(path);

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO images (path, modified_at) VALUES (?, ?)",
            params![key, modified_at],
        )?;
        let image_id: i64 = tx.query_row(
            "SELECT id FROM images WHERE path = ?",
            [&key],
            |row| row.get(0),
        )?;

        for (identity_id, bbox) in faces {
            // Ids merged away earlier come back here from the index and are recreated.
            tx.execute(
                r#"
                INSERT INTO identities (id, last_seen_at) VALUES (?, ?)
                ON CONFLICT(id) DO UPDATE SET last_seen_at = excluded.last_seen_at
                "#,
                params![identity_id, now],
            )?;
            tx.execute(
                r#"
                INSERT INTO occurrences (image_id, identity_id, x1, y1, x2, y2)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
                params![image_id, identity_id, bbox.x1, bbox.y1, bbox.x2, bbox.y2],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Paths of all images with at least one occurrence.
    pub fn processed_paths(&self) -> Result<BTreeSet<PathBuf>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT i.path
            FROM occurrences o
            JOIN images i ON o.image_id = i.id
            "#,
        )?;

        let paths = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(path_from_key)
            .collect();

        Ok(paths)
    }

    /// Every face recorded for an image, in insertion order.
    pub fn occurrences_in(&self, path: &Path) -> Result<Vec<Occurrence>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT o.image_id, o.identity_id, o.x1, o.y1, o.x2, o.y2
            FROM occurrences o
            JOIN images i ON o.image_id = i.id
            WHERE i.path = ?
            ORDER BY o.id
            "#,
        )?;

        let occurrences = stmt
            .query_map([path_key(path)], |row| {
                Ok(Occurrence {
                    image_id: row.get(0)?,
                    identity_id: row.get(1)?,
                    bbox: BoundingBox {
                        x1: row.get(2)?,
                        y1: row.get(3)?,
                        x2: row.get(4)?,
                        y2: row.get(5)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(occurrences)
    }

    /// Last-seen timestamp of an identity, if it still has a row.
    pub fn identity_last_seen(&self, identity_id: IdentityId) -> Result<Option<String>> {
        let conn = self.conn();
        let last_seen = conn
            .query_row(
                "SELECT last_seen_at FROM identities WHERE id = ?",
                [identity_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last_seen)
    }
}

/// Image id for a path, if the image is known.
pub(super) fn image_id(conn: &Connection, path: &Path) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM images WHERE path = ?",
            [path_key(path)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// File modification time as RFC 3339, or the current time if unreadable.
fn file_modified_at(path: &Path) -> String {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => timestamp(DateTime::<Utc>::from(modified)),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "No modification time, using now");
            timestamp(Utc::now())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_record_creates_image_identity_and_occurrence() {
        let db = test_db();
        let path = Path::new("/photos/photo1.jpg");

        db.record_occurrence(path, 0, BoundingBox::new(1, 2, 3, 4)).unwrap();
        db.record_occurrence(path, 1, BoundingBox::new(5, 6, 7, 8)).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.images, 1);
        assert_eq!(stats.identities, 2);
        assert_eq!(stats.occurrences, 2);

        let occurrences = db.occurrences_in(path).unwrap();
        assert_eq!(occurrences.len(), 2);
        assert_eq!(occurrences[0].identity_id, 0);
        assert_eq!(occurrences[1].bbox, BoundingBox::new(5, 6, 7, 8));
    }

    #[test]
    fn test_record_refreshes_last_seen() {
        let db = test_db();
        db.record_occurrence(Path::new("/a.jpg"), 7, BoundingBox::new(0, 0, 1, 1)).unwrap();
        let first = db.identity_last_seen(7).unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        db.record_occurrence(Path::new("/b.jpg"), 7, BoundingBox::new(0, 0, 1, 1)).unwrap();
        let second = db.identity_last_seen(7).unwrap().unwrap();

        assert!(second > first);
        assert_eq!(db.stats().unwrap().identities, 1);
    }

    #[test]
    fn test_empty_faces_writes_nothing() {
        let db = test_db();
        db.record_image_occurrences(Path::new("/empty.jpg"), &[]).unwrap();
        assert_eq!(db.stats().unwrap().images, 0);
        assert!(db.processed_paths().unwrap().is_empty());
    }

    #[test]
    fn test_failed_write_leaves_no_partial_rows() {
        let db = test_db();
        // Make the occurrence insert fail after the image and identity rows were written.
        db.conn()
            .execute_batch(
                r#"
                CREATE TRIGGER reject_marker BEFORE INSERT ON occurrences
                WHEN NEW.x1 = -999
                BEGIN SELECT RAISE(ABORT, 'simulated crash'); END;
                "#,
            )
            .unwrap();

        let path = Path::new("/crash.jpg");
        let result = db.record_image_occurrences(
            path,
            &[(3, BoundingBox::new(0, 0, 1, 1)), (4, BoundingBox::new(-999, 0, 1, 1))],
        );
        assert!(result.is_err());

        assert_eq!(db.stats().unwrap(), super::super::StoreStats::default());
        assert!(db.occurrences_in(path).unwrap().is_empty());
        assert!(db.identity_last_seen(3).unwrap().is_none());
    }

    #[test]
    fn test_processed_paths() {
        let db = test_db();
        db.record_occurrence(Path::new("/x/1.jpg"), 0, BoundingBox::new(0, 0, 1, 1)).unwrap();
        db.record_occurrence(Path::new("/x/2.png"), 0, BoundingBox::new(0, 0, 1, 1)).unwrap();
        db.record_occurrence(Path::new("/x/2.png"), 1, BoundingBox::new(0, 0, 1, 1)).unwrap();

        let processed = db.processed_paths().unwrap();
        assert_eq!(processed.len(), 2);
        assert!(processed.contains(Path::new("/x/1.jpg")));
        assert!(processed.contains(Path::new("/x/2.png")));
    }

    #[test]
    fn test_modified_at_uses_file_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("real.jpg");
        std::fs::write(&path, b"not really a jpeg").unwrap();

        let db = test_db();
        db.record_occurrence(&path, 0, BoundingBox::new(0, 0, 1, 1)).unwrap();
        let stored: String = db
            .conn()
            .query_row("SELECT modified_at FROM images", [], |row| row.get(0))
            .unwrap();
        let expected = DateTime::<Utc>::from(std::fs::metadata(&path).unwrap().modified().unwrap());
        assert_eq!(stored, timestamp(expected));
    }
}
