//! Identity membership queries and merging.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::occurrences::image_id;
use super::{path_from_key, placeholders, timestamp, Database, IdentityId};

impl Database {
    /// Identities seen in an image. Empty if the image is unknown.
    pub fn identities_in(&self, path: &Path) -> Result<BTreeSet<IdentityId>> {
        let conn = self.conn();
        identities_in(&conn, path)
    }

    /// Images containing the given identity.
    pub fn images_with(&self, identity_id: IdentityId) -> Result<BTreeSet<PathBuf>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT i.path
            FROM occurrences o
            JOIN images i ON o.image_id = i.id
            WHERE o.identity_id = ?
            "#,
        )?;

        let paths = stmt
            .query_map([identity_id], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(path_from_key)
            .collect();

        Ok(paths)
    }

    /// Images containing every one of the given identities.
    pub fn images_with_all(&self, identity_ids: &[IdentityId]) -> Result<BTreeSet<PathBuf>> {
        let ids: BTreeSet<IdentityId> = identity_ids.iter().copied().collect();
        let conn = self.conn();
        images_with_all(&conn, &ids)
    }

    /// Images containing every identity that appears in `path`.
    ///
    /// Both lookups run under one lock so a concurrent merge cannot slip in
    /// between them.
    pub fn images_with_all_in(&self, path: &Path) -> Result<BTreeSet<PathBuf>> {
        let conn = self.conn();
        let ids = identities_in(&conn, path)?;
        images_with_all(&conn, &ids)
    }

    /// Fold `other_ids` into `primary_id`.
    ///
    /// Every occurrence of an id in `other_ids` is redirected to `primary_id`
    /// and the merged-away identity rows are deleted. The embedding index is
    /// not touched. Returns the number of redirected occurrences.
    pub fn merge(&self, primary_id: IdentityId, other_ids: &[IdentityId]) -> Result<usize> {
        let others: Vec<IdentityId> = other_ids
            .iter()
            .copied()
            .filter(|id| *id != primary_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if others.is_empty() {
            return Ok(0);
        }

        let in_clause = placeholders(others.len());
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let affected: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM occurrences WHERE identity_id IN ({in_clause})"),
            params_from_iter(others.iter()),
            |row| row.get(0),
        )?;

        if affected > 0 {
            // Occurrences must never point at a missing identity row.
            tx.execute(
                "INSERT OR IGNORE INTO identities (id, last_seen_at) VALUES (?, ?)",
                params![primary_id, timestamp(Utc::now())],
            )?;
        }

        let redirected = tx.execute(
            &format!("UPDATE occurrences SET identity_id = ? WHERE identity_id IN ({in_clause})"),
            params_from_iter(std::iter::once(&primary_id).chain(others.iter())),
        )?;

        tx.execute(
            &format!("DELETE FROM identities WHERE id IN ({in_clause})"),
            params_from_iter(others.iter()),
        )?;

        tx.commit()?;

        tracing::info!(primary = primary_id, merged = ?others, redirected, "Merged identities");
        Ok(redirected)
    }
}

fn identities_in(conn: &Connection, path: &Path) -> Result<BTreeSet<IdentityId>> {
    let Some(id) = image_id(conn, path)? else {
        return Ok(BTreeSet::new());
    };

    let mut stmt = conn.prepare("SELECT DISTINCT identity_id FROM occurrences WHERE image_id = ?")?;
    let ids = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<BTreeSet<IdentityId>>>()?;

    Ok(ids)
}

fn images_with_all(conn: &Connection, ids: &BTreeSet<IdentityId>) -> Result<BTreeSet<PathBuf>> {
    if ids.is_empty() {
        return Ok(BTreeSet::new());
    }

    let sql = format!(
        r#"
        SELECT i.path
        FROM occurrences o
        JOIN images i ON o.image_id = i.id
        WHERE o.identity_id IN ({})
        GROUP BY i.id
        HAVING COUNT(DISTINCT o.identity_id) = ?
        "#,
        placeholders(ids.len())
    );

    let mut stmt = conn.prepare(&sql)?;
    let required = ids.len() as i64;
    let paths = stmt
        .query_map(params_from_iter(ids.iter().chain(std::iter::once(&required))), |row| {
            row.get::<_, Vec<u8>>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(path_from_key)
        .collect();

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BoundingBox;

    fn bbox() -> BoundingBox {
        BoundingBox::new(0, 0, 10, 10)
    }

    /// a.jpg: 1, 2    b.jpg: 1, 2, 3    c.jpg: 3    d.jpg: 2
    fn populated_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let rows: &[(&str, IdentityId)] = &[
            ("/p/a.jpg", 1),
            ("/p/a.jpg", 2),
            ("/p/b.jpg", 1),
            ("/p/b.jpg", 2),
            ("/p/b.jpg", 3),
            ("/p/c.jpg", 3),
            ("/p/d.jpg", 2),
        ];
        for (path, id) in rows {
            db.record_occurrence(Path::new(path), *id, bbox()).unwrap();
        }
        db
    }

    fn paths(items: &[&str]) -> BTreeSet<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_identities_in() {
        let db = populated_db();
        assert_eq!(
            db.identities_in(Path::new("/p/b.jpg")).unwrap(),
            BTreeSet::from([1, 2, 3])
        );
        assert!(db.identities_in(Path::new("/p/missing.jpg")).unwrap().is_empty());
    }

    #[test]
    fn test_images_with() {
        let db = populated_db();
        assert_eq!(db.images_with(2).unwrap(), paths(&["/p/a.jpg", "/p/b.jpg", "/p/d.jpg"]));
        assert!(db.images_with(99).unwrap().is_empty());
    }

    #[test]
    fn test_images_with_all() {
        let db = populated_db();
        assert_eq!(db.images_with_all(&[1, 2]).unwrap(), paths(&["/p/a.jpg", "/p/b.jpg"]));
        assert_eq!(db.images_with_all(&[2, 3]).unwrap(), paths(&["/p/b.jpg"]));
        assert!(db.images_with_all(&[1, 99]).unwrap().is_empty());
    }

    #[test]
    fn test_images_with_all_edge_cases() {
        let db = populated_db();
        assert!(db.images_with_all(&[]).unwrap().is_empty());
        assert_eq!(db.images_with_all(&[3]).unwrap(), db.images_with(3).unwrap());
        // Duplicate ids in the input count once
        assert_eq!(db.images_with_all(&[1, 1, 2]).unwrap(), paths(&["/p/a.jpg", "/p/b.jpg"]));
    }

    #[test]
    fn test_same_identity_twice_in_one_image() {
        let db = populated_db();
        db.record_occurrence(Path::new("/p/c.jpg"), 3, BoundingBox::new(20, 20, 30, 30)).unwrap();
        assert_eq!(db.images_with_all(&[3]).unwrap(), paths(&["/p/b.jpg", "/p/c.jpg"]));
    }

    #[test]
    fn test_images_with_all_in() {
        let db = populated_db();
        assert_eq!(db.images_with_all_in(Path::new("/p/a.jpg")).unwrap(), paths(&["/p/a.jpg", "/p/b.jpg"]));
        assert!(db.images_with_all_in(Path::new("/p/missing.jpg")).unwrap().is_empty());
    }

    #[test]
    fn test_merge_redirects_and_deletes() {
        let db = populated_db();
        let before: BTreeSet<PathBuf> = [1, 2, 3]
            .iter()
            .flat_map(|id| db.images_with(*id).unwrap())
            .collect();

        let redirected = db.merge(1, &[2, 3]).unwrap();
        assert_eq!(redirected, 5);

        assert!(db.images_with(2).unwrap().is_empty());
        assert!(db.images_with(3).unwrap().is_empty());
        assert_eq!(db.images_with(1).unwrap(), before);
        assert!(db.identity_last_seen(2).unwrap().is_none());
        assert!(db.identity_last_seen(3).unwrap().is_none());
        assert_eq!(db.stats().unwrap().identities, 1);
    }

    #[test]
    fn test_merge_noop_cases() {
        let db = populated_db();
        let before = db.stats().unwrap();

        assert_eq!(db.merge(1, &[]).unwrap(), 0);
        assert_eq!(db.merge(1, &[1]).unwrap(), 0);
        assert_eq!(db.stats().unwrap(), before);
    }

    #[test]
    fn test_merge_into_unknown_primary_creates_row() {
        let db = populated_db();
        db.merge(42, &[3]).unwrap();

        assert!(db.identity_last_seen(42).unwrap().is_some());
        assert_eq!(db.images_with(42).unwrap(), paths(&["/p/b.jpg", "/p/c.jpg"]));
    }

    #[test]
    fn test_merged_id_is_recreated_on_next_occurrence() {
        let db = populated_db();
        db.merge(1, &[2]).unwrap();
        assert!(db.identity_last_seen(2).unwrap().is_none());

        db.record_occurrence(Path::new("/p/e.jpg"), 2, bbox()).unwrap();
        assert!(db.identity_last_seen(2).unwrap().is_some());
        assert_eq!(db.images_with(2).unwrap(), paths(&["/p/e.jpg"]));
    }
}
