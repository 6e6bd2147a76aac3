//! Local snapshot catalog
//!
//! When creating backup snapshots, a local database of data blocks and
//! checksums is maintained in addition to the data contents (which may be
//! stored remotely). The database is consulted when building incremental
//! snapshots, as it says which objects can be reused.
//!
//! A `LocalDb` lives for exactly one snapshot session, bounded by an outer
//! transaction: `open` begins it and `close` commits it, so the on-disk
//! catalog either records the whole snapshot or none of it.

use crate::db::{self, from_rusqlite};
use crate::migrations;
use cirrus_core::error::{invariant, Result};
use cirrus_core::reference::ObjectReference;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Transactional catalog for one snapshot session.
pub struct LocalDb {
    conn: Connection,
    snapshot_id: i64,
}

impl LocalDb {
    /// Open the catalog, begin the session transaction, and register a new
    /// snapshot row named `snapshot_name` with the current Julian-day
    /// timestamp.
    pub fn open(
        path: impl AsRef<Path>,
        snapshot_name: &str,
        snapshot_scheme: Option<&str>,
    ) -> Result<Self> {
        let mut conn = db::open(path)?;
        migrations::apply_migrations(&mut conn)?;

        conn.execute_batch("BEGIN")
            .map_err(|e| from_rusqlite("begin_session", e))?;

        conn.execute(
            "INSERT INTO snapshots (name, scheme, timestamp)
             VALUES (?1, ?2, julianday('now'))",
            params![snapshot_name, snapshot_scheme],
        )
        .map_err(|e| from_rusqlite("insert_snapshot", e))?;

        let snapshot_id = conn.last_insert_rowid();
        if snapshot_id == 0 {
            return Err(invariant("snapshot insert did not yield an id"));
        }

        // Transient membership table: one row per object used by this
        // snapshot, summarized into segments_used at close.
        conn.execute_batch(
            "CREATE TEMPORARY TABLE snapshot_refs (
                 segmentid INTEGER NOT NULL,
                 object TEXT NOT NULL,
                 size INTEGER NOT NULL
             );
             CREATE UNIQUE INDEX snapshot_refs_index
                 ON snapshot_refs (segmentid, object)",
        )
        .map_err(|e| from_rusqlite("create_snapshot_refs", e))?;

        tracing::debug!(snapshot_id, name = snapshot_name, "opened snapshot session");

        Ok(LocalDb { conn, snapshot_id })
    }

    /// Row id of this session's snapshot.
    pub fn snapshot_id(&self) -> i64 {
        self.snapshot_id
    }

    /// Summarize `snapshot_refs` into `segments_used`, commit, and close.
    ///
    /// The transaction is the unit of atomicity, so failures here are
    /// logged rather than returned: a failed commit simply leaves the
    /// snapshot provisional.
    pub fn close(self) {
        let result = self.conn.execute(
            "INSERT INTO segments_used
             SELECT ?1 AS snapshotid, segmentid,
                    CAST(used AS REAL) / size AS utilization
             FROM (SELECT segmentid, SUM(size) AS used
                   FROM snapshot_refs GROUP BY segmentid)
             JOIN segments USING (segmentid)",
            params![self.snapshot_id],
        );
        if let Err(e) = result {
            tracing::error!(error = %e, "unable to create segment usage summary");
        }

        if let Err(e) = self.conn.execute_batch("COMMIT") {
            tracing::error!(error = %e, "cannot commit snapshot catalog");
        }
    }

    /// Map a segment name to its integer key, creating the row if needed.
    /// Never creates duplicate names.
    pub fn segment_to_id(&self, segment: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO segments (segment) VALUES (?1)",
                params![segment],
            )
            .map_err(|e| from_rusqlite("segment_to_id", e))?;

        self.conn
            .query_row(
                "SELECT segmentid FROM segments WHERE segment = ?1",
                params![segment],
                |row| row.get(0),
            )
            .map_err(|e| from_rusqlite("segment_to_id", e))
    }

    /// Map a segment integer key back to its name.
    pub fn id_to_segment(&self, segment_id: i64) -> Result<String> {
        self.conn
            .query_row(
                "SELECT segment FROM segments WHERE segmentid = ?1",
                params![segment_id],
                |row| row.get(0),
            )
            .map_err(|e| from_rusqlite("id_to_segment", e))
    }

    /// Record a stored object in the block index. `age` is a Julian-day
    /// timestamp used when re-importing old references; `None` means now.
    pub fn store_object(
        &self,
        reference: &ObjectReference,
        checksum: &str,
        size: u64,
        age: Option<f64>,
    ) -> Result<()> {
        let (segment, sequence) = match reference {
            ObjectReference::Normal { segment, sequence } => (segment, sequence),
            _ => return Err(invariant("cannot index a special reference")),
        };
        let segment_id = self.segment_to_id(segment)?;

        match age {
            None => self
                .conn
                .execute(
                    "INSERT INTO block_index
                         (segmentid, object, checksum, size, timestamp)
                     VALUES (?1, ?2, ?3, ?4, julianday('now'))",
                    params![segment_id, sequence, checksum, size as i64],
                )
                .map_err(|e| from_rusqlite("store_object", e))?,
            Some(age) => self
                .conn
                .execute(
                    "INSERT INTO block_index
                         (segmentid, object, checksum, size, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![segment_id, sequence, checksum, size as i64, age],
                )
                .map_err(|e| from_rusqlite("store_object", e))?,
        };

        Ok(())
    }

    /// Find a live object with the given content, for reuse by reference.
    /// Selection is deterministic: the lowest `(segmentid, object)` match
    /// wins. Expired rows are never returned.
    pub fn find_object(&self, checksum: &str, size: u64) -> Result<Option<ObjectReference>> {
        let row = self
            .conn
            .query_row(
                "SELECT segmentid, object FROM block_index
                 WHERE checksum = ?1 AND size = ?2 AND expired IS NULL
                 ORDER BY segmentid ASC, object ASC
                 LIMIT 1",
                params![checksum, size as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| from_rusqlite("find_object", e))?;

        match row {
            Some((segment_id, object)) => {
                let segment = self.id_to_segment(segment_id)?;
                Ok(Some(ObjectReference::normal(segment, object)))
            }
            None => Ok(None),
        }
    }

    /// Look up any indexed copy of the given content, expired or not.
    /// Returns the stored timestamp and the expired group (0 while live).
    pub fn is_old_object(&self, checksum: &str, size: u64) -> Result<Option<(f64, i64)>> {
        self.conn
            .query_row(
                "SELECT timestamp, expired FROM block_index
                 WHERE checksum = ?1 AND size = ?2
                 LIMIT 1",
                params![checksum, size as i64],
                |row| {
                    let age: f64 = row.get(0)?;
                    let group: Option<i64> = row.get(1)?;
                    Ok((age, group.unwrap_or(0)))
                },
            )
            .optional()
            .map_err(|e| from_rusqlite("is_old_object", e))
    }

    /// Does this object still exist in the index (and not expired)?
    /// Special references aren't stored in segments and are always
    /// available.
    pub fn is_available(&self, reference: &ObjectReference) -> Result<bool> {
        let (segment, sequence) = match reference {
            ObjectReference::Normal { segment, sequence } => (segment, sequence),
            _ => return Ok(true),
        };
        let segment_id = self.segment_to_id(segment)?;

        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM block_index
                 WHERE segmentid = ?1 AND object = ?2 AND expired IS NULL",
                params![segment_id, sequence],
                |row| row.get(0),
            )
            .map_err(|e| from_rusqlite("is_available", e))?;

        Ok(count > 0)
    }

    /// Record that this snapshot uses the referenced object. Duplicates
    /// are coalesced; special references are ignored.
    pub fn use_object(&self, reference: &ObjectReference) -> Result<()> {
        let (segment, sequence) = match reference {
            ObjectReference::Normal { segment, sequence } => (segment, sequence),
            _ => return Ok(()),
        };
        let segment_id = self.segment_to_id(segment)?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO snapshot_refs
                 SELECT segmentid, object, size FROM block_index
                 WHERE segmentid = ?1 AND object = ?2",
                params![segment_id, sequence],
            )
            .map_err(|e| from_rusqlite("use_object", e))?;

        Ok(())
    }

    /// Distinct segments referenced by this snapshot so far.
    pub fn used_segments(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT segment FROM snapshot_refs
                 JOIN segments USING (segmentid)
                 ORDER BY segment",
            )
            .map_err(|e| from_rusqlite("used_segments", e))?;

        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| from_rusqlite("used_segments", e))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(|e| from_rusqlite("used_segments", e))?;

        Ok(rows)
    }

    /// Record a sealed segment's staging path and file checksum; the
    /// segment size is the sum of its indexed object sizes. A segment is
    /// never rewritten after this completes.
    pub fn set_segment_checksum(&self, segment: &str, path: &str, checksum: &str) -> Result<()> {
        let segment_id = self.segment_to_id(segment)?;

        self.conn
            .execute(
                "UPDATE segments
                 SET path = ?1, checksum = ?2,
                     size = (SELECT SUM(size) FROM block_index
                             WHERE segmentid = ?3)
                 WHERE segmentid = ?3",
                params![path, checksum, segment_id],
            )
            .map_err(|e| from_rusqlite("set_segment_checksum", e))?;

        Ok(())
    }

    /// Fetch a sealed segment's recorded path and checksum, if both are
    /// set.
    pub fn get_segment_checksum(&self, segment: &str) -> Result<Option<(String, String)>> {
        let row = self
            .conn
            .query_row(
                "SELECT path, checksum FROM segments WHERE segment = ?1",
                params![segment],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| from_rusqlite("get_segment_checksum", e))?;

        Ok(match row {
            Some((Some(path), Some(checksum))) => Some((path, checksum)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_db() -> (LocalDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = LocalDb::open(dir.path().join("catalog.sqlite"), "20260801T120000", None).unwrap();
        (db, dir)
    }

    #[test]
    fn test_open_assigns_snapshot_id() {
        let (db, _dir) = setup_test_db();
        assert!(db.snapshot_id() > 0);
    }

    #[test]
    fn test_segment_to_id_never_duplicates() {
        let (db, _dir) = setup_test_db();
        let a = db.segment_to_id("seg-a").unwrap();
        let b = db.segment_to_id("seg-b").unwrap();
        let a2 = db.segment_to_id("seg-a").unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(db.id_to_segment(a).unwrap(), "seg-a");
    }

    #[test]
    fn test_store_then_find_object() {
        let (db, _dir) = setup_test_db();
        let r = ObjectReference::from_sequence_id("seg-a", 0);
        db.store_object(&r, "abc123", 42, None).unwrap();

        let found = db.find_object("abc123", 42).unwrap();
        assert_eq!(found, Some(r));
        assert_eq!(db.find_object("abc123", 43).unwrap(), None);
        assert_eq!(db.find_object("other", 42).unwrap(), None);
    }

    #[test]
    fn test_find_object_is_deterministic() {
        let (db, _dir) = setup_test_db();
        // Two copies of the same content in different segments; the
        // lowest (segmentid, object) pair must win.
        let first = ObjectReference::from_sequence_id("seg-a", 7);
        let second = ObjectReference::from_sequence_id("seg-b", 1);
        db.store_object(&first, "dup", 10, None).unwrap();
        db.store_object(&second, "dup", 10, None).unwrap();

        assert_eq!(db.find_object("dup", 10).unwrap(), Some(first));
    }

    #[test]
    fn test_store_object_with_age() {
        let (db, _dir) = setup_test_db();
        let r = ObjectReference::from_sequence_id("seg-a", 0);
        db.store_object(&r, "aged", 8, Some(2454000.5)).unwrap();

        let (age, group) = db.is_old_object("aged", 8).unwrap().unwrap();
        assert_eq!(age, 2454000.5);
        assert_eq!(group, 0);
    }

    #[test]
    fn test_is_old_object_missing() {
        let (db, _dir) = setup_test_db();
        assert_eq!(db.is_old_object("nope", 1).unwrap(), None);
    }

    #[test]
    fn test_is_available() {
        let (db, _dir) = setup_test_db();
        let r = ObjectReference::from_sequence_id("seg-a", 0);
        assert!(!db.is_available(&r).unwrap());

        db.store_object(&r, "abc", 1, None).unwrap();
        assert!(db.is_available(&r).unwrap());

        // Special references are always available
        assert!(db.is_available(&ObjectReference::zero()).unwrap());
        assert!(db
            .is_available(&ObjectReference::zero_with_size(4096))
            .unwrap());
    }

    #[test]
    fn test_use_object_coalesces_duplicates() {
        let (db, _dir) = setup_test_db();
        let r = ObjectReference::from_sequence_id("seg-a", 0);
        db.store_object(&r, "abc", 100, None).unwrap();

        db.use_object(&r).unwrap();
        db.use_object(&r).unwrap();
        db.use_object(&ObjectReference::zero()).unwrap();

        assert_eq!(db.used_segments().unwrap(), vec!["seg-a".to_string()]);
    }

    #[test]
    fn test_segment_checksum_roundtrip() {
        let (db, _dir) = setup_test_db();
        let r = ObjectReference::from_sequence_id("seg-a", 0);
        db.store_object(&r, "abc", 100, None).unwrap();

        assert_eq!(db.get_segment_checksum("seg-a").unwrap(), None);

        db.set_segment_checksum("seg-a", "seg-a.tar", "deadbeef")
            .unwrap();
        assert_eq!(
            db.get_segment_checksum("seg-a").unwrap(),
            Some(("seg-a.tar".to_string(), "deadbeef".to_string()))
        );
    }

    #[test]
    fn test_close_materializes_segments_used() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.sqlite");
        let db = LocalDb::open(&path, "snap", Some("test")).unwrap();
        let snapshot_id = db.snapshot_id();

        let a = ObjectReference::from_sequence_id("seg-a", 0);
        let b = ObjectReference::from_sequence_id("seg-a", 1);
        db.store_object(&a, "csum-a", 60, None).unwrap();
        db.store_object(&b, "csum-b", 40, None).unwrap();
        db.use_object(&a).unwrap();
        db.set_segment_checksum("seg-a", "seg-a.tar", "feed").unwrap();
        db.close();

        let conn = rusqlite::Connection::open(&path).unwrap();
        let (got_snapshot, utilization): (i64, f64) = conn
            .query_row(
                "SELECT snapshotid, utilization FROM segments_used",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(got_snapshot, snapshot_id);
        // 60 of 100 bytes referenced
        assert!((utilization - 0.6).abs() < 1e-9);
        assert!(utilization > 0.0 && utilization <= 1.0);
    }

    #[test]
    fn test_session_without_close_leaves_no_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.sqlite");
        {
            let db = LocalDb::open(&path, "abandoned", None).unwrap();
            let r = ObjectReference::from_sequence_id("seg-a", 0);
            db.store_object(&r, "abc", 1, None).unwrap();
            // Dropped without close: the transaction rolls back.
        }

        let conn = rusqlite::Connection::open(&path).unwrap();
        let snapshots: i64 = conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0))
            .unwrap();
        let blocks: i64 = conn
            .query_row("SELECT COUNT(*) FROM block_index", [], |r| r.get(0))
            .unwrap();
        assert_eq!(snapshots, 0);
        assert_eq!(blocks, 0);
    }
}
