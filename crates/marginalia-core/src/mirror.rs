//! Persistent mirror of every annotation known to this client.
//!
//! Rows keep their first-seen `arrival_seq` forever; it is the fallback
//! display order and the order replies are listed in. Records are never
//! hard-deleted: a delete is a tombstone (`deleted = 1`).

use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};
use tracing::debug;

use crate::{
    db::now_us,
    error::Result,
    model::{Annotation, AnnotationKind, FetchedAnnotation, Rect, Status},
};

/// Outcome of merging a fetched list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    /// Records whose local edits were kept over the server copy.
    pub kept_local: usize,
}

impl MergeReport {
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.inserted + self.updated > 0
    }
}

/// View of one review's mirror over a borrowed connection.
#[derive(Debug, Clone, Copy)]
pub struct Mirror<'c> {
    conn: &'c Connection,
    review_id: &'c str,
}

impl<'c> Mirror<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection, review_id: &'c str) -> Self {
        Self { conn, review_id }
    }

    /// Store a local edit and flag it `unsynced`. Returns the stored copy.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the write fails.
    pub fn upsert_local(&self, record: Annotation) -> Result<Annotation> {
        let mut stored = match self.get(&record.id)? {
            Some(mut existing) => {
                existing.absorb_local(record);
                existing
            }
            None => {
                let mut fresh = record;
                fresh.normalize();
                fresh
            }
        };
        stored.unsynced = true;
        self.write(&stored)?;
        Ok(stored)
    }

    /// Merge the authoritative list returned by the server.
    ///
    /// Records absent from `fetched` are left untouched. A record read
    /// locally stays read while the server still reports it unread.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if any write fails.
    pub fn merge_fetched(&self, fetched: Vec<FetchedAnnotation>) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        for incoming in fetched {
            if incoming.id.trim().is_empty() {
                debug!("skipping fetched annotation without id");
                continue;
            }
            match self.get(&incoming.id)? {
                Some(mut existing) => {
                    let before = existing.clone();
                    if existing.unsynced {
                        report.kept_local += 1;
                    }
                    let server_unread = incoming.unread == Some(true);
                    existing.absorb_fetched(incoming);
                    if self.has_read_marker(&existing.id)? {
                        if server_unread {
                            existing.unread = false;
                        } else {
                            self.clear_read_marker(&existing.id)?;
                        }
                    }
                    if existing != before {
                        self.write(&existing)?;
                        report.updated += 1;
                    }
                }
                None => {
                    self.write(&Annotation::from_fetched(incoming))?;
                    report.inserted += 1;
                }
            }
        }
        Ok(report)
    }

    /// Clear the `unsynced` flag after the server confirmed the last pending
    /// mutation for this record. Returns `false` if the record is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the update fails.
    pub fn mark_synced(&self, id: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE annotations SET unsynced = 0 WHERE review_id = ?1 AND annotation_id = ?2",
            params![self.review_id, id],
        )?;
        Ok(changed > 0)
    }

    /// Clear the `unread` badge locally and leave a read marker until the
    /// server confirms. Returns `true` if the badge was set.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the update fails.
    pub fn mark_read(&self, id: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE annotations SET unread = 0
             WHERE review_id = ?1 AND annotation_id = ?2 AND unread = 1",
            params![self.review_id, id],
        )?;
        if changed > 0 {
            self.conn.execute(
                "INSERT OR IGNORE INTO read_markers (review_id, annotation_id, marked_at_us)
                 VALUES (?1, ?2, ?3)",
                params![self.review_id, id, now_us()],
            )?;
        }
        Ok(changed > 0)
    }

    /// Records read locally whose read state the server has not confirmed,
    /// oldest read first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn read_markers(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT annotation_id FROM read_markers
             WHERE review_id = ?1 ORDER BY marked_at_us ASC, annotation_id ASC",
        )?;
        let rows = stmt.query_map([self.review_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    /// Drop the read marker once the server has the receipt.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the delete fails.
    pub fn clear_read_marker(&self, id: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM read_markers WHERE review_id = ?1 AND annotation_id = ?2",
            params![self.review_id, id],
        )?;
        Ok(removed > 0)
    }

    fn has_read_marker(&self, id: &str) -> Result<bool> {
        let marked: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM read_markers WHERE review_id = ?1 AND annotation_id = ?2)",
            params![self.review_id, id],
            |row| row.get(0),
        )?;
        Ok(marked)
    }

    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn get(&self, id: &str) -> Result<Option<Annotation>> {
        let record = self
            .conn
            .query_row(
                &format!("{SELECT_ANNOTATION} WHERE review_id = ?1 AND annotation_id = ?2"),
                params![self.review_id, id],
                row_to_annotation,
            )
            .optional()?;
        Ok(record)
    }

    /// Every record, tombstones included, in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn get_all(&self) -> Result<Vec<Annotation>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_ANNOTATION} WHERE review_id = ?1 ORDER BY arrival_seq ASC"
        ))?;
        let rows = stmt.query_map([self.review_id], row_to_annotation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Records owned by one page, in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn by_page(&self, page_id: u32) -> Result<Vec<Annotation>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_ANNOTATION} WHERE review_id = ?1 AND page_id = ?2 ORDER BY arrival_seq ASC"
        ))?;
        let rows = stmt.query_map(params![self.review_id, page_id], row_to_annotation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -----------------------------------------------------------------------
    // Review metadata
    // -----------------------------------------------------------------------

    /// Whether the server last reported this review as closed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn review_closed(&self) -> Result<bool> {
        let closed: Option<bool> = self
            .conn
            .query_row(
                "SELECT closed FROM review_meta WHERE review_id = ?1",
                [self.review_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(closed.unwrap_or(false))
    }

    /// Record the review state reported by the latest fetch.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the write fails.
    pub fn record_fetch(&self, closed: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO review_meta (review_id, closed, last_fetch_at_us)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(review_id) DO UPDATE SET
                closed = excluded.closed,
                last_fetch_at_us = excluded.last_fetch_at_us",
            params![self.review_id, closed, now_us()],
        )?;
        Ok(())
    }

    fn write(&self, record: &Annotation) -> Result<()> {
        let rects_json = serde_json::to_string(&record.rects)?;
        self.conn.execute(
            "INSERT INTO annotations (
                review_id, annotation_id, arrival_seq, page_id, reply_to_id, author,
                msg, kind, rects_json, status, secs_utc, owner, unsynced, unread, deleted
            ) VALUES (
                ?1, ?2,
                (SELECT COALESCE(MAX(arrival_seq), 0) + 1 FROM annotations WHERE review_id = ?1),
                ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
            )
            ON CONFLICT(review_id, annotation_id) DO UPDATE SET
                page_id = excluded.page_id,
                reply_to_id = excluded.reply_to_id,
                author = excluded.author,
                msg = excluded.msg,
                kind = excluded.kind,
                rects_json = excluded.rects_json,
                status = excluded.status,
                secs_utc = excluded.secs_utc,
                owner = excluded.owner,
                unsynced = excluded.unsynced,
                unread = excluded.unread,
                deleted = excluded.deleted",
            params![
                self.review_id,
                record.id,
                record.page_id,
                record.reply_to_id,
                record.author,
                record.msg,
                record.kind.map(AnnotationKind::as_str),
                rects_json,
                record.status.as_str(),
                record.secs_utc,
                record.owner,
                record.unsynced,
                record.unread,
                record.deleted,
            ],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const SELECT_ANNOTATION: &str = "SELECT annotation_id, author, msg, rects_json, page_id,
        reply_to_id, status, kind, secs_utc, owner, unsynced, unread, deleted
    FROM annotations";

fn row_to_annotation(row: &Row<'_>) -> rusqlite::Result<Annotation> {
    let rects_json: String = row.get(3)?;
    let rects: Vec<Rect> = serde_json::from_str(&rects_json)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;
    let kind: Option<String> = row.get(7)?;
    let status: String = row.get(6)?;

    Ok(Annotation {
        id: row.get(0)?,
        author: row.get(1)?,
        msg: row.get(2)?,
        rects,
        page_id: row.get(4)?,
        reply_to_id: row.get(5)?,
        status: Status::new(status),
        kind: kind.map(|raw| raw.parse().unwrap_or(AnnotationKind::Other)),
        secs_utc: row.get(8)?,
        owner: row.get(9)?,
        unsynced: row.get(10)?,
        unread: row.get(11)?,
        deleted: row.get(12)?,
    })
}
