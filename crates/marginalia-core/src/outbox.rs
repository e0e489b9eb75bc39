//! Durable outbox of pending server mutations.
//!
//! The outbox is a single FIFO per review, stored in `pending_mutations`.
//! Every operation is one SQL statement or one transaction, so a crash at any
//! point leaves exactly the set of entries that were not yet acknowledged.
//!
//! Delivery is strictly ordered: only the head entry is ever eligible. A head
//! entry that reached the attempt cap blocks everything behind it until an
//! operator calls [`Outbox::reset_saturated`].

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};
use tracing::{debug, info};

use crate::{
    db::now_us,
    error::Result,
    model::{Action, Mutation, NewMutation, Payload},
};

/// Attempt cap used when the configuration does not override it.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Where an enqueued mutation ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Appended at the tail with a fresh sequence id.
    Appended(i64),
    /// Folded into an existing queued entry of the same action and target.
    Coalesced(i64),
}

impl Enqueued {
    #[must_use]
    pub const fn seq(self) -> i64 {
        match self {
            Self::Appended(seq) | Self::Coalesced(seq) => seq,
        }
    }
}

/// View of one review's outbox over a borrowed connection.
///
/// Pass a [`rusqlite::Transaction`] (it derefs to `Connection`) to make an
/// enqueue atomic with the mirror write that caused it.
#[derive(Debug, Clone, Copy)]
pub struct Outbox<'c> {
    conn: &'c Connection,
    review_id: &'c str,
    max_attempts: u32,
    in_flight: Option<i64>,
}

impl<'c> Outbox<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection, review_id: &'c str) -> Self {
        Self {
            conn,
            review_id,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            in_flight: None,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Mark the entry currently being delivered; it is never coalesced into.
    #[must_use]
    pub const fn with_in_flight(mut self, seq: Option<i64>) -> Self {
        self.in_flight = seq;
        self
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Persist a mutation, coalescing edits into a queued entry when allowed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the write fails and
    /// [`crate::SyncError::Corrupt`] if the payload cannot be encoded.
    pub fn enqueue(&self, mutation: &NewMutation) -> Result<Enqueued> {
        let payload_json = serde_json::to_string(&mutation.payload)?;

        if mutation.action.is_coalescable()
            && let Some(seq) = self.coalesce_target(mutation.action, &mutation.target_id)?
        {
            self.conn.execute(
                "UPDATE pending_mutations SET payload_json = ?1 WHERE seq = ?2",
                params![payload_json, seq],
            )?;
            debug!(
                seq,
                action = %mutation.action,
                target = %mutation.target_id,
                "coalesced pending edit"
            );
            return Ok(Enqueued::Coalesced(seq));
        }

        self.conn.execute(
            "INSERT INTO pending_mutations (
                review_id, action, target_id, payload_json,
                attempts, online_only, enqueued_at_us
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                self.review_id,
                mutation.action.as_str(),
                mutation.target_id,
                payload_json,
                mutation.online_only,
                now_us(),
            ],
        )?;
        let seq = self.conn.last_insert_rowid();
        debug!(
            seq,
            action = %mutation.action,
            target = %mutation.target_id,
            "enqueued mutation"
        );
        Ok(Enqueued::Appended(seq))
    }

    /// Remove an entry after the server confirmed it. Returns `false` if the
    /// entry was already gone.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the delete fails.
    pub fn acknowledge(&self, seq: i64) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM pending_mutations WHERE review_id = ?1 AND seq = ?2",
            params![self.review_id, seq],
        )?;
        Ok(removed > 0)
    }

    /// Count a failed attempt and keep the entry in place. Returns the new
    /// attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the update fails.
    pub fn mark_failed(&self, seq: i64, error: &str) -> Result<u32> {
        let attempts: Option<i64> = self
            .conn
            .query_row(
                "UPDATE pending_mutations
                 SET attempts = attempts + 1, last_error = ?3
                 WHERE review_id = ?1 AND seq = ?2
                 RETURNING attempts",
                params![self.review_id, seq, error],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempts.map_or(0, clamp_attempts))
    }

    /// Re-arm every saturated entry. Returns how many were reset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the update fails.
    pub fn reset_saturated(&self) -> Result<usize> {
        let reset = self.conn.execute(
            "UPDATE pending_mutations SET attempts = 0
             WHERE review_id = ?1 AND attempts >= ?2",
            params![self.review_id, self.max_attempts],
        )?;
        if reset > 0 {
            info!(review = self.review_id, reset, "re-armed saturated mutations");
        }
        Ok(reset)
    }

    /// Drop queued online-only entries when connectivity is lost. The entry
    /// on the wire is left for its response to settle. Returns how many were
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the delete fails.
    pub fn discard_online_only(&self) -> Result<usize> {
        let dropped = self.conn.execute(
            "DELETE FROM pending_mutations
             WHERE review_id = ?1 AND online_only = 1 AND seq IS NOT ?2",
            params![self.review_id, self.in_flight],
        )?;
        if dropped > 0 {
            debug!(review = self.review_id, dropped, "dropped online-only entries");
        }
        Ok(dropped)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The head entry, if it is below the attempt cap.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails or a stored
    /// row cannot be decoded.
    pub fn peek_oldest_eligible(&self) -> Result<Option<Mutation>> {
        Ok(self
            .head()?
            .filter(|head| head.attempts < self.max_attempts))
    }

    /// The head entry regardless of its attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn head(&self) -> Result<Option<Mutation>> {
        let head = self
            .conn
            .query_row(
                &format!("{SELECT_MUTATION} WHERE review_id = ?1 ORDER BY seq ASC LIMIT 1"),
                [self.review_id],
                row_to_mutation,
            )
            .optional()?;
        Ok(head)
    }

    /// All entries in delivery order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn list(&self) -> Result<Vec<Mutation>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_MUTATION} WHERE review_id = ?1 ORDER BY seq ASC"))?;
        let rows = stmt.query_map([self.review_id], row_to_mutation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Entries at or above the attempt cap.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn saturated(&self) -> Result<Vec<Mutation>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_MUTATION} WHERE review_id = ?1 AND attempts >= ?2 ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![self.review_id, self.max_attempts], row_to_mutation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Number of pending entries per target annotation id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn pending_targets(&self) -> Result<HashMap<String, usize>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_id, COUNT(*) FROM pending_mutations
             WHERE review_id = ?1 GROUP BY target_id",
        )?;
        let rows = stmt.query_map([self.review_id], |row| {
            let count: i64 = row.get(1)?;
            Ok((row.get::<_, String>(0)?, usize::try_from(count).unwrap_or(0)))
        })?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    /// Number of pending entries targeting one annotation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn pending_for(&self, target_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_mutations WHERE review_id = ?1 AND target_id = ?2",
            params![self.review_id, target_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_mutations WHERE review_id = ?1",
            [self.review_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// # Errors
    ///
    /// Returns [`crate::SyncError::Storage`] if the query fails.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn coalesce_target(&self, action: Action, target_id: &str) -> Result<Option<i64>> {
        let seq = self
            .conn
            .query_row(
                "SELECT seq FROM pending_mutations
                 WHERE review_id = ?1 AND target_id = ?2 AND action = ?3 AND seq IS NOT ?4
                 ORDER BY seq DESC LIMIT 1",
                params![self.review_id, target_id, action.as_str(), self.in_flight],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const SELECT_MUTATION: &str = "SELECT seq, action, target_id, payload_json, attempts,
        online_only, enqueued_at_us, last_error
    FROM pending_mutations";

fn row_to_mutation(row: &Row<'_>) -> rusqlite::Result<Mutation> {
    let action: String = row.get(1)?;
    let action = action
        .parse::<Action>()
        .map_err(|msg| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, msg.into()))?;
    let payload_json: String = row.get(3)?;
    let payload: Payload = serde_json::from_str(&payload_json)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;

    Ok(Mutation {
        seq: row.get(0)?,
        action,
        target_id: row.get(2)?,
        payload,
        attempts: clamp_attempts(row.get(4)?),
        online_only: row.get(5)?,
        enqueued_at_us: row.get(6)?,
        last_error: row.get(7)?,
    })
}

fn clamp_attempts(raw: i64) -> u32 {
    u32::try_from(raw.max(0)).unwrap_or(u32::MAX)
}
