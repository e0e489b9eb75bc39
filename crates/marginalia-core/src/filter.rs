//! Filter projection: which mirror records are visible under the current
//! criteria.
//!
//! [`project`] is a pure function of the mirror contents, the criteria and the
//! focused record. The session re-runs it after every mirror write and every
//! criteria change; nothing is cached between runs.

use std::collections::{BTreeSet, HashSet};

use regex::{Regex, RegexBuilder};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    db::now_us,
    error::Result,
    model::{Annotation, Status},
    thread::{ancestors, index_by_id, root_of},
};

/// Reviewer-chosen filter criteria, persisted per review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    /// Regular expression matched against the message. Empty matches all.
    pub text: String,
    pub case_sensitive: bool,
    pub unread_only: bool,
    /// Root statuses to hide.
    pub excluded_statuses: BTreeSet<Status>,
    /// Root authors to hide.
    pub excluded_authors: BTreeSet<String>,
}

impl FilterCriteria {
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.text.is_empty()
            || self.unread_only
            || !self.excluded_statuses.is_empty()
            || !self.excluded_authors.is_empty()
    }
}

/// Visibility of one tracked record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisibilityEntry {
    pub id: String,
    pub visible: bool,
}

/// Output of one projection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Projection {
    pub visible_roots: usize,
    /// Non-deleted thread roots.
    pub total_roots: usize,
    /// One entry per tracked record, in mirror order.
    pub entries: Vec<VisibilityEntry>,
}

impl Projection {
    /// `None` if the record is not tracked (unknown or acknowledged tombstone).
    #[must_use]
    pub fn is_visible(&self, id: &str) -> Option<bool> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.visible)
    }

    #[must_use]
    pub fn visible_ids(&self) -> HashSet<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.visible)
            .map(|entry| entry.id.as_str())
            .collect()
    }
}

enum TextMatcher {
    All,
    Pattern(Regex),
}

impl TextMatcher {
    fn new(criteria: &FilterCriteria) -> Self {
        if criteria.text.is_empty() {
            return Self::All;
        }
        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(!criteria.case_sensitive)
                .build()
        };
        match build(&criteria.text) {
            Ok(regex) => Self::Pattern(regex),
            Err(err) => {
                debug!(pattern = %criteria.text, %err, "invalid filter regex, matching literally");
                build(&regex::escape(&criteria.text)).map_or(Self::All, Self::Pattern)
            }
        }
    }

    fn matches(&self, msg: &str) -> bool {
        match self {
            Self::All => true,
            Self::Pattern(regex) => regex.is_match(msg),
        }
    }
}

/// Compute record visibility.
///
/// A record is visible when it is not deleted, no ancestor is deleted, its
/// parent is visible, and it is marked. A record is marked when it is the
/// focused record or matches every active criterion; status and author
/// criteria only apply to roots. A match driven by the text pattern, the
/// unread-only flag, or focus also marks the whole ancestor chain.
#[must_use]
pub fn project(
    records: &[Annotation],
    criteria: &FilterCriteria,
    focused: Option<&str>,
) -> Projection {
    let index = index_by_id(records);
    let text = TextMatcher::new(criteria);
    let text_active = !criteria.text.is_empty();

    let mut marked: HashSet<&str> = HashSet::new();
    for record in records.iter().filter(|record| !record.deleted) {
        let is_focused = focused == Some(record.id.as_str());
        let text_match = text.matches(&record.msg);
        let unread_match = !criteria.unread_only || record.unread;
        let status_match = !record.is_root() || !criteria.excluded_statuses.contains(&record.status);
        let author_match = !record.is_root()
            || record
                .author
                .as_ref()
                .is_none_or(|author| !criteria.excluded_authors.contains(author));

        let matched = text_match && unread_match && status_match && author_match;
        if !(is_focused || matched) {
            continue;
        }
        marked.insert(record.id.as_str());

        let bubbles = is_focused
            || (matched && text_active)
            || (matched && criteria.unread_only);
        if bubbles {
            for ancestor in ancestors(&index, &record.id) {
                if ancestor.deleted {
                    break;
                }
                marked.insert(ancestor.id.as_str());
            }
        }
    }

    let mut projection = Projection::default();
    for record in records {
        if record.deleted && !record.unsynced {
            continue;
        }
        let visible = !record.deleted
            && marked.contains(record.id.as_str())
            && root_of(&index, &record.id).is_some()
            && ancestors(&index, &record.id)
                .iter()
                .all(|ancestor| !ancestor.deleted && marked.contains(ancestor.id.as_str()));

        if record.is_root() && !record.deleted {
            projection.total_roots += 1;
            if visible {
                projection.visible_roots += 1;
            }
        }
        projection.entries.push(VisibilityEntry {
            id: record.id.clone(),
            visible,
        });
    }
    projection
}

/// Distinct authors of non-deleted records, for filter pickers.
#[must_use]
pub fn reviewers(records: &[Annotation]) -> BTreeSet<String> {
    records
        .iter()
        .filter(|record| !record.deleted)
        .filter_map(|record| record.author.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Load saved criteria, or the empty criteria if none were saved.
///
/// # Errors
///
/// Returns [`crate::SyncError::Storage`] if the query fails and
/// [`crate::SyncError::Corrupt`] if the stored JSON is unreadable.
pub fn load_criteria(conn: &Connection, review_id: &str) -> Result<FilterCriteria> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT criteria_json FROM filter_state WHERE review_id = ?1",
            [review_id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(FilterCriteria::default()),
    }
}

/// # Errors
///
/// Returns [`crate::SyncError::Storage`] if the write fails.
pub fn save_criteria(conn: &Connection, review_id: &str, criteria: &FilterCriteria) -> Result<()> {
    let json = serde_json::to_string(criteria)?;
    conn.execute(
        "INSERT INTO filter_state (review_id, criteria_json, updated_at_us)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(review_id) DO UPDATE SET
            criteria_json = excluded.criteria_json,
            updated_at_us = excluded.updated_at_us",
        params![review_id, json, now_us()],
    )?;
    Ok(())
}
