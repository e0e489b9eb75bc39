use serde::{Deserialize, Serialize};
use std::fmt;

/// Statuses every review starts with. Reviewers may add custom labels.
pub const DEFAULT_STATUSES: [&str; 6] = [
    "None",
    "Accepted",
    "Rejected",
    "Cancelled",
    "In Progress",
    "Completed",
];

/// Status label of a thread root.
///
/// The set of labels is open-ended: anything a reviewer types becomes a
/// status. `"None"` is the unset value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(String);

impl Status {
    pub const NONE_LABEL: &'static str = "None";

    #[must_use]
    pub fn none() -> Self {
        Self(Self::NONE_LABEL.to_string())
    }

    /// Build a status from free text; blank input is the unset status.
    #[must_use]
    pub fn new(label: impl AsRef<str>) -> Self {
        let trimmed = label.as_ref().trim();
        if trimmed.is_empty() {
            Self::none()
        } else {
            Self(trimmed.to_string())
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.0 == Self::NONE_LABEL
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Growable list of known status labels, seeded with [`DEFAULT_STATUSES`].
///
/// Insertion order is preserved so pickers list the defaults first and
/// custom labels in the order they were first seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCatalog {
    labels: Vec<Status>,
}

impl Default for StatusCatalog {
    fn default() -> Self {
        Self {
            labels: DEFAULT_STATUSES.iter().map(Status::new).collect(),
        }
    }
}

impl StatusCatalog {
    /// Record a label; returns `true` if it was new.
    pub fn observe(&mut self, status: &Status) -> bool {
        if self.labels.contains(status) {
            return false;
        }
        self.labels.push(status.clone());
        true
    }

    #[must_use]
    pub fn contains(&self, status: &Status) -> bool {
        self.labels.contains(status)
    }

    #[must_use]
    pub fn labels(&self) -> &[Status] {
        &self.labels
    }
}
