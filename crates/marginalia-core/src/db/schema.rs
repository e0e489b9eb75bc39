//! SQLite schema for a marginalia data directory.
//!
//! Every table is namespaced by `review_id` so one data directory can hold
//! several review sessions:
//! - `pending_mutations` is the durable outbox, FIFO by `seq`
//! - `annotations` mirrors every annotation known to this client
//! - `filter_state` persists the reviewer's filter criteria
//! - `review_meta` records whether the server has closed the review
//! - `store_meta` tracks the schema version for diagnostics
//! - `read_markers` (v2) remembers local reads the server has not confirmed

/// Migration v1: outbox, mirror, filter state and review metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS pending_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    review_id TEXT NOT NULL,
    action TEXT NOT NULL CHECK (action IN (
        'add-comment',
        'delete-comment',
        'update-comment-status',
        'update-comment-message',
        'user-mark-comment'
    )),
    target_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    online_only INTEGER NOT NULL DEFAULT 0 CHECK (online_only IN (0, 1)),
    enqueued_at_us INTEGER NOT NULL,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS annotations (
    review_id TEXT NOT NULL,
    annotation_id TEXT NOT NULL CHECK (length(trim(annotation_id)) > 0),
    arrival_seq INTEGER NOT NULL,
    page_id INTEGER NOT NULL DEFAULT 0 CHECK (page_id >= 0),
    reply_to_id TEXT,
    author TEXT,
    msg TEXT NOT NULL DEFAULT '',
    kind TEXT,
    rects_json TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'None',
    secs_utc REAL,
    owner INTEGER NOT NULL DEFAULT 0 CHECK (owner IN (0, 1)),
    unsynced INTEGER NOT NULL DEFAULT 0 CHECK (unsynced IN (0, 1)),
    unread INTEGER NOT NULL DEFAULT 0 CHECK (unread IN (0, 1)),
    deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
    PRIMARY KEY (review_id, annotation_id),
    CHECK (reply_to_id IS NULL OR status = 'None')
);

CREATE TABLE IF NOT EXISTS filter_state (
    review_id TEXT PRIMARY KEY,
    criteria_json TEXT NOT NULL,
    updated_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS review_meta (
    review_id TEXT PRIMARY KEY,
    closed INTEGER NOT NULL DEFAULT 0 CHECK (closed IN (0, 1)),
    last_fetch_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);

INSERT OR IGNORE INTO store_meta (id, schema_version) VALUES (1, 0);

CREATE INDEX IF NOT EXISTS idx_pending_review_attempts
    ON pending_mutations(review_id, attempts);

CREATE INDEX IF NOT EXISTS idx_pending_review_target
    ON pending_mutations(review_id, target_id, action);

CREATE INDEX IF NOT EXISTS idx_annotations_review_page
    ON annotations(review_id, page_id);

CREATE INDEX IF NOT EXISTS idx_annotations_review_arrival
    ON annotations(review_id, arrival_seq);
";

/// Migration v2: read markers.
///
/// A marker is written when the reviewer reads a record and removed once the
/// server reports the record as read, so a fetch never brings back an unread
/// badge the reviewer already cleared.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS read_markers (
    review_id TEXT NOT NULL,
    annotation_id TEXT NOT NULL,
    marked_at_us INTEGER NOT NULL,
    PRIMARY KEY (review_id, annotation_id)
);
";

/// Indexes every migrated database must carry.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_pending_review_attempts",
    "idx_pending_review_target",
    "idx_annotations_review_page",
    "idx_annotations_review_arrival",
];
