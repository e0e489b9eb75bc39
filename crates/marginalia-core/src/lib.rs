//! marginalia-core library.
//!
//! Offline-durable synchronization of review annotations: every local edit is
//! written to a SQLite mirror and a durable outbox in one transaction, then
//! delivered to the review server one request at a time.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod export;
pub mod filter;
pub mod lock;
pub mod mirror;
pub mod model;
pub mod outbox;
pub mod session;
pub mod thread;
pub mod transport;

pub use coordinator::{SyncIndicator, SyncState};
pub use error::{ErrorCode, Result, SyncError};
pub use filter::{FilterCriteria, Projection};
pub use model::{Action, Annotation, AnnotationKind, Mutation, Rect, Status};
pub use session::{
    Command, CommentDraft, Outcome, ReviewSession, SessionHandle, SessionSettings, ViewSink,
};
pub use thread::{Destination, ThreadView};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
