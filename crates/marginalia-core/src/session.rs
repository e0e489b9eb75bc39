//! Review session engine.
//!
//! One [`ReviewSession`] owns everything for a review: the store connection,
//! the delivery coordinator, the reconciler and the transport. Local actions
//! write the mirror and enqueue the matching mutation in one transaction,
//! then rebuild the threaded view and the filter projection. Delivery runs on
//! the same task, either as a one-shot [`ReviewSession::drain`] or inside the
//! [`ReviewSession::run`] event loop.
//!
//! Only one request is ever on the wire: a fetch waits for the in-flight
//! mutation to settle and no mutation starts while a fetch is out. A listing
//! therefore always reflects every mutation acknowledged before it was
//! requested.

use std::{
    collections::{BTreeSet, HashSet},
    path::Path,
    time::Duration,
};

use rusqlite::Connection;
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::EffectiveConfig,
    coordinator::{Coordinator, DEFAULT_BACKOFF, Settlement, SyncIndicator},
    db,
    error::{Result, SyncError},
    export::{ExportedComment, export_threads},
    filter::{self, FilterCriteria, Projection},
    lock::SessionLock,
    mirror::{MergeReport, Mirror},
    model::{
        Action, Annotation, AnnotationKind, Mutation, NewMutation, Rect, Status, StatusCatalog,
        annotation::generate_id,
    },
    outbox::{DEFAULT_MAX_ATTEMPTS, Outbox},
    thread::{
        DEFAULT_ORPHAN_RETRY_LIMIT, Destination, Pass, Reconciler, ThreadView, can_set_status,
        destination, index_by_id, root_of,
    },
    transport::{ApiFuture, ApiRequest, ApiResponse, ReviewState, Transport},
};

/// How long to wait for another process to release the session lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Lock file name inside a data directory.
pub const LOCK_FILE_NAME: &str = "session.lock";

/// Fetch interval used when the configuration does not override it.
pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables for one review session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub review_id: String,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub fetch_interval: Duration,
    pub orphan_retry_limit: u32,
}

impl SessionSettings {
    #[must_use]
    pub fn new(review_id: impl Into<String>) -> Self {
        Self {
            review_id: review_id.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            fetch_interval: DEFAULT_FETCH_INTERVAL,
            orphan_retry_limit: DEFAULT_ORPHAN_RETRY_LIMIT,
        }
    }

    #[must_use]
    pub fn from_config(config: &EffectiveConfig, review_id: impl Into<String>) -> Self {
        Self {
            review_id: review_id.into(),
            max_attempts: config.project.delivery.max_attempts,
            backoff: config.backoff(),
            fetch_interval: config.fetch_interval(),
            orphan_retry_limit: config.project.threading.orphan_retry_limit,
        }
    }
}

/// Receives view updates from the engine.
///
/// Every method has a no-op default so headless callers only implement what
/// they display.
pub trait ViewSink {
    fn on_mirror_changed(&mut self, _page: u32) {}

    fn on_filter_changed(&mut self, _visible: usize, _total: usize) {}

    fn on_sync_status(&mut self, _indicator: SyncIndicator) {}

    /// Page currently on screen.
    fn current_page_index(&self) -> u32 {
        0
    }

    /// Convert a document point on `page` to viewport coordinates.
    fn to_viewport(&self, _page: u32, point: [f64; 2]) -> [f64; 2] {
        point
    }
}

/// View that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullView;

impl ViewSink for NullView {}

/// Input for a new anchored comment.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentDraft {
    pub page_id: u32,
    pub msg: String,
    pub rects: Vec<Rect>,
    pub kind: AnnotationKind,
}

/// Result of selecting a card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    /// Thread root that now has focus.
    pub focused: String,
    pub destination: Destination,
    /// Viewport position of the destination point, when there is one.
    pub viewport: Option<[f64; 2]>,
    pub marked_read: bool,
}

/// Summary of a one-shot drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub discarded: usize,
    /// The head entry is saturated and blocks the queue.
    pub blocked: bool,
}

/// Summary of one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub ok: bool,
    pub error: Option<String>,
    pub inserted: usize,
    pub updated: usize,
    pub kept_local: usize,
    pub closed: bool,
}

/// Summary of `sync`: drain, then fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub drain: DrainReport,
    pub fetch: FetchReport,
}

/// Commands accepted by the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddComment(CommentDraft),
    Reply { parent_id: String, msg: String },
    UpdateMessage { id: String, msg: String },
    UpdateStatus { id: String, status: Status },
    Delete { id: String },
    MarkRead { id: String },
    Select { id: String },
    ClearFocus,
    SetFilter(FilterCriteria),
    ResetSaturated,
    Fetch,
    Shutdown,
}

/// Result of a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Record(Annotation),
    /// The command was valid but changed nothing.
    Unchanged,
    Selected(Selection),
    Count(usize),
    Done,
}

/// A command plus the channel its outcome is sent back on.
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub respond: oneshot::Sender<Result<Outcome>>,
}

/// Cloneable handle for talking to a running [`ReviewSession::run`] loop.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Request>,
}

impl SessionHandle {
    /// Create a handle and the receiver to pass to [`ReviewSession::run`].
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Send a command and wait for its outcome.
    ///
    /// # Errors
    ///
    /// Returns the command's own error, or [`SyncError::Stopped`] if the
    /// engine is gone.
    pub async fn call(&self, command: Command) -> Result<Outcome> {
        let (respond, outcome) = oneshot::channel();
        self.tx
            .send(Request { command, respond })
            .await
            .map_err(|_| SyncError::Stopped)?;
        outcome.await.map_err(|_| SyncError::Stopped)?
    }
}

pub struct ReviewSession<T> {
    conn: Connection,
    settings: SessionSettings,
    transport: T,
    view: Box<dyn ViewSink>,
    coordinator: Coordinator,
    reconciler: Reconciler,
    criteria: FilterCriteria,
    focused: Option<String>,
    statuses: StatusCatalog,
    threads: ThreadView,
    projection: Projection,
    last_indicator: Option<SyncIndicator>,
    dispatch: Option<ApiFuture>,
    fetch: Option<ApiFuture>,
    fetch_wanted: bool,
    lock: Option<SessionLock>,
}

impl<T: Transport> ReviewSession<T> {
    /// Lock `data_dir`, open its store and load the session.
    ///
    /// # Errors
    ///
    /// Returns an error if another process holds the lock or the store cannot
    /// be opened.
    pub fn open(data_dir: &Path, settings: SessionSettings, transport: T) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let lock = SessionLock::acquire(&data_dir.join(LOCK_FILE_NAME), LOCK_TIMEOUT)
            .map_err(SyncError::from)
            .context("lock session data directory")?;
        let conn = db::open_store(&data_dir.join(db::STORE_FILE_NAME))?;
        let mut session = Self::with_connection(conn, settings, transport)
            .context("load review session")?;
        session.lock = Some(lock);
        Ok(session)
    }

    /// Build a session over an already migrated connection.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the initial load fails.
    pub fn with_connection(
        conn: Connection,
        settings: SessionSettings,
        transport: T,
    ) -> Result<Self> {
        let criteria = filter::load_criteria(&conn, &settings.review_id)?;
        let mut session = Self {
            conn,
            coordinator: Coordinator::new(settings.backoff),
            reconciler: Reconciler::new(settings.orphan_retry_limit),
            settings,
            transport,
            view: Box::new(NullView),
            criteria,
            focused: None,
            statuses: StatusCatalog::default(),
            threads: ThreadView::default(),
            projection: Projection::default(),
            last_indicator: None,
            dispatch: None,
            fetch: None,
            fetch_wanted: false,
            lock: None,
        };
        session.refresh(&[])?;
        Ok(session)
    }

    /// Attach a view and push the current state to it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the state cannot be read.
    pub fn attach_view(&mut self, view: Box<dyn ViewSink>) -> Result<()> {
        self.view = view;
        self.last_indicator = None;
        self.refresh(&[])
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn review_id(&self) -> &str {
        &self.settings.review_id
    }

    /// Path of the held data directory lock, if the session was opened on disk.
    #[must_use]
    pub fn lock_path(&self) -> Option<&Path> {
        self.lock.as_ref().map(SessionLock::path)
    }

    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    #[must_use]
    pub const fn threads(&self) -> &ThreadView {
        &self.threads
    }

    #[must_use]
    pub const fn projection(&self) -> &Projection {
        &self.projection
    }

    #[must_use]
    pub const fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    #[must_use]
    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    #[must_use]
    pub const fn statuses(&self) -> &StatusCatalog {
        &self.statuses
    }

    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.coordinator.is_online()
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the query fails.
    pub fn get(&self, id: &str) -> Result<Option<Annotation>> {
        self.mirror().get(id)
    }

    /// Every mirror record in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the query fails.
    pub fn records(&self) -> Result<Vec<Annotation>> {
        self.mirror().get_all()
    }

    /// Pending outbox entries in delivery order.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the query fails.
    pub fn pending_mutations(&self) -> Result<Vec<Mutation>> {
        self.outbox().list()
    }

    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the query fails.
    pub fn saturated_mutations(&self) -> Result<Vec<Mutation>> {
        self.outbox().saturated()
    }

    /// Distinct authors seen in the mirror.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the query fails.
    pub fn reviewers(&self) -> Result<BTreeSet<String>> {
        Ok(filter::reviewers(&self.records()?))
    }

    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the query fails.
    pub fn review_closed(&self) -> Result<bool> {
        self.mirror().review_closed()
    }

    /// Threaded export of every non-deleted thread.
    #[must_use]
    pub fn export(&self) -> Vec<ExportedComment> {
        export_threads(&self.threads)
    }

    /// Current sync indicator.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the outbox cannot be read.
    pub fn sync_status(&self) -> Result<SyncIndicator> {
        let outbox = self.outbox();
        let pending = outbox.len()?;
        let saturated = outbox.saturated()?.len();
        let head_saturated = outbox
            .head()?
            .is_some_and(|head| head.attempts >= self.settings.max_attempts);
        Ok(SyncIndicator::compute(
            &self.coordinator,
            pending,
            saturated,
            head_saturated,
        ))
    }

    // -----------------------------------------------------------------------
    // Local actions
    // -----------------------------------------------------------------------

    /// Create an anchored comment.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ReviewClosed`] for a closed review,
    /// [`SyncError::InvalidAnnotation`] when the draft has no anchor, and
    /// [`SyncError::Storage`] if the write fails.
    pub fn add_comment(&mut self, draft: CommentDraft) -> Result<Annotation> {
        self.ensure_open()?;
        if draft.rects.iter().all(|rect| rect.tl.is_none()) {
            return Err(SyncError::invalid(
                "a comment needs at least one anchor rectangle",
            ));
        }

        let id = generate_id(
            &self.settings.review_id,
            &draft.msg,
            None,
            draft.page_id,
            &draft.rects,
        );
        let record = Annotation {
            id,
            author: None,
            msg: draft.msg,
            rects: draft.rects,
            page_id: draft.page_id,
            reply_to_id: None,
            status: Status::none(),
            kind: Some(draft.kind),
            secs_utc: None,
            owner: true,
            unsynced: true,
            unread: false,
            deleted: false,
        };
        self.write_local(record, Action::AddComment)
    }

    /// Reply to an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the parent is unknown or deleted,
    /// [`SyncError::ReviewClosed`] for a closed review, and
    /// [`SyncError::InvalidAnnotation`] for an empty message.
    pub fn reply(&mut self, parent_id: &str, msg: &str) -> Result<Annotation> {
        self.ensure_open()?;
        let parent = self.require_live(parent_id)?;
        if msg.trim().is_empty() {
            return Err(SyncError::invalid("a reply needs a message"));
        }

        let id = generate_id(
            &self.settings.review_id,
            msg,
            Some(parent.id.as_str()),
            parent.page_id,
            &[],
        );
        let record = Annotation {
            id,
            author: None,
            msg: msg.to_string(),
            rects: Vec::new(),
            page_id: parent.page_id,
            reply_to_id: Some(parent.id),
            status: Status::none(),
            kind: Some(AnnotationKind::Reply),
            secs_utc: None,
            owner: true,
            unsynced: true,
            unread: false,
            deleted: false,
        };
        self.write_local(record, Action::AddComment)
    }

    /// Replace the message of a record this reviewer owns.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`], [`SyncError::NotOwner`] or
    /// [`SyncError::ReviewClosed`] when the edit is not allowed.
    pub fn update_message(&mut self, id: &str, msg: &str) -> Result<Outcome> {
        self.ensure_open()?;
        let mut record = self.require_live(id)?;
        ensure_owner(&record)?;
        if record.msg == msg {
            return Ok(Outcome::Unchanged);
        }
        msg.clone_into(&mut record.msg);
        self.write_local(record, Action::UpdateCommentMessage)
            .map(Outcome::Record)
    }

    /// Set the status of a thread root. Allowed on closed reviews and on
    /// records owned by others. A status change on a reply does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the record is unknown or deleted.
    pub fn update_status(&mut self, id: &str, status: Status) -> Result<Outcome> {
        let mut record = self.require_live(id)?;
        if !can_set_status(&record) {
            debug!(id, "ignoring status change on a reply");
            return Ok(Outcome::Unchanged);
        }
        if record.status == status {
            return Ok(Outcome::Unchanged);
        }
        self.statuses.observe(&status);
        record.status = status;
        self.write_local(record, Action::UpdateCommentStatus)
            .map(Outcome::Record)
    }

    /// Tombstone a record this reviewer owns.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`], [`SyncError::NotOwner`] or
    /// [`SyncError::ReviewClosed`] when the delete is not allowed.
    pub fn delete(&mut self, id: &str) -> Result<Outcome> {
        self.ensure_open()?;
        let mut record = self.require(id)?;
        if record.deleted {
            return Ok(Outcome::Unchanged);
        }
        ensure_owner(&record)?;
        record.deleted = true;
        if self.focused.as_deref() == Some(id) {
            self.focused = None;
        }
        self.write_local(record, Action::DeleteComment)
            .map(Outcome::Record)
    }

    /// Clear the unread badge and send a read receipt when online. Returns
    /// `false` if the record was already read.
    ///
    /// The local read is kept across fetches until the server reports the
    /// record read. A receipt is online-only: offline reads are sent after
    /// the next reconnect instead of being queued.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] or [`SyncError::Storage`].
    pub fn mark_read(&mut self, id: &str) -> Result<bool> {
        let record = self.require(id)?;
        if !record.unread {
            return Ok(false);
        }

        let online = self.coordinator.is_online();
        let in_flight = self.coordinator.in_flight_seq();
        let tx = self.conn.transaction()?;
        Mirror::new(&tx, &self.settings.review_id).mark_read(id)?;
        if online {
            outbox_on(&tx, &self.settings, in_flight)
                .enqueue(&NewMutation::for_record(Action::MarkComment, &record))?;
        } else {
            debug!(id, "offline, read receipt deferred until reconnect");
        }
        tx.commit()?;

        self.refresh(&[record.page_id])?;
        Ok(true)
    }

    /// Select a card: focus its thread root, mark it read, and compute where
    /// the viewer should navigate.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the record is unknown.
    pub fn select(&mut self, id: &str) -> Result<Selection> {
        let records = self.records()?;
        let index = index_by_id(&records);
        let Some(record) = index.get(id).copied() else {
            return Err(SyncError::NotFound { id: id.to_string() });
        };
        let root = root_of(&index, id).unwrap_or(record);
        let target = destination(root, self.view.current_page_index());
        let viewport = match target {
            Destination::Point { page, x, y } => Some(self.view.to_viewport(page, [x, y])),
            Destination::Stay { .. } | Destination::Page { .. } => None,
        };
        let focused = root.id.clone();

        self.focused = Some(focused.clone());
        let marked_read = self.mark_read(id)?;
        if !marked_read {
            self.refresh(&[])?;
        }
        Ok(Selection {
            focused,
            destination: target,
            viewport,
            marked_read,
        })
    }

    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the state cannot be read.
    pub fn clear_focus(&mut self) -> Result<()> {
        if self.focused.take().is_some() {
            self.refresh(&[])?;
        }
        Ok(())
    }

    /// Persist new filter criteria and re-project.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the criteria cannot be saved.
    pub fn set_filter(&mut self, criteria: FilterCriteria) -> Result<&Projection> {
        filter::save_criteria(&self.conn, &self.settings.review_id, &criteria)?;
        self.criteria = criteria;
        self.refresh(&[])?;
        Ok(&self.projection)
    }

    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the criteria cannot be saved.
    pub fn clear_filter(&mut self) -> Result<&Projection> {
        self.set_filter(FilterCriteria::default())
    }

    /// Apply a connectivity change. Returns `true` on an offline to online
    /// transition.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the indicator cannot be computed.
    pub fn set_online(&mut self, online: bool) -> Result<bool> {
        let was_online = self.coordinator.is_online();
        let reconnected = self.coordinator.set_online(online);
        if was_online && !online {
            self.fetch_wanted = false;
            self.outbox().discard_online_only()?;
        }
        if reconnected {
            self.resend_read_receipts()?;
        }
        self.emit_indicator()?;
        Ok(reconnected)
    }

    /// Re-arm saturated entries so delivery resumes.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the update fails.
    pub fn reset_saturated(&mut self) -> Result<usize> {
        let reset = self.outbox().reset_saturated()?;
        self.emit_indicator()?;
        Ok(reset)
    }

    // -----------------------------------------------------------------------
    // Delivery and fetch
    // -----------------------------------------------------------------------

    /// Deliver queued mutations until the outbox is empty, an attempt fails,
    /// or the head is saturated.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if an outcome cannot be recorded.
    pub async fn drain(&mut self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            self.pump()?;
            let Some(in_flight) = self.dispatch.take() else {
                break;
            };
            let response = in_flight.await;
            match self.settle(response)? {
                Some(Settlement::Acknowledge(_)) => report.delivered += 1,
                Some(Settlement::Discard { .. }) => report.discarded += 1,
                Some(Settlement::Retry { .. }) => {
                    report.failed += 1;
                    break;
                }
                None => break,
            }
        }
        report.blocked = self.head_saturated()?;
        Ok(report)
    }

    /// Fetch the authoritative list and merge it into the mirror.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the merge cannot be written.
    pub async fn fetch_now(&mut self) -> Result<FetchReport> {
        let response = self
            .transport
            .send(ApiRequest::list_comments(&self.settings.review_id))
            .await;
        self.apply_fetch(response)
    }

    /// Drain the outbox, then fetch.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if either step cannot be recorded.
    pub async fn sync(&mut self) -> Result<SyncReport> {
        let drain = self.drain().await?;
        let fetch = self.fetch_now().await?;
        Ok(SyncReport { drain, fetch })
    }

    /// Event loop: drain, retry, fetch on a timer and on reconnect, and serve
    /// commands until a [`Command::Shutdown`] or the command channel closes.
    ///
    /// An in-flight dispatch is always awaited and recorded before returning.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] when an outcome cannot be recorded.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<Request>,
        mut connectivity: watch::Receiver<bool>,
    ) -> Result<()> {
        let initially_online = *connectivity.borrow_and_update();
        self.set_online(initially_online)?;

        let mut fetch_tick = tokio::time::interval(self.settings.fetch_interval);
        fetch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;

        info!(review = %self.settings.review_id, online = initially_online, "review session started");
        loop {
            self.launch_fetch();
            self.pump()?;
            let backoff = self.coordinator.backoff_deadline();

            tokio::select! {
                response = next_response(&mut self.dispatch) => {
                    self.settle(response)?;
                }
                response = next_response(&mut self.fetch) => {
                    self.apply_fetch(response)?;
                }
                () = sleep_until_deadline(backoff) => {
                    self.coordinator.backoff_elapsed(Instant::now());
                }
                _ = fetch_tick.tick() => {
                    self.request_fetch();
                }
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let online = *connectivity.borrow_and_update();
                    if self.set_online(online)? {
                        self.request_fetch();
                    }
                }
                request = commands.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    if !self.handle(request) {
                        break;
                    }
                }
            }
        }

        if let Some(in_flight) = self.dispatch.take() {
            debug!("waiting for in-flight dispatch before stopping");
            let response = in_flight.await;
            self.settle(response)?;
        }
        if self.fetch.take().is_some() {
            debug!("abandoning in-flight fetch");
        }
        self.fetch_wanted = false;
        info!(review = %self.settings.review_id, "review session stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn handle(&mut self, request: Request) -> bool {
        let Request { command, respond } = request;
        let keep_running = !matches!(command, Command::Shutdown);
        let outcome = match command {
            Command::AddComment(draft) => self.add_comment(draft).map(Outcome::Record),
            Command::Reply { parent_id, msg } => self.reply(&parent_id, &msg).map(Outcome::Record),
            Command::UpdateMessage { id, msg } => self.update_message(&id, &msg),
            Command::UpdateStatus { id, status } => self.update_status(&id, status),
            Command::Delete { id } => self.delete(&id),
            Command::MarkRead { id } => self
                .mark_read(&id)
                .map(|marked| if marked { Outcome::Done } else { Outcome::Unchanged }),
            Command::Select { id } => self.select(&id).map(Outcome::Selected),
            Command::ClearFocus => self.clear_focus().map(|()| Outcome::Done),
            Command::SetFilter(criteria) => self
                .set_filter(criteria)
                .map(|projection| Outcome::Count(projection.visible_roots)),
            Command::ResetSaturated => self.reset_saturated().map(Outcome::Count),
            Command::Fetch => {
                self.request_fetch();
                Ok(Outcome::Done)
            }
            Command::Shutdown => Ok(Outcome::Done),
        };
        if let Err(err) = &outcome
            && err.is_fatal()
        {
            error!(code = %err.code(), %err, "local storage failure");
        }
        if respond.send(outcome).is_err() {
            debug!("command caller went away before the outcome was ready");
        }
        keep_running
    }

    /// Start the next dispatch if the coordinator allows one and no fetch is
    /// out. Returns `true` if a request went on the wire.
    fn pump(&mut self) -> Result<bool> {
        if self.dispatch.is_some()
            || self.fetch.is_some()
            || !self.coordinator.can_dispatch(Instant::now())
        {
            return Ok(false);
        }
        let Some(head) = self.outbox().peek_oldest_eligible()? else {
            self.coordinator.settle_idle();
            self.emit_indicator()?;
            return Ok(false);
        };
        self.coordinator.begin(&head);
        self.dispatch = Some(
            self.transport
                .send(ApiRequest::for_mutation(&self.settings.review_id, &head)),
        );
        self.emit_indicator()?;
        Ok(true)
    }

    fn settle(&mut self, response: ApiResponse) -> Result<Option<Settlement>> {
        let delivered = response.is_success();
        let Some(settlement) =
            self.coordinator
                .finish(delivered, &response.describe(), Instant::now())
        else {
            return Ok(None);
        };

        let max_attempts = self.settings.max_attempts;
        let tx = self.conn.transaction()?;
        let outbox = outbox_on(&tx, &self.settings, None);
        let mirror = Mirror::new(&tx, &self.settings.review_id);
        let target = match &settlement {
            Settlement::Acknowledge(flight) => {
                outbox.acknowledge(flight.seq)?;
                if outbox.pending_for(&flight.target_id)? == 0 {
                    mirror.mark_synced(&flight.target_id)?;
                }
                info!(
                    seq = flight.seq,
                    action = %flight.action,
                    target = %flight.target_id,
                    "mutation acknowledged"
                );
                &flight.target_id
            }
            Settlement::Discard { flight, delivered } => {
                outbox.acknowledge(flight.seq)?;
                debug!(
                    seq = flight.seq,
                    action = %flight.action,
                    delivered,
                    "online-only mutation settled"
                );
                &flight.target_id
            }
            Settlement::Retry { flight, error } => {
                let attempts = outbox.mark_failed(flight.seq, error)?;
                if attempts >= max_attempts {
                    warn!(
                        seq = flight.seq,
                        action = %flight.action,
                        target = %flight.target_id,
                        attempts,
                        error = %error,
                        "mutation saturated, outbox blocked until reset"
                    );
                } else {
                    warn!(
                        seq = flight.seq,
                        action = %flight.action,
                        attempts,
                        error = %error,
                        "delivery failed, retrying after backoff"
                    );
                }
                &flight.target_id
            }
        };
        let page = mirror.get(target)?.map(|record| record.page_id);
        tx.commit()?;

        self.refresh(page.as_slice())?;
        Ok(Some(settlement))
    }

    fn request_fetch(&mut self) {
        if self.coordinator.is_online() {
            self.fetch_wanted = true;
        }
    }

    /// Send a requested fetch once nothing else is on the wire.
    fn launch_fetch(&mut self) {
        if !self.fetch_wanted || self.fetch.is_some() || self.dispatch.is_some() {
            return;
        }
        self.fetch_wanted = false;
        if !self.coordinator.is_online() {
            return;
        }
        debug!(review = %self.settings.review_id, "fetching annotations");
        self.fetch = Some(
            self.transport
                .send(ApiRequest::list_comments(&self.settings.review_id)),
        );
    }

    fn apply_fetch(&mut self, response: ApiResponse) -> Result<FetchReport> {
        if !response.is_success() {
            warn!(error = %response.describe(), "fetch failed");
            return Ok(FetchReport {
                ok: false,
                error: Some(response.describe()),
                inserted: 0,
                updated: 0,
                kept_local: 0,
                closed: self.review_closed()?,
            });
        }

        let closed = response.status == Some(ReviewState::Closed);
        let comments = response.comments.unwrap_or_default();
        let pages: BTreeSet<u32> = comments.iter().filter_map(|c| c.page_id).collect();

        let tx = self.conn.transaction()?;
        let mirror = Mirror::new(&tx, &self.settings.review_id);
        let merged: MergeReport = mirror.merge_fetched(comments)?;
        mirror.record_fetch(closed)?;
        tx.commit()?;

        info!(
            inserted = merged.inserted,
            updated = merged.updated,
            kept_local = merged.kept_local,
            closed,
            "merged fetched annotations"
        );
        let changed: Vec<u32> = if merged.changed() {
            pages.into_iter().collect()
        } else {
            Vec::new()
        };
        self.resend_read_receipts()?;
        self.rebuild(&changed, Pass::Merge)?;
        Ok(FetchReport {
            ok: true,
            error: None,
            inserted: merged.inserted,
            updated: merged.updated,
            kept_local: merged.kept_local,
            closed,
        })
    }

    fn write_local(&mut self, record: Annotation, action: Action) -> Result<Annotation> {
        let in_flight = self.coordinator.in_flight_seq();
        let tx = self.conn.transaction()?;
        let stored = Mirror::new(&tx, &self.settings.review_id).upsert_local(record)?;
        let enqueued = outbox_on(&tx, &self.settings, in_flight)
            .enqueue(&NewMutation::for_record(action, &stored))?;
        tx.commit()?;

        info!(
            seq = enqueued.seq(),
            action = %action,
            target = %stored.id,
            "local change recorded"
        );
        self.refresh(&[stored.page_id])?;
        Ok(stored)
    }

    /// Queue a receipt for every local read the server still reports
    /// unread, unless one is already queued. Returns how many were queued.
    fn resend_read_receipts(&mut self) -> Result<usize> {
        if !self.coordinator.is_online() {
            return Ok(0);
        }
        let in_flight = self.coordinator.in_flight_seq();
        let tx = self.conn.transaction()?;
        let mirror = Mirror::new(&tx, &self.settings.review_id);
        let outbox = outbox_on(&tx, &self.settings, in_flight);
        let queued: HashSet<String> = outbox
            .list()?
            .into_iter()
            .filter(|mutation| mutation.action == Action::MarkComment)
            .map(|mutation| mutation.target_id)
            .collect();

        let mut resent = 0;
        for id in mirror.read_markers()? {
            if queued.contains(&id) {
                continue;
            }
            match mirror.get(&id)? {
                Some(record) => {
                    outbox.enqueue(&NewMutation::for_record(Action::MarkComment, &record))?;
                    resent += 1;
                }
                None => {
                    mirror.clear_read_marker(&id)?;
                }
            }
        }
        tx.commit()?;

        if resent > 0 {
            debug!(resent, "re-sending unconfirmed read receipts");
        }
        Ok(resent)
    }

    fn refresh(&mut self, pages: &[u32]) -> Result<()> {
        self.rebuild(pages, Pass::Redraw)
    }

    /// Rebuild threads and projection from storage and notify the view.
    fn rebuild(&mut self, pages: &[u32], pass: Pass) -> Result<()> {
        let records = self.records()?;
        let pending = self.outbox().pending_targets()?;

        self.threads = self.reconciler.reconcile(&records, &pending, pass);
        for record in records.iter().filter(|record| record.is_root()) {
            self.statuses.observe(&record.status);
        }
        self.projection = filter::project(&records, &self.criteria, self.focused.as_deref());

        let pages: BTreeSet<u32> = pages.iter().copied().collect();
        for page in pages {
            self.view.on_mirror_changed(page);
        }
        self.view
            .on_filter_changed(self.projection.visible_roots, self.projection.total_roots);
        self.emit_indicator()
    }

    fn emit_indicator(&mut self) -> Result<()> {
        let indicator = self.sync_status()?;
        if self.last_indicator != Some(indicator) {
            self.last_indicator = Some(indicator);
            self.view.on_sync_status(indicator);
        }
        Ok(())
    }

    fn head_saturated(&self) -> Result<bool> {
        Ok(self
            .outbox()
            .head()?
            .is_some_and(|head| head.attempts >= self.settings.max_attempts))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.review_closed()? {
            return Err(SyncError::ReviewClosed {
                review: self.settings.review_id.clone(),
            });
        }
        Ok(())
    }

    fn require(&self, id: &str) -> Result<Annotation> {
        self.get(id)?
            .ok_or_else(|| SyncError::NotFound { id: id.to_string() })
    }

    fn require_live(&self, id: &str) -> Result<Annotation> {
        let record = self.require(id)?;
        if record.deleted {
            return Err(SyncError::NotFound { id: id.to_string() });
        }
        Ok(record)
    }

    fn mirror(&self) -> Mirror<'_> {
        Mirror::new(&self.conn, &self.settings.review_id)
    }

    fn outbox(&self) -> Outbox<'_> {
        outbox_on(&self.conn, &self.settings, self.coordinator.in_flight_seq())
    }
}

fn outbox_on<'c>(
    conn: &'c Connection,
    settings: &'c SessionSettings,
    in_flight: Option<i64>,
) -> Outbox<'c> {
    Outbox::new(conn, &settings.review_id)
        .with_max_attempts(settings.max_attempts)
        .with_in_flight(in_flight)
}

fn ensure_owner(record: &Annotation) -> Result<()> {
    if record.owner {
        Ok(())
    } else {
        Err(SyncError::NotOwner {
            id: record.id.clone(),
        })
    }
}

/// Resolve the slot's future, leaving the slot empty afterwards. Pends forever
/// on an empty slot. Dropping this future does not cancel the request.
async fn next_response(slot: &mut Option<ApiFuture>) -> ApiResponse {
    match slot {
        Some(in_flight) => {
            let response = in_flight.await;
            *slot = None;
            response
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
