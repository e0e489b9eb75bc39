use marginalia_core::db;
use marginalia_core::error::SyncError;
use marginalia_core::filter::FilterCriteria;
use marginalia_core::model::{Action, AnnotationKind, FetchedAnnotation, Rect, Status};
use marginalia_core::session::{
    Command, CommentDraft, Outcome, ReviewSession, SessionHandle, SessionSettings, ViewSink,
};
use marginalia_core::thread::Destination;
use marginalia_core::transport::{
    ApiFuture, ApiRequest, ApiResponse, LIST_COMMENTS, ReviewState, Transport,
};
use marginalia_core::{SyncIndicator, SyncState};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Scripted review server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    calls: Vec<ApiRequest>,
    /// Responses for mutation calls, consumed in order. Empty means success.
    scripted: VecDeque<ApiResponse>,
    listing: ApiResponse,
    delay: Duration,
    /// Overrides `delay` for listings.
    listing_delay: Option<Duration>,
    active: usize,
    max_active: usize,
    /// Requests of either kind awaiting a response.
    on_wire: usize,
    max_on_wire: usize,
}

#[derive(Clone, Default)]
struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    fn with_delay(delay: Duration) -> Self {
        let server = Self::default();
        server.state.lock().expect("mock lock").delay = delay;
        server
    }

    fn with_delays(mutation: Duration, listing: Duration) -> Self {
        let server = Self::with_delay(mutation);
        server.state.lock().expect("mock lock").listing_delay = Some(listing);
        server
    }

    fn script(&self, response: ApiResponse) {
        self.state
            .lock()
            .expect("mock lock")
            .scripted
            .push_back(response);
    }

    fn set_listing(&self, comments: Vec<FetchedAnnotation>, status: ReviewState) {
        self.state.lock().expect("mock lock").listing = ApiResponse {
            comments: Some(comments),
            status: Some(status),
            ..ApiResponse::success()
        };
    }

    fn mutation_calls(&self) -> Vec<ApiRequest> {
        self.state
            .lock()
            .expect("mock lock")
            .calls
            .iter()
            .filter(|call| call.api != LIST_COMMENTS)
            .cloned()
            .collect()
    }

    fn fetch_count(&self) -> usize {
        self.state
            .lock()
            .expect("mock lock")
            .calls
            .iter()
            .filter(|call| call.api == LIST_COMMENTS)
            .count()
    }

    fn max_concurrent_mutations(&self) -> usize {
        self.state.lock().expect("mock lock").max_active
    }

    fn max_on_wire(&self) -> usize {
        self.state.lock().expect("mock lock").max_on_wire
    }
}

impl Transport for MockServer {
    fn send(&self, request: ApiRequest) -> ApiFuture {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let is_mutation = request.api != LIST_COMMENTS;
            let (delay, response) = {
                let mut guard = state.lock().expect("mock lock");
                guard.on_wire += 1;
                guard.max_on_wire = guard.max_on_wire.max(guard.on_wire);
                let response = if is_mutation {
                    guard.active += 1;
                    guard.max_active = guard.max_active.max(guard.active);
                    guard.scripted.pop_front().unwrap_or_default()
                } else {
                    guard.listing.clone()
                };
                guard.calls.push(request);
                let delay = if is_mutation {
                    guard.delay
                } else {
                    guard.listing_delay.unwrap_or(guard.delay)
                };
                (delay, response)
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut guard = state.lock().expect("mock lock");
            guard.on_wire -= 1;
            if is_mutation {
                guard.active -= 1;
            }
            response
        })
    }
}

fn session(server: &MockServer) -> ReviewSession<MockServer> {
    let conn = db::open_in_memory().expect("open in-memory store");
    ReviewSession::with_connection(conn, SessionSettings::new("rv-1"), server.clone())
        .expect("load session")
}

fn draft(msg: &str) -> CommentDraft {
    CommentDraft {
        page_id: 0,
        msg: msg.to_string(),
        rects: vec![Rect::new([10.0, 700.0], [200.0, 680.0])],
        kind: AnnotationKind::Highlight,
    }
}

fn fetched(id: &str, msg: &str, page: u32) -> FetchedAnnotation {
    FetchedAnnotation {
        id: id.to_string(),
        author: Some("Grace".to_string()),
        msg: Some(msg.to_string()),
        rects: Some(vec![Rect::point(5.0, 600.0)]),
        page_id: Some(page),
        unread: Some(true),
        owner: Some(false),
        kind: Some(AnnotationKind::Comment),
        ..FetchedAnnotation::default()
    }
}

// ---------------------------------------------------------------------------
// Durability and delivery
// ---------------------------------------------------------------------------

#[test]
fn local_edit_survives_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let server = MockServer::default();

    let id = {
        let mut first = ReviewSession::open(dir.path(), SessionSettings::new("rv-1"), server.clone())
            .expect("open session");
        assert!(first.lock_path().is_some());
        first.add_comment(draft("typo in abstract")).expect("add").id
    };

    let reopened = ReviewSession::open(dir.path(), SessionSettings::new("rv-1"), server.clone())
        .expect("reopen session");
    let pending = reopened.pending_mutations().expect("list outbox");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, Action::AddComment);
    assert_eq!(pending[0].target_id, id);

    let record = reopened.get(&id).expect("get").expect("record kept");
    assert!(record.unsynced);
    assert_eq!(record.msg, "typo in abstract");
    assert!(server.mutation_calls().is_empty());
}

#[tokio::test]
async fn drain_delivers_in_enqueue_order_and_clears_outbox() {
    let server = MockServer::default();
    let mut session = session(&server);

    let record = session.add_comment(draft("check figure 2")).expect("add");
    session
        .update_status(&record.id, Status::new("Accepted"))
        .expect("status");

    let report = session.drain().await.expect("drain");
    assert_eq!(report.delivered, 2);
    assert!(!report.blocked);

    let calls = server.mutation_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].api, "add-comment");
    assert_eq!(calls[0].fields["comment"]["id"], json!(record.id));
    assert_eq!(calls[1].api, "update-comment-status");
    assert_eq!(calls[1].fields["status"], json!("Accepted"));

    assert!(session.pending_mutations().expect("list").is_empty());
    let stored = session.get(&record.id).expect("get").expect("record");
    assert!(!stored.unsynced);
    assert_eq!(session.sync_status().expect("status").state, SyncState::Synced);
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_backs_off_and_is_never_redelivered_after_ack() {
    let server = MockServer::default();
    server.script(ApiResponse::transport_failure("connection refused"));
    let mut session = session(&server);
    session.add_comment(draft("retry me")).expect("add");

    let first = session.drain().await.expect("drain");
    assert_eq!(first.failed, 1);
    let pending = session.pending_mutations().expect("list");
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.as_deref().is_some_and(|e| e.contains("-1")));
    assert_eq!(session.sync_status().expect("status").state, SyncState::Retrying);

    let during_backoff = session.drain().await.expect("drain");
    assert_eq!(during_backoff.delivered + during_backoff.failed, 0);
    assert_eq!(server.mutation_calls().len(), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    let second = session.drain().await.expect("drain");
    assert_eq!(second.delivered, 1);

    let again = session.drain().await.expect("drain");
    assert_eq!(again.delivered, 0);
    let calls = server.mutation_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].fields, calls[1].fields, "retry resends the same id");
}

#[tokio::test]
async fn saturated_head_blocks_until_reset() {
    let server = MockServer::default();
    let conn = db::open_in_memory().expect("open store");
    let mut settings = SessionSettings::new("rv-1");
    settings.max_attempts = 1;
    settings.backoff = Duration::ZERO;
    let mut session =
        ReviewSession::with_connection(conn, settings, server.clone()).expect("session");

    server.script(ApiResponse::failure(7, "unexpected"));
    session.add_comment(draft("first")).expect("add");
    session.add_comment(draft("second")).expect("add");

    let report = session.drain().await.expect("drain");
    assert_eq!(report.failed, 1);
    assert!(report.blocked);
    assert_eq!(session.sync_status().expect("status").state, SyncState::Degraded);

    let blocked = session.drain().await.expect("drain");
    assert!(blocked.blocked);
    assert_eq!(server.mutation_calls().len(), 1, "nothing passes a saturated head");

    assert_eq!(session.reset_saturated().expect("reset"), 1);
    let resumed = session.drain().await.expect("drain");
    assert_eq!(resumed.delivered, 2);
    assert!(session.pending_mutations().expect("list").is_empty());
}

#[tokio::test]
async fn offline_double_edit_sends_one_message_update() {
    let server = MockServer::default();
    let mut session = session(&server);
    let record = session.add_comment(draft("first draft")).expect("add");
    session.drain().await.expect("drain create");

    session.set_online(false).expect("offline");
    session.update_message(&record.id, "second draft").expect("edit");
    session.update_message(&record.id, "final draft").expect("edit");
    assert_eq!(session.pending_mutations().expect("list").len(), 1);

    let offline = session.drain().await.expect("drain");
    assert_eq!(offline.delivered, 0);

    assert!(session.set_online(true).expect("online"));
    session.drain().await.expect("drain");

    let edits: Vec<_> = server
        .mutation_calls()
        .into_iter()
        .filter(|call| call.api == "update-comment-message")
        .collect();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].fields["message"], json!("final draft"));
    assert_eq!(edits[0].fields["commentid"], json!(record.id));
}

#[tokio::test]
async fn read_receipts_are_discarded_on_failure() {
    let server = MockServer::default();
    server.set_listing(vec![fetched("srv-1", "Please cite", 2)], ReviewState::Open);
    let mut session = session(&server);

    let fetch = session.fetch_now().await.expect("fetch");
    assert!(fetch.ok);
    assert_eq!(fetch.inserted, 1);

    assert!(session.mark_read("srv-1").expect("mark read"));
    assert!(!session.mark_read("srv-1").expect("already read"));
    assert_eq!(session.pending_mutations().expect("list").len(), 1);

    server.script(ApiResponse::transport_failure("timeout"));
    let report = session.drain().await.expect("drain");
    assert_eq!(report.discarded, 1);
    assert_eq!(report.failed, 0);
    assert!(session.pending_mutations().expect("list").is_empty());

    let record = session.get("srv-1").expect("get").expect("record");
    assert!(!record.unread);

    // The server never saw the read, so the next fetch keeps the badge
    // cleared and sends the receipt again.
    session.fetch_now().await.expect("fetch");
    assert!(!session.get("srv-1").expect("get").expect("record").unread);
    let pending = session.pending_mutations().expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, Action::MarkComment);
}

#[tokio::test]
async fn offline_read_is_sent_after_reconnect() {
    let server = MockServer::default();
    server.set_listing(vec![fetched("srv-1", "Please cite", 2)], ReviewState::Open);
    let mut session = session(&server);
    session.fetch_now().await.expect("fetch");

    session.set_online(false).expect("offline");
    assert!(session.mark_read("srv-1").expect("mark read"));
    assert!(session.pending_mutations().expect("list").is_empty());

    assert!(session.set_online(true).expect("online"));
    let pending = session.pending_mutations().expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, Action::MarkComment);
    assert_eq!(pending[0].target_id, "srv-1");

    let report = session.sync().await.expect("sync");
    assert_eq!(report.drain.delivered, 1);
    assert!(report.fetch.ok);
    assert!(
        !session.get("srv-1").expect("get").expect("record").unread,
        "a listing taken before the receipt landed must not restore the badge"
    );
    let receipts: Vec<_> = server
        .mutation_calls()
        .into_iter()
        .filter(|call| call.api == "user-mark-comment")
        .collect();
    assert_eq!(receipts.len(), 1);

    // Once the server reports the record read, later activity may mark it
    // unread again.
    let mut read = fetched("srv-1", "Please cite", 2);
    read.unread = None;
    server.set_listing(vec![read], ReviewState::Open);
    session.fetch_now().await.expect("fetch");
    server.set_listing(vec![fetched("srv-1", "Please cite (edited)", 2)], ReviewState::Open);
    session.fetch_now().await.expect("fetch");
    assert!(session.get("srv-1").expect("get").expect("record").unread);
}

#[tokio::test]
async fn going_offline_drops_queued_receipts() {
    let server = MockServer::default();
    server.set_listing(vec![fetched("srv-1", "Please cite", 2)], ReviewState::Open);
    let mut session = session(&server);
    session.fetch_now().await.expect("fetch");

    session.add_comment(draft("keep me")).expect("add");
    assert!(session.mark_read("srv-1").expect("mark read"));
    assert_eq!(session.pending_mutations().expect("list").len(), 2);

    session.set_online(false).expect("offline");
    let pending = session.pending_mutations().expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, Action::AddComment);
    assert!(!session.get("srv-1").expect("get").expect("record").unread);

    let offline = session.drain().await.expect("drain");
    assert_eq!(offline.delivered, 0);
    assert!(server.mutation_calls().is_empty());

    session.set_online(true).expect("online");
    let report = session.drain().await.expect("drain");
    assert_eq!(report.delivered, 2);
    let apis: Vec<String> = server
        .mutation_calls()
        .into_iter()
        .map(|call| call.api)
        .collect();
    assert_eq!(apis, ["add-comment", "user-mark-comment"]);
}

// ---------------------------------------------------------------------------
// Threading, filtering and permissions
// ---------------------------------------------------------------------------

#[test]
fn status_change_on_reply_is_a_no_op() {
    let server = MockServer::default();
    let mut session = session(&server);
    let root = session.add_comment(draft("root")).expect("add");
    let reply = session.reply(&root.id, "agreed").expect("reply");
    assert_eq!(reply.page_id, root.page_id);

    let outcome = session
        .update_status(&reply.id, Status::new("Accepted"))
        .expect("status");
    assert_eq!(outcome, Outcome::Unchanged);
    assert_eq!(session.pending_mutations().expect("list").len(), 2);

    let stored_root = session.get(&root.id).expect("get").expect("root");
    assert!(stored_root.status.is_none());
    let thread = session.threads().find(&root.id).expect("thread");
    assert_eq!(thread.replies.len(), 1);
    assert_eq!(thread.replies[0].record.id, reply.id);
}

#[tokio::test]
async fn tombstone_is_tracked_until_acknowledged() {
    let server = MockServer::default();
    let mut session = session(&server);
    let record = session.add_comment(draft("remove me")).expect("add");
    session.drain().await.expect("drain create");
    assert_eq!(session.projection().visible_roots, 1);

    session.delete(&record.id).expect("delete");
    let stored = session.get(&record.id).expect("get").expect("tombstone");
    assert!(stored.deleted);
    assert_eq!(session.projection().total_roots, 0);
    assert_eq!(session.projection().is_visible(&record.id), Some(false));

    session.drain().await.expect("drain delete");
    assert!(session.get(&record.id).expect("get").is_some_and(|r| r.deleted));
    assert_eq!(session.projection().is_visible(&record.id), None);
    assert!(session.export().is_empty());
}

#[test]
fn text_filter_counts_matching_roots() {
    let server = MockServer::default();
    let mut session = session(&server);
    for msg in ["Test comment 1", "Test comment 2", "Comment test 3", "Comment test 3"] {
        session.add_comment(draft(msg)).expect("add");
    }

    let projection = session
        .set_filter(FilterCriteria {
            text: "Test comment".to_string(),
            ..FilterCriteria::default()
        })
        .expect("filter");
    assert_eq!(projection.visible_roots, 2);
    assert_eq!(projection.total_roots, 4);

    assert_eq!(session.clear_filter().expect("clear").visible_roots, 4);
}

#[tokio::test]
async fn closed_review_rejects_edits_but_allows_status() {
    let server = MockServer::default();
    let mut mine = fetched("mine", "my note", 0);
    mine.owner = Some(true);
    server.set_listing(vec![mine], ReviewState::Closed);
    let mut session = session(&server);
    assert!(session.fetch_now().await.expect("fetch").closed);

    assert!(matches!(
        session.add_comment(draft("too late")),
        Err(SyncError::ReviewClosed { .. })
    ));
    assert!(matches!(
        session.update_message("mine", "edited"),
        Err(SyncError::ReviewClosed { .. })
    ));
    let outcome = session
        .update_status("mine", Status::new("Completed"))
        .expect("status");
    assert!(matches!(outcome, Outcome::Record(ref r) if r.status.as_str() == "Completed"));
}

#[tokio::test]
async fn foreign_records_cannot_be_edited_or_deleted() {
    let server = MockServer::default();
    server.set_listing(vec![fetched("theirs", "their note", 0)], ReviewState::Open);
    let mut session = session(&server);
    session.fetch_now().await.expect("fetch");

    assert!(matches!(
        session.update_message("theirs", "hijack"),
        Err(SyncError::NotOwner { .. })
    ));
    assert!(matches!(session.delete("theirs"), Err(SyncError::NotOwner { .. })));
    assert!(session.reply("theirs", "a reply is fine").is_ok());
}

#[test]
fn comment_without_anchor_is_rejected() {
    let server = MockServer::default();
    let mut session = session(&server);
    let mut unanchored = draft("floating");
    unanchored.rects.clear();
    assert!(matches!(
        session.add_comment(unanchored),
        Err(SyncError::InvalidAnnotation { .. })
    ));
    assert!(session.pending_mutations().expect("list").is_empty());
}

#[tokio::test]
async fn selecting_a_reply_focuses_its_root() {
    let server = MockServer::default();
    server.set_listing(vec![fetched("srv-1", "Please cite", 2)], ReviewState::Open);
    let mut session = session(&server);
    session.fetch_now().await.expect("fetch");
    let reply = session.reply("srv-1", "will do").expect("reply");

    let selection = session.select(&reply.id).expect("select");
    assert_eq!(selection.focused, "srv-1");
    assert_eq!(
        selection.destination,
        Destination::Point {
            page: 2,
            x: 5.0,
            y: 600.0
        }
    );
    assert_eq!(selection.viewport, Some([5.0, 600.0]));
    assert_eq!(session.focused(), Some("srv-1"));
}

#[tokio::test]
async fn clear_focus_command_drops_the_selection() {
    let server = MockServer::default();
    server.set_listing(vec![fetched("srv-1", "Please cite", 2)], ReviewState::Open);
    let mut session = session(&server);
    session.fetch_now().await.expect("fetch");
    session.select("srv-1").expect("select");
    assert_eq!(session.focused(), Some("srv-1"));

    let (handle, commands) = SessionHandle::channel(4);
    let (_online_tx, online_rx) = watch::channel(false);
    let driver = async {
        let outcome = handle.call(Command::ClearFocus).await.expect("clear focus");
        assert_eq!(outcome, Outcome::Done);
        handle.call(Command::Shutdown).await.expect("shutdown");
    };
    let (run, ()) = tokio::join!(session.run(commands, online_rx), driver);
    run.expect("run loop");
    assert_eq!(session.focused(), None);
}

// ---------------------------------------------------------------------------
// View notifications
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct RecordingView {
    pages: Arc<Mutex<Vec<u32>>>,
    counts: Arc<Mutex<Vec<(usize, usize)>>>,
    indicators: Arc<Mutex<Vec<SyncIndicator>>>,
}

impl ViewSink for RecordingView {
    fn on_mirror_changed(&mut self, page: u32) {
        self.pages.lock().expect("view lock").push(page);
    }

    fn on_filter_changed(&mut self, visible: usize, total: usize) {
        self.counts.lock().expect("view lock").push((visible, total));
    }

    fn on_sync_status(&mut self, indicator: SyncIndicator) {
        self.indicators.lock().expect("view lock").push(indicator);
    }
}

#[tokio::test]
async fn view_is_notified_of_changes() {
    let server = MockServer::default();
    let mut session = session(&server);
    let view = RecordingView::default();
    session
        .attach_view(Box::new(view.clone()))
        .expect("attach view");

    let mut on_page_three = draft("page three");
    on_page_three.page_id = 3;
    session.add_comment(on_page_three).expect("add");
    session.drain().await.expect("drain");

    assert!(view.pages.lock().expect("view lock").contains(&3));
    assert_eq!(view.counts.lock().expect("view lock").last(), Some(&(1, 1)));
    let states: Vec<SyncState> = view
        .indicators
        .lock()
        .expect("view lock")
        .iter()
        .map(|indicator| indicator.state)
        .collect();
    assert_eq!(states.first(), Some(&SyncState::Synced));
    assert!(states.contains(&SyncState::Pending));
    assert!(states.contains(&SyncState::Sending));
    assert_eq!(states.last(), Some(&SyncState::Synced));
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn run_loop_drains_on_reconnect_one_request_at_a_time() {
    let server = MockServer::default();
    server.state.lock().expect("mock lock").delay = Duration::from_millis(100);
    let mut session = session(&server);
    let (handle, commands) = SessionHandle::channel(8);
    let (online_tx, online_rx) = watch::channel(false);

    let driver = async {
        let outcome = handle
            .call(Command::AddComment(draft("queued offline")))
            .await
            .expect("add");
        let Outcome::Record(record) = outcome else {
            panic!("expected a record, got {outcome:?}");
        };
        handle
            .call(Command::UpdateStatus {
                id: record.id.clone(),
                status: Status::new("In Progress"),
            })
            .await
            .expect("status");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(server.mutation_calls().is_empty(), "offline sends nothing");
        assert_eq!(server.fetch_count(), 0);

        online_tx.send(true).expect("reconnect");
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.call(Command::Shutdown).await.expect("shutdown");
    };

    let (run, ()) = tokio::join!(session.run(commands, online_rx), driver);
    run.expect("run loop");

    let calls = server.mutation_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].api, "add-comment");
    assert_eq!(calls[1].api, "update-comment-status");
    assert_eq!(server.max_concurrent_mutations(), 1);
    assert!(server.fetch_count() >= 1, "reconnect triggers a fetch");
    assert!(session.pending_mutations().expect("list").is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_loop_retries_after_backoff() {
    let server = MockServer::with_delay(Duration::from_millis(100));
    server.script(ApiResponse::transport_failure("connection reset"));
    let mut session = session(&server);
    let (handle, commands) = SessionHandle::channel(8);
    let (_online_tx, online_rx) = watch::channel(true);

    let driver = async {
        handle
            .call(Command::AddComment(draft("flaky network")))
            .await
            .expect("add");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(server.mutation_calls().len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(server.mutation_calls().len(), 2);
        handle.call(Command::Shutdown).await.expect("shutdown");
    };

    let (run, ()) = tokio::join!(session.run(commands, online_rx), driver);
    run.expect("run loop");
    assert!(session.pending_mutations().expect("list").is_empty());
}

/// A session holding one synced record of ours, with the server listing
/// still showing it as first written.
async fn synced_with_stale_listing(server: &MockServer) -> (ReviewSession<MockServer>, String) {
    let mut session = session(server);
    let record = session.add_comment(draft("old")).expect("add");
    session.drain().await.expect("drain create");

    let mut stale = fetched(&record.id, "old", 0);
    stale.owner = Some(true);
    stale.unread = None;
    stale.deleted = Some(false);
    server.set_listing(vec![stale], ReviewState::Open);
    (session, record.id)
}

#[tokio::test(start_paused = true)]
async fn slow_listing_does_not_revert_an_acknowledged_edit() {
    let server = MockServer::with_delays(Duration::from_millis(10), Duration::from_millis(500));
    let (mut session, id) = synced_with_stale_listing(&server).await;
    let (handle, commands) = SessionHandle::channel(8);
    let (_online_tx, online_rx) = watch::channel(true);

    let driver = async {
        // Let the startup fetch finish first.
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.call(Command::Fetch).await.expect("fetch");
        handle
            .call(Command::UpdateMessage {
                id: id.clone(),
                msg: "new".to_string(),
            })
            .await
            .expect("edit");
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.call(Command::Shutdown).await.expect("shutdown");
    };

    let (run, ()) = tokio::join!(session.run(commands, online_rx), driver);
    run.expect("run loop");

    assert_eq!(server.fetch_count(), 2);
    assert_eq!(server.mutation_calls().len(), 2);
    assert_eq!(server.max_on_wire(), 1, "fetch and dispatch never overlap");
    let stored = session.get(&id).expect("get").expect("record");
    assert_eq!(stored.msg, "new");
    assert!(!stored.unsynced);
    assert!(session.pending_mutations().expect("list").is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_listing_does_not_revive_an_acknowledged_delete() {
    let server = MockServer::with_delays(Duration::from_millis(10), Duration::from_millis(500));
    let (mut session, id) = synced_with_stale_listing(&server).await;
    let (handle, commands) = SessionHandle::channel(8);
    let (_online_tx, online_rx) = watch::channel(true);

    let driver = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.call(Command::Fetch).await.expect("fetch");
        handle
            .call(Command::Delete { id: id.clone() })
            .await
            .expect("delete");
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.call(Command::Shutdown).await.expect("shutdown");
    };

    let (run, ()) = tokio::join!(session.run(commands, online_rx), driver);
    run.expect("run loop");

    assert_eq!(server.max_on_wire(), 1);
    assert!(session.get(&id).expect("get").is_some_and(|r| r.deleted));
    assert_eq!(session.projection().total_roots, 0);
    assert!(session.export().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dispatch_waits_for_the_fetch_on_the_wire() {
    let server = MockServer::with_delays(Duration::from_millis(10), Duration::from_millis(500));
    server.set_listing(vec![fetched("srv-1", "Please cite", 2)], ReviewState::Open);
    let mut session = session(&server);
    let (handle, commands) = SessionHandle::channel(8);
    let (_online_tx, online_rx) = watch::channel(true);

    let driver = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.call(Command::Fetch).await.expect("fetch");
        handle
            .call(Command::AddComment(draft("while listing")))
            .await
            .expect("add");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.mutation_calls().is_empty(), "listing still on the wire");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.mutation_calls().len(), 1);
        handle.call(Command::Fetch).await.expect("fetch");
        handle.call(Command::Shutdown).await.expect("shutdown");
    };

    let (run, ()) = tokio::join!(session.run(commands, online_rx), driver);
    run.expect("run loop");

    assert_eq!(server.max_on_wire(), 1);
    assert!(session.pending_mutations().expect("list").is_empty());
}

#[tokio::test]
async fn handle_reports_stopped_engine() {
    let (handle, commands) = SessionHandle::channel(1);
    drop(commands);
    assert!(matches!(
        handle.call(Command::Fetch).await,
        Err(SyncError::Stopped)
    ));
}
