//! Display ordering and reply threading over the mirror.
//!
//! Roots are ordered by page, then anchored records top-down (the document
//! origin is bottom-left, so a larger Y comes first), then arrival order.
//! Replies nest under their parent in arrival order.
//!
//! A reply can arrive before its parent (fetch pages, or a reply created on
//! another client while this one holds a stale mirror). Such orphans are kept
//! out of the view and retried on every merge of fetched data; after
//! `orphan_retry_limit` merges they are dropped with a single warning, and
//! re-admitted as soon as the parent shows up. Local redraws do not count.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::model::Annotation;

/// Orphan retry budget used when the configuration does not override it.
pub const DEFAULT_ORPHAN_RETRY_LIMIT: u32 = 50;

/// One card in the threaded view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadNode {
    pub record: Annotation,
    /// Pending outbox entries targeting this record.
    pub pending: usize,
    pub replies: Vec<ThreadNode>,
}

impl ThreadNode {
    /// Depth-first walk over this node and all nested replies.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Self)) {
        visit(self);
        for reply in &self.replies {
            reply.walk(visit);
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThreadView {
    pub roots: Vec<ThreadNode>,
    /// Replies waiting for their parent to arrive.
    pub awaiting_parent: Vec<String>,
    /// Replies that exhausted their retry budget.
    pub dropped: Vec<String>,
}

impl ThreadView {
    /// Every placed node, depth first in display order.
    #[must_use]
    pub fn nodes(&self) -> Vec<&ThreadNode> {
        let mut out = Vec::new();
        for root in &self.roots {
            root.walk(&mut |node| out.push(node));
        }
        out
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<&ThreadNode> {
        self.nodes().into_iter().find(|node| node.record.id == id)
    }
}

/// What triggered a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Fetched records were merged; each orphan uses up one retry.
    Merge,
    /// Local change or redraw; retry counts stay as they are.
    Redraw,
}

/// Builds [`ThreadView`]s and remembers orphan retry counts between merges.
#[derive(Debug, Clone)]
pub struct Reconciler {
    orphan_retry_limit: u32,
    orphan_passes: HashMap<String, u32>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_ORPHAN_RETRY_LIMIT)
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(orphan_retry_limit: u32) -> Self {
        Self {
            orphan_retry_limit,
            orphan_passes: HashMap::new(),
        }
    }

    /// Thread `records` (given in arrival order) into display order.
    pub fn reconcile(
        &mut self,
        records: &[Annotation],
        pending: &HashMap<String, usize>,
        pass: Pass,
    ) -> ThreadView {
        let ids: HashSet<&str> = records.iter().map(|record| record.id.as_str()).collect();

        let mut children: HashMap<&str, Vec<&Annotation>> = HashMap::new();
        let mut roots: Vec<(usize, &Annotation)> = Vec::new();
        for (arrival, record) in records.iter().enumerate() {
            match record.reply_to_id.as_deref() {
                None => roots.push((arrival, record)),
                Some(parent) => children.entry(parent).or_default().push(record),
            }
        }
        roots.sort_by(|(a_arrival, a), (b_arrival, b)| display_order(a, *a_arrival, b, *b_arrival));

        let mut placed = HashSet::new();
        let nodes = roots
            .into_iter()
            .map(|(_, root)| build_node(root, &children, pending, &mut placed))
            .collect();

        let mut view = ThreadView {
            roots: nodes,
            ..ThreadView::default()
        };

        let mut still_orphaned = HashSet::new();
        for record in records {
            if placed.contains(record.id.as_str()) {
                continue;
            }
            let Some(parent) = record.reply_to_id.as_deref() else {
                continue;
            };
            still_orphaned.insert(record.id.clone());
            let passes = self.orphan_passes.entry(record.id.clone()).or_insert(0);
            if pass == Pass::Merge {
                *passes = passes.saturating_add(1);
            }

            if *passes > self.orphan_retry_limit {
                if *passes == self.orphan_retry_limit.saturating_add(1) {
                    warn!(
                        reply = %record.id,
                        parent,
                        parent_known = ids.contains(parent),
                        "dropping reply whose parent never arrived"
                    );
                }
                view.dropped.push(record.id.clone());
            } else {
                debug!(reply = %record.id, parent, passes = *passes, "reply awaiting parent");
                view.awaiting_parent.push(record.id.clone());
            }
        }

        self.orphan_passes.retain(|id, _| still_orphaned.contains(id));
        view
    }
}

fn build_node<'a>(
    record: &'a Annotation,
    children: &HashMap<&str, Vec<&'a Annotation>>,
    pending: &HashMap<String, usize>,
    placed: &mut HashSet<&'a str>,
) -> ThreadNode {
    placed.insert(record.id.as_str());
    let mut replies = Vec::new();
    for &child in children.get(record.id.as_str()).into_iter().flatten() {
        if placed.contains(child.id.as_str()) {
            continue;
        }
        replies.push(build_node(child, children, pending, placed));
    }
    ThreadNode {
        record: record.clone(),
        pending: pending.get(&record.id).copied().unwrap_or(0),
        replies,
    }
}

fn display_order(a: &Annotation, a_arrival: usize, b: &Annotation, b_arrival: usize) -> Ordering {
    a.page_id
        .cmp(&b.page_id)
        .then_with(|| match (a.anchor_y(), b.anchor_y()) {
            (Some(ay), Some(by)) => by.total_cmp(&ay),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a_arrival.cmp(&b_arrival))
}

/// Index of records by id, for parent-chain walks.
#[must_use]
pub fn index_by_id(records: &[Annotation]) -> HashMap<&str, &Annotation> {
    records
        .iter()
        .map(|record| (record.id.as_str(), record))
        .collect()
}

/// Walk the parent chain of `id` to its thread root.
///
/// Returns `None` if `id` is unknown, an ancestor is missing, or the chain
/// loops back on itself.
#[must_use]
pub fn root_of<'a>(index: &HashMap<&str, &'a Annotation>, id: &str) -> Option<&'a Annotation> {
    let mut current = *index.get(id)?;
    let mut seen = HashSet::from([current.id.as_str()]);
    while let Some(parent) = current.reply_to_id.as_deref() {
        if !seen.insert(parent) {
            return None;
        }
        current = *index.get(parent)?;
    }
    Some(current)
}

/// Ancestors of `id`, nearest first. Stops at a missing parent or a loop.
#[must_use]
pub fn ancestors<'a>(index: &HashMap<&str, &'a Annotation>, id: &str) -> Vec<&'a Annotation> {
    let mut chain = Vec::new();
    let Some(mut current) = index.get(id).copied() else {
        return chain;
    };
    let mut seen = HashSet::from([current.id.as_str()]);
    while let Some(parent) = current.reply_to_id.as_deref() {
        if !seen.insert(parent) {
            break;
        }
        let Some(next) = index.get(parent).copied() else {
            break;
        };
        chain.push(next);
        current = next;
    }
    chain
}

/// Whether a status change applies to this record. Replies never carry one.
#[must_use]
pub const fn can_set_status(record: &Annotation) -> bool {
    record.is_root()
}

/// Where the viewer should go when a card is activated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// The record is on the current page; only select it.
    Stay { page: u32 },
    /// Jump to the anchor's top-left point on another page.
    Point { page: u32, x: f64, y: f64 },
    /// Jump to the top of another page.
    Page { page: u32 },
}

/// Compute the navigation target for a record given the page on screen.
#[must_use]
pub fn destination(record: &Annotation, current_page: u32) -> Destination {
    let page = record.page_id;
    if page == current_page {
        return Destination::Stay { page };
    }
    match record.anchor_point() {
        Some([x, y]) if x.is_finite() && y.is_finite() => Destination::Point { page, x, y },
        _ => Destination::Page { page },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Rect, Status};

    fn record(id: &str, page: u32, y: Option<f64>, parent: Option<&str>) -> Annotation {
        Annotation {
            id: id.to_string(),
            author: Some("Ada".to_string()),
            msg: id.to_string(),
            rects: y.map(|y| vec![Rect::point(10.0, y)]).unwrap_or_default(),
            page_id: page,
            reply_to_id: parent.map(str::to_string),
            status: Status::none(),
            kind: None,
            secs_utc: None,
            owner: false,
            unsynced: false,
            unread: false,
            deleted: false,
        }
    }

    fn root_ids(view: &ThreadView) -> Vec<&str> {
        view.roots.iter().map(|node| node.record.id.as_str()).collect()
    }

    #[test]
    fn roots_sort_by_page_then_descending_y_then_arrival() {
        let records = vec![
            record("p1-low", 1, Some(100.0), None),
            record("p0-unanchored", 0, None, None),
            record("p0-low", 0, Some(200.0), None),
            record("p0-high", 0, Some(700.0), None),
            record("p0-tie", 0, Some(200.0), None),
            record("p0-unanchored-2", 0, None, None),
        ];
        let view = Reconciler::default().reconcile(&records, &HashMap::new(), Pass::Merge);
        assert_eq!(
            root_ids(&view),
            [
                "p0-high",
                "p0-low",
                "p0-tie",
                "p0-unanchored",
                "p0-unanchored-2",
                "p1-low"
            ]
        );
    }

    #[test]
    fn replies_nest_in_arrival_order_with_pending_counts() {
        let records = vec![
            record("c1", 0, Some(500.0), None),
            record("r2", 0, None, Some("c1")),
            record("r1", 0, Some(900.0), Some("c1")),
            record("r3", 0, None, Some("r2")),
        ];
        let pending = HashMap::from([("r1".to_string(), 2)]);
        let view = Reconciler::default().reconcile(&records, &pending, Pass::Merge);

        let root = &view.roots[0];
        let reply_ids: Vec<_> = root.replies.iter().map(|n| n.record.id.as_str()).collect();
        assert_eq!(reply_ids, ["r2", "r1"]);
        assert_eq!(root.replies[0].replies[0].record.id, "r3");
        assert_eq!(view.find("r1").map(|n| n.pending), Some(2));
        assert_eq!(view.nodes().len(), 4);
    }

    #[test]
    fn orphan_is_retried_then_dropped_once_then_readmitted() {
        let mut reconciler = Reconciler::new(2);
        let orphan_only = vec![record("r1", 0, None, Some("late"))];

        let first = reconciler.reconcile(&orphan_only, &HashMap::new(), Pass::Merge);
        assert_eq!(first.awaiting_parent, ["r1"]);
        let second = reconciler.reconcile(&orphan_only, &HashMap::new(), Pass::Merge);
        assert_eq!(second.awaiting_parent, ["r1"]);
        let third = reconciler.reconcile(&orphan_only, &HashMap::new(), Pass::Merge);
        assert!(third.awaiting_parent.is_empty());
        assert_eq!(third.dropped, ["r1"]);

        let with_parent = vec![
            record("r1", 0, None, Some("late")),
            record("late", 0, Some(10.0), None),
        ];
        let healed = reconciler.reconcile(&with_parent, &HashMap::new(), Pass::Merge);
        assert!(healed.dropped.is_empty());
        assert_eq!(healed.roots[0].replies[0].record.id, "r1");
    }

    #[test]
    fn redraws_do_not_use_up_orphan_retries() {
        let mut reconciler = Reconciler::new(1);
        let orphan_only = vec![record("r1", 0, None, Some("late"))];

        for _ in 0..10 {
            let view = reconciler.reconcile(&orphan_only, &HashMap::new(), Pass::Redraw);
            assert_eq!(view.awaiting_parent, ["r1"]);
        }
        let merged = reconciler.reconcile(&orphan_only, &HashMap::new(), Pass::Merge);
        assert_eq!(merged.awaiting_parent, ["r1"]);
        let dropped = reconciler.reconcile(&orphan_only, &HashMap::new(), Pass::Merge);
        assert_eq!(dropped.dropped, ["r1"]);
        let redrawn = reconciler.reconcile(&orphan_only, &HashMap::new(), Pass::Redraw);
        assert_eq!(redrawn.dropped, ["r1"], "a dropped orphan stays dropped on redraw");
    }

    #[test]
    fn cycles_are_not_placed_and_root_of_is_safe() {
        let records = vec![
            record("a", 0, None, Some("b")),
            record("b", 0, None, Some("a")),
            record("c", 0, None, None),
            record("d", 0, None, Some("c")),
        ];
        let view = Reconciler::default().reconcile(&records, &HashMap::new(), Pass::Merge);
        assert_eq!(root_ids(&view), ["c"]);
        assert_eq!(view.awaiting_parent.len(), 2);

        let index = index_by_id(&records);
        assert!(root_of(&index, "a").is_none());
        assert_eq!(root_of(&index, "d").map(|r| r.id.as_str()), Some("c"));
        assert_eq!(root_of(&index, "c").map(|r| r.id.as_str()), Some("c"));
        assert!(root_of(&index, "missing").is_none());
        assert_eq!(ancestors(&index, "a").len(), 1);
    }

    #[test]
    fn destination_prefers_anchor_on_other_pages() {
        let anchored = record("c1", 3, Some(640.0), None);
        assert_eq!(destination(&anchored, 3), Destination::Stay { page: 3 });
        assert_eq!(
            destination(&anchored, 0),
            Destination::Point {
                page: 3,
                x: 10.0,
                y: 640.0
            }
        );

        let loose = record("r1", 3, None, Some("c1"));
        assert_eq!(destination(&loose, 0), Destination::Page { page: 3 });
        assert!(!can_set_status(&loose));
        assert!(can_set_status(&anchored));
    }
}
