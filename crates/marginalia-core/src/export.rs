//! Threaded JSON export of a review.

use serde::Serialize;

use crate::{
    model::{AnnotationKind, Rect},
    thread::{ThreadNode, ThreadView},
};

/// One exported comment with its nested replies.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedComment {
    pub id: String,
    pub author: String,
    pub msg: String,
    pub status: String,
    #[serde(rename = "secs_UTC")]
    pub secs_utc: Option<f64>,
    pub read: bool,
    pub owner: bool,
    pub page_id: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub rects: Vec<Rect>,
    pub replies: Vec<ExportedComment>,
}

/// Export every non-deleted root in display order. Deleted replies are left
/// out together with anything nested under them.
#[must_use]
pub fn export_threads(view: &ThreadView) -> Vec<ExportedComment> {
    view.roots
        .iter()
        .filter(|node| !node.record.deleted)
        .map(export_node)
        .collect()
}

fn export_node(node: &ThreadNode) -> ExportedComment {
    let record = &node.record;
    ExportedComment {
        id: record.id.clone(),
        author: record
            .author
            .clone()
            .unwrap_or_else(|| "Anonymous".to_string()),
        msg: record.msg.clone(),
        status: record.status.as_str().to_string(),
        secs_utc: record.secs_utc,
        read: !record.unread,
        owner: record.owner,
        page_id: record.page_id,
        kind: record
            .kind
            .unwrap_or(AnnotationKind::Reply)
            .as_str()
            .to_string(),
        rects: record.rects.clone(),
        replies: node
            .replies
            .iter()
            .filter(|reply| !reply.record.deleted)
            .map(export_node)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{Annotation, Status},
        thread::{Pass, Reconciler},
    };
    use std::collections::HashMap;

    fn record(id: &str, parent: Option<&str>, deleted: bool) -> Annotation {
        Annotation {
            id: id.to_string(),
            author: None,
            msg: format!("msg {id}"),
            rects: if parent.is_none() {
                vec![Rect::point(1.0, 2.0)]
            } else {
                Vec::new()
            },
            page_id: 1,
            reply_to_id: parent.map(str::to_string),
            status: Status::none(),
            kind: parent.is_none().then_some(AnnotationKind::Highlight),
            secs_utc: Some(10.0),
            owner: true,
            unsynced: false,
            unread: id == "r1",
            deleted,
        }
    }

    #[test]
    fn export_nests_replies_and_skips_deleted() {
        let records = vec![
            record("c1", None, false),
            record("r1", Some("c1"), false),
            record("r2", Some("c1"), true),
            record("r3", Some("r2"), false),
            record("gone", None, true),
        ];
        let view = Reconciler::default().reconcile(&records, &HashMap::new(), Pass::Merge);
        let exported = export_threads(&view);

        assert_eq!(exported.len(), 1);
        let root = &exported[0];
        assert_eq!(root.author, "Anonymous");
        assert_eq!(root.kind, "highlight");
        assert_eq!(root.replies.len(), 1);
        assert_eq!(root.replies[0].kind, "reply");
        assert!(!root.replies[0].read);

        let json = serde_json::to_value(&exported).expect("serialize");
        assert_eq!(json[0]["pageId"], 1);
        assert_eq!(json[0]["secs_UTC"], 10.0);
        assert_eq!(json[0]["replies"][0]["id"], "r1");
    }
}
