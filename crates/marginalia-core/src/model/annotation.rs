use serde::{Deserialize, Serialize};
use std::fmt;

use super::status::Status;

/// One rectangle of a geometric anchor, in document coordinates.
///
/// The document origin is bottom-left, so a larger `y` is higher on the page.
/// Points are kept optional because stored anchors from older clients can be
/// partial; a rectangle without a top-left point is not a usable anchor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tl: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub br: Option<[f64; 2]>,
}

impl Rect {
    #[must_use]
    pub const fn new(tl: [f64; 2], br: [f64; 2]) -> Self {
        Self {
            tl: Some(tl),
            br: Some(br),
        }
    }

    /// A point anchor (sticky-note style comment).
    #[must_use]
    pub const fn point(x: f64, y: f64) -> Self {
        Self {
            tl: Some([x, y]),
            br: None,
        }
    }
}

/// Visual annotation kind as carried on the wire (`type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Highlight,
    Strike,
    Comment,
    Reply,
    #[serde(other)]
    Other,
}

impl AnnotationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Highlight => "highlight",
            Self::Strike => "strike",
            Self::Comment => "comment",
            Self::Reply => "reply",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnnotationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "highlight" => Ok(Self::Highlight),
            "strike" => Ok(Self::Strike),
            "comment" | "note" => Ok(Self::Comment),
            "reply" => Ok(Self::Reply),
            other => Err(format!(
                "unknown annotation kind '{other}': expected highlight, strike or comment"
            )),
        }
    }
}

/// A mirrored annotation (comment or reply) as known to this client.
///
/// Field names follow the server's wire format so records can be stored and
/// exported without a translation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub rects: Vec<Rect>,
    #[serde(default)]
    pub page_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AnnotationKind>,
    #[serde(rename = "secs_UTC", default, skip_serializing_if = "Option::is_none")]
    pub secs_utc: Option<f64>,
    #[serde(default)]
    pub owner: bool,
    #[serde(rename = "unsync", default)]
    pub unsynced: bool,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl Annotation {
    /// Thread roots own the status of their reply chain.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.reply_to_id.is_none()
    }

    /// Y coordinate of the first rectangle's top-left point, if the record
    /// has a usable anchor.
    #[must_use]
    pub fn anchor_y(&self) -> Option<f64> {
        self.rects
            .first()
            .and_then(|rect| rect.tl)
            .map(|[_, y]| y)
            .filter(|y| y.is_finite())
    }

    /// First anchor point, used for viewer navigation.
    #[must_use]
    pub fn anchor_point(&self) -> Option<[f64; 2]> {
        self.rects.first().and_then(|rect| rect.tl)
    }

    /// Replies never carry a status; enforce that on every write path.
    pub fn normalize(&mut self) {
        if !self.is_root() {
            self.status = Status::none();
        }
    }

    /// Absorb a local edit over the currently stored copy.
    ///
    /// The incoming record wins for every locally editable field, but
    /// authoritative fields that are already known are never erased by a
    /// local copy that predates them.
    pub fn absorb_local(&mut self, incoming: Self) {
        let author = incoming.author.or_else(|| self.author.take());
        let secs_utc = incoming.secs_utc.or(self.secs_utc);
        *self = Self {
            author,
            secs_utc,
            ..incoming
        };
        self.normalize();
    }

    /// Build a fresh local record from a server copy.
    #[must_use]
    pub fn from_fetched(fetched: FetchedAnnotation) -> Self {
        let mut record = Self {
            id: fetched.id,
            author: fetched.author,
            msg: fetched.msg.unwrap_or_default(),
            rects: fetched.rects.unwrap_or_default(),
            page_id: fetched.page_id.unwrap_or_default(),
            reply_to_id: fetched.reply_to_id,
            status: fetched.status.unwrap_or_default(),
            kind: fetched.kind,
            secs_utc: fetched.secs_utc,
            owner: fetched.owner.unwrap_or(false),
            unsynced: false,
            unread: fetched.unread.unwrap_or(false),
            deleted: fetched.deleted.unwrap_or(false),
        };
        record.normalize();
        record
    }

    /// Merge an authoritative server copy into this record.
    ///
    /// Authoritative fields (author, timestamp, ownership) always come from
    /// the server when present. Content fields come from the server only when
    /// there is no pending local edit; absent fields never clobber local ones.
    pub fn absorb_fetched(&mut self, fetched: FetchedAnnotation) {
        if fetched.author.is_some() {
            self.author = fetched.author;
        }
        if fetched.secs_utc.is_some() {
            self.secs_utc = fetched.secs_utc;
        }
        if let Some(owner) = fetched.owner {
            self.owner = owner;
        }

        if self.unsynced {
            self.normalize();
            return;
        }

        if let Some(msg) = fetched.msg {
            self.msg = msg;
        }
        if let Some(rects) = fetched.rects {
            self.rects = rects;
        }
        if let Some(page_id) = fetched.page_id {
            self.page_id = page_id;
        }
        if fetched.reply_to_id.is_some() {
            self.reply_to_id = fetched.reply_to_id;
        }
        if let Some(status) = fetched.status {
            self.status = status;
        }
        if fetched.kind.is_some() {
            self.kind = fetched.kind;
        }
        if let Some(deleted) = fetched.deleted {
            self.deleted = deleted;
        }
        // The server omits `unread` once this reviewer has read the record.
        self.unread = fetched.unread.unwrap_or(false);
        self.normalize();
    }

    /// Subset of fields uploaded with `add-comment`.
    #[must_use]
    pub fn upload_value(&self) -> serde_json::Value {
        let mut upload = serde_json::json!({
            "id": self.id,
            "msg": self.msg,
            "pageId": self.page_id,
            "rects": self.rects,
        });
        if let Some(map) = upload.as_object_mut() {
            if let Some(kind) = self.kind {
                map.insert("type".to_string(), serde_json::Value::from(kind.as_str()));
            }
            if let Some(parent) = &self.reply_to_id {
                map.insert("replyToId".to_string(), serde_json::Value::from(parent.clone()));
            }
        }
        upload
    }
}

/// Generate a client-side annotation id.
///
/// The id is a blake3 digest of the content, the review, and a random seed,
/// so retried uploads of the same record carry the same id and the server can
/// ignore duplicates.
#[must_use]
pub fn generate_id(
    review_id: &str,
    msg: &str,
    reply_to_id: Option<&str>,
    page_id: u32,
    rects: &[Rect],
) -> String {
    let seed: u64 = rand::random();
    let mut hasher = blake3::Hasher::new();
    hasher.update(review_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(msg.as_bytes());
    hasher.update(&[0]);
    hasher.update(reply_to_id.unwrap_or_default().as_bytes());
    hasher.update(&page_id.to_le_bytes());
    for rect in rects {
        for point in [rect.tl, rect.br].into_iter().flatten() {
            hasher.update(&point[0].to_le_bytes());
            hasher.update(&point[1].to_le_bytes());
        }
    }
    hasher.update(&seed.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

/// A server copy of an annotation as returned by `list-comments`.
///
/// Every field except the id is optional: the server omits fields it does not
/// know, and an omitted field must never clobber local state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedAnnotation {
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub rects: Option<Vec<Rect>>,
    #[serde(default)]
    pub page_id: Option<u32>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(rename = "type", default)]
    pub kind: Option<AnnotationKind>,
    #[serde(rename = "secs_UTC", default)]
    pub secs_utc: Option<f64>,
    #[serde(default)]
    pub owner: Option<bool>,
    #[serde(default)]
    pub unread: Option<bool>,
    #[serde(default)]
    pub deleted: Option<bool>,
}
