use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

use super::annotation::Annotation;

/// Form fields sent with a mutation, minus `api` and `review`.
pub type Payload = Map<String, Value>;

/// Server action a mutation performs. The string form is the API name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    AddComment,
    DeleteComment,
    UpdateCommentStatus,
    UpdateCommentMessage,
    /// Read receipt. Online-only: attempted once, dropped when going offline.
    #[serde(rename = "user-mark-comment")]
    MarkComment,
}

impl Action {
    pub const ALL: [Self; 5] = [
        Self::AddComment,
        Self::DeleteComment,
        Self::UpdateCommentStatus,
        Self::UpdateCommentMessage,
        Self::MarkComment,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AddComment => "add-comment",
            Self::DeleteComment => "delete-comment",
            Self::UpdateCommentStatus => "update-comment-status",
            Self::UpdateCommentMessage => "update-comment-message",
            Self::MarkComment => "user-mark-comment",
        }
    }

    /// Later edits of the same kind replace a queued, undelivered one.
    #[must_use]
    pub const fn is_coalescable(self) -> bool {
        matches!(self, Self::UpdateCommentStatus | Self::UpdateCommentMessage)
    }

    #[must_use]
    pub const fn is_online_only(self) -> bool {
        matches!(self, Self::MarkComment)
    }

    /// Build the form payload for this action from the current record.
    #[must_use]
    pub fn payload_for(self, record: &Annotation) -> Payload {
        let mut payload = Payload::new();
        match self {
            Self::AddComment => {
                payload.insert("comment".to_string(), record.upload_value());
            }
            Self::DeleteComment => {
                payload.insert("commentid".to_string(), Value::from(record.id.clone()));
            }
            Self::UpdateCommentStatus => {
                payload.insert("commentid".to_string(), Value::from(record.id.clone()));
                payload.insert(
                    "status".to_string(),
                    Value::from(record.status.as_str().to_string()),
                );
            }
            Self::UpdateCommentMessage => {
                payload.insert("commentid".to_string(), Value::from(record.id.clone()));
                payload.insert("message".to_string(), Value::from(record.msg.clone()));
            }
            Self::MarkComment => {
                payload.insert("id".to_string(), Value::from(record.id.clone()));
                payload.insert("as".to_string(), Value::from("read"));
            }
        }
        payload
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s.trim())
            .ok_or_else(|| format!("unknown mutation action '{s}'"))
    }
}

/// A mutation waiting to be built into the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub action: Action,
    pub target_id: String,
    pub payload: Payload,
    pub online_only: bool,
}

impl NewMutation {
    #[must_use]
    pub fn for_record(action: Action, record: &Annotation) -> Self {
        Self {
            action,
            target_id: record.id.clone(),
            payload: action.payload_for(record),
            online_only: action.is_online_only(),
        }
    }
}

/// A persisted outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mutation {
    /// Local sequence id; strictly increasing, never reused.
    pub seq: i64,
    pub action: Action,
    pub target_id: String,
    pub payload: Payload,
    pub attempts: u32,
    pub online_only: bool,
    pub enqueued_at_us: i64,
    pub last_error: Option<String>,
}
