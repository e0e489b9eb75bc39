//! `mg comment` — local annotation edits, queued for delivery.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use marginalia_core::model::{Annotation, AnnotationKind, Rect, Status};
use marginalia_core::session::{CommentDraft, Outcome};
use serde::Serialize;
use std::io::Write;

use super::Context;
use crate::output::{pretty_kv, pretty_section, render_mode, short_id};

#[derive(Args, Debug)]
pub struct CommentArgs {
    #[command(subcommand)]
    pub command: CommentCommand,
}

#[derive(Subcommand, Debug)]
pub enum CommentCommand {
    /// Add an anchored comment.
    Add(AddArgs),
    /// Reply to a comment or reply.
    Reply {
        /// Id of the record being answered.
        parent: String,
        /// Reply text.
        message: String,
    },
    /// Replace the message of one of your comments.
    Edit {
        id: String,
        message: String,
    },
    /// Delete one of your comments.
    Delete { id: String },
    /// Set the status of a thread.
    Status {
        id: String,
        /// Status label, e.g. Accepted or "In Progress". Empty clears it.
        status: String,
    },
    /// Mark a comment as read.
    Read { id: String },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Zero-based page index.
    #[arg(long)]
    pub page: u32,

    /// Anchor rectangle as `x1,y1,x2,y2` (repeatable), or `x,y` for a point.
    #[arg(long = "rect", value_parser = parse_rect, required = true)]
    pub rects: Vec<Rect>,

    /// Annotation kind.
    #[arg(long, default_value = "comment")]
    pub kind: AnnotationKind,

    /// Comment text.
    pub message: String,
}

/// Parse `x,y` or `x1,y1,x2,y2` into a rectangle.
///
/// # Errors
///
/// Returns a message if the value is not two or four finite numbers.
pub fn parse_rect(raw: &str) -> Result<Rect, String> {
    let numbers = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| format!("'{part}' is not a number"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    match numbers.as_slice() {
        [x, y] => Ok(Rect::point(*x, *y)),
        [x1, y1, x2, y2] => Ok(Rect::new([*x1, *y1], [*x2, *y2])),
        _ => Err(format!("expected x,y or x1,y1,x2,y2, got '{raw}'")),
    }
}

#[derive(Debug, Serialize)]
struct CommentResult {
    changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<Annotation>,
    pending: usize,
}

/// Run a `mg comment` subcommand.
///
/// # Errors
///
/// Returns an error if the session cannot be opened or the edit is rejected.
pub fn run_comment(args: CommentArgs, ctx: &Context) -> Result<()> {
    let mut session = ctx.open_session()?;

    let outcome = match args.command {
        CommentCommand::Add(add) => {
            if add.message.trim().is_empty() {
                bail!("comment text must not be empty");
            }
            Outcome::Record(session.add_comment(CommentDraft {
                page_id: add.page,
                msg: add.message,
                rects: add.rects,
                kind: add.kind,
            })?)
        }
        CommentCommand::Reply { parent, message } => {
            Outcome::Record(session.reply(&parent, &message)?)
        }
        CommentCommand::Edit { id, message } => session.update_message(&id, &message)?,
        CommentCommand::Delete { id } => session.delete(&id)?,
        CommentCommand::Status { id, status } => session.update_status(&id, Status::new(status))?,
        CommentCommand::Read { id } => {
            if session.mark_read(&id)? {
                Outcome::Done
            } else {
                Outcome::Unchanged
            }
        }
    };

    let result = CommentResult {
        changed: !matches!(outcome, Outcome::Unchanged),
        record: match outcome {
            Outcome::Record(record) => Some(record),
            _ => None,
        },
        pending: session.pending_mutations()?.len(),
    };

    render_mode(
        ctx.output,
        &result,
        |result, w| render_text(result, w),
        |result, w| render_pretty(result, w),
    )
}

fn render_text(result: &CommentResult, w: &mut dyn Write) -> std::io::Result<()> {
    match (&result.record, result.changed) {
        (Some(record), _) => writeln!(w, "{}  pending={}", record.id, result.pending),
        (None, true) => writeln!(w, "ok  pending={}", result.pending),
        (None, false) => writeln!(w, "unchanged  pending={}", result.pending),
    }
}

fn render_pretty(result: &CommentResult, w: &mut dyn Write) -> std::io::Result<()> {
    let Some(record) = &result.record else {
        let verdict = if result.changed {
            "✓ done"
        } else {
            "nothing to change"
        };
        writeln!(w, "{verdict} ({} pending)", result.pending)?;
        return Ok(());
    };
    pretty_section(w, &format!("Comment {}", short_id(&record.id)))?;
    pretty_kv(w, "page", record.page_id.to_string())?;
    if let Some(parent) = &record.reply_to_id {
        pretty_kv(w, "reply to", short_id(parent))?;
    } else {
        pretty_kv(w, "status", record.status.as_str())?;
    }
    if record.deleted {
        pretty_kv(w, "deleted", "yes")?;
    }
    pretty_kv(w, "message", &record.msg)?;
    pretty_kv(w, "pending", result.pending.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_point_and_box_anchors() {
        assert_eq!(parse_rect("10, 700").expect("point"), Rect::point(10.0, 700.0));
        assert_eq!(
            parse_rect("10,700,200,680").expect("box"),
            Rect::new([10.0, 700.0], [200.0, 680.0])
        );
    }

    #[test]
    fn rejects_malformed_anchors() {
        assert!(parse_rect("10").is_err());
        assert!(parse_rect("10,abc").is_err());
        assert!(parse_rect("1,2,3").is_err());
        assert!(parse_rect("inf,2").is_err());
    }
}
