//! `mg list` — threaded view of the local mirror, filtered.

use anyhow::Result;
use clap::Args;
use marginalia_core::coordinator::SyncIndicator;
use marginalia_core::filter::Projection;
use marginalia_core::thread::{ThreadNode, ThreadView};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;

use super::Context;
use crate::output::{pretty_rule, render_mode, short_id};

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Show cards hidden by the saved filter.
    #[arg(long)]
    pub all: bool,

    /// Only show threads anchored on this page.
    #[arg(long)]
    pub page: Option<u32>,
}

/// One card in display order.
#[derive(Debug, Serialize)]
pub struct Card {
    pub id: String,
    pub depth: usize,
    pub page: u32,
    pub author: Option<String>,
    pub status: Option<String>,
    pub msg: String,
    pub unread: bool,
    pub unsynced: bool,
    pub pending: usize,
    pub deleted: bool,
    pub visible: bool,
}

#[derive(Debug, Serialize)]
struct ListReport {
    visible_roots: usize,
    total_roots: usize,
    sync: SyncIndicator,
    awaiting_parent: usize,
    cards: Vec<Card>,
}

/// Flatten `view` into cards, dropping hidden ones unless `all` is set.
#[must_use]
pub fn cards(view: &ThreadView, projection: &Projection, all: bool, page: Option<u32>) -> Vec<Card> {
    let visible: BTreeSet<&str> = projection.visible_ids().into_iter().collect();
    let mut out = Vec::new();
    for root in view
        .roots
        .iter()
        .filter(|root| page.is_none_or(|page| root.record.page_id == page))
    {
        push_cards(root, 0, &visible, all, &mut out);
    }
    out
}

fn push_cards(
    node: &ThreadNode,
    depth: usize,
    visible: &BTreeSet<&str>,
    all: bool,
    out: &mut Vec<Card>,
) {
    let record = &node.record;
    let is_visible = visible.contains(record.id.as_str());
    if !is_visible && !all {
        return;
    }
    out.push(Card {
        id: record.id.clone(),
        depth,
        page: record.page_id,
        author: record.author.clone(),
        status: record.is_root().then(|| record.status.as_str().to_string()),
        msg: record.msg.clone(),
        unread: record.unread,
        unsynced: record.unsynced,
        pending: node.pending,
        deleted: record.deleted,
        visible: is_visible,
    });
    for reply in &node.replies {
        push_cards(reply, depth + 1, visible, all, out);
    }
}

/// Run `mg list`.
///
/// # Errors
///
/// Returns an error if the session cannot be opened or read.
pub fn run_list(args: &ListArgs, ctx: &Context) -> Result<()> {
    let session = ctx.open_session()?;
    let projection = session.projection();
    let report = ListReport {
        visible_roots: projection.visible_roots,
        total_roots: projection.total_roots,
        sync: session.sync_status()?,
        awaiting_parent: session.threads().awaiting_parent.len(),
        cards: cards(session.threads(), projection, args.all, args.page),
    };

    render_mode(ctx.output, &report, render_text, render_pretty)
}

fn render_text(report: &ListReport, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(w, "id  page  status  author  flags  msg")?;
    for card in &report.cards {
        writeln!(
            w,
            "{}{}  {}  {}  {}  {}  {}",
            "  ".repeat(card.depth),
            card.id,
            card.page,
            card.status.as_deref().unwrap_or("-"),
            card.author.as_deref().unwrap_or("-"),
            flags(card),
            card.msg.replace('\n', " ")
        )?;
    }
    Ok(())
}

fn render_pretty(report: &ListReport, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "{} of {} threads shown  [{:?}, {} pending]",
        report.visible_roots, report.total_roots, report.sync.state, report.sync.pending
    )?;
    pretty_rule(w)?;
    for card in &report.cards {
        let indent = "    ".repeat(card.depth);
        let head = if card.depth == 0 {
            format!(
                "p{} [{}]",
                card.page + 1,
                card.status.as_deref().unwrap_or("None")
            )
        } else {
            "↳".to_string()
        };
        writeln!(
            w,
            "{indent}{head} {} {} {}",
            short_id(&card.id),
            card.author.as_deref().unwrap_or("you"),
            flags(card)
        )?;
        for line in card.msg.lines() {
            writeln!(w, "{indent}    {line}")?;
        }
    }
    if report.awaiting_parent > 0 {
        writeln!(w, "({} replies waiting for their thread)", report.awaiting_parent)?;
    }
    Ok(())
}

fn flags(card: &Card) -> String {
    let mut flags = String::new();
    if card.unread {
        flags.push('*');
    }
    if card.unsynced {
        flags.push('~');
    }
    if card.deleted {
        flags.push('x');
    }
    if !card.visible {
        flags.push('h');
    }
    if flags.is_empty() {
        flags.push('-');
    }
    flags
}
