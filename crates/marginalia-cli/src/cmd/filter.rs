//! `mg filter` — saved filter criteria for the review.

use anyhow::Result;
use clap::{Args, Subcommand};
use marginalia_core::filter::FilterCriteria;
use marginalia_core::model::Status;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;

use super::Context;
use crate::output::{pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct FilterArgs {
    #[command(subcommand)]
    pub command: FilterCommand,
}

#[derive(Subcommand, Debug)]
pub enum FilterCommand {
    /// Replace the saved filter.
    Set(SetArgs),
    /// Remove every filter criterion.
    Clear,
    /// Show the saved filter, known statuses and reviewers.
    Show,
}

#[derive(Args, Debug, Default)]
pub struct SetArgs {
    /// Regular expression matched against messages.
    #[arg(long, default_value = "")]
    pub text: String,

    /// Match `--text` case-sensitively.
    #[arg(long)]
    pub case_sensitive: bool,

    /// Only show threads with unread cards.
    #[arg(long)]
    pub unread: bool,

    /// Hide threads with this status (repeatable).
    #[arg(long = "hide-status")]
    pub hide_status: Vec<String>,

    /// Hide threads started by this reviewer (repeatable).
    #[arg(long = "hide-author")]
    pub hide_author: Vec<String>,
}

impl SetArgs {
    #[must_use]
    pub fn criteria(&self) -> FilterCriteria {
        FilterCriteria {
            text: self.text.clone(),
            case_sensitive: self.case_sensitive,
            unread_only: self.unread,
            excluded_statuses: self.hide_status.iter().map(Status::new).collect(),
            excluded_authors: self
                .hide_author
                .iter()
                .map(|author| author.trim().to_string())
                .filter(|author| !author.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct FilterReport {
    criteria: FilterCriteria,
    active: bool,
    visible_roots: usize,
    total_roots: usize,
    statuses: Vec<String>,
    reviewers: BTreeSet<String>,
}

/// Run a `mg filter` subcommand.
///
/// # Errors
///
/// Returns an error if the session cannot be opened or the filter cannot be
/// saved.
pub fn run_filter(args: &FilterArgs, ctx: &Context) -> Result<()> {
    let mut session = ctx.open_session()?;
    match &args.command {
        FilterCommand::Set(set) => {
            session.set_filter(set.criteria())?;
        }
        FilterCommand::Clear => {
            session.clear_filter()?;
        }
        FilterCommand::Show => {}
    }

    let criteria = session.criteria().clone();
    let report = FilterReport {
        active: criteria.is_active(),
        criteria,
        visible_roots: session.projection().visible_roots,
        total_roots: session.projection().total_roots,
        statuses: session
            .statuses()
            .labels()
            .iter()
            .map(|status| status.as_str().to_string())
            .collect(),
        reviewers: session.reviewers()?,
    };

    render_mode(
        ctx.output,
        &report,
        |report, w| {
            writeln!(
                w,
                "active={}  visible={}/{}  text={:?}",
                report.active, report.visible_roots, report.total_roots, report.criteria.text
            )
        },
        render_pretty,
    )
}

fn render_pretty(report: &FilterReport, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Filter")?;
    let criteria = &report.criteria;
    pretty_kv(
        w,
        "text",
        if criteria.text.is_empty() {
            "(any)".to_string()
        } else {
            format!(
                "/{}/{}",
                criteria.text,
                if criteria.case_sensitive { "" } else { "i" }
            )
        },
    )?;
    pretty_kv(w, "unread", if criteria.unread_only { "only" } else { "any" })?;
    pretty_kv(w, "hidden", join(criteria.excluded_statuses.iter().map(Status::as_str)))?;
    pretty_kv(w, "muted", join(criteria.excluded_authors.iter().map(String::as_str)))?;
    pretty_kv(
        w,
        "showing",
        format!("{} of {} threads", report.visible_roots, report.total_roots),
    )?;
    pretty_kv(w, "statuses", join(report.statuses.iter().map(String::as_str)))?;
    pretty_kv(w, "reviewers", join(report.reviewers.iter().map(String::as_str)))
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let joined = items.collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined
    }
}
