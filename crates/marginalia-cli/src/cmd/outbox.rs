//! `mg outbox` — inspect and re-arm pending mutations.

use anyhow::Result;
use clap::{Args, Subcommand};
use marginalia_core::coordinator::SyncIndicator;
use marginalia_core::model::Mutation;
use serde::Serialize;
use std::io::Write;

use super::Context;
use crate::output::{pretty_kv, pretty_section, render, render_mode, short_id};

#[derive(Args, Debug)]
pub struct OutboxArgs {
    #[command(subcommand)]
    pub command: OutboxCommand,
}

#[derive(Subcommand, Debug)]
pub enum OutboxCommand {
    /// List pending mutations in delivery order.
    List,
    /// Re-arm mutations that hit the attempt cap.
    Reset,
}

#[derive(Debug, Serialize)]
struct OutboxReport {
    sync: SyncIndicator,
    max_attempts: u32,
    pending: Vec<Mutation>,
}

/// Run a `mg outbox` subcommand.
///
/// # Errors
///
/// Returns an error if the session cannot be opened or the outbox cannot be
/// read or updated.
pub fn run_outbox(args: &OutboxArgs, ctx: &Context) -> Result<()> {
    let mut session = ctx.open_session()?;
    match args.command {
        OutboxCommand::List => {
            let report = OutboxReport {
                sync: session.sync_status()?,
                max_attempts: session.settings().max_attempts,
                pending: session.pending_mutations()?,
            };
            render_mode(ctx.output, &report, render_text, render_pretty)
        }
        OutboxCommand::Reset => {
            let reset = session.reset_saturated()?;
            render(
                ctx.output,
                &serde_json::json!({ "reset": reset }),
                |_, w| writeln!(w, "re-armed {reset} mutation(s)"),
            )
        }
    }
}

fn render_text(report: &OutboxReport, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(w, "seq  action  target  attempts  last_error")?;
    for mutation in &report.pending {
        writeln!(
            w,
            "{}  {}  {}  {}  {}",
            mutation.seq,
            mutation.action,
            mutation.target_id,
            mutation.attempts,
            mutation.last_error.as_deref().unwrap_or("-")
        )?;
    }
    Ok(())
}

fn render_pretty(report: &OutboxReport, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Outbox")?;
    pretty_kv(w, "state", format!("{:?}", report.sync.state))?;
    pretty_kv(w, "pending", report.pending.len().to_string())?;
    pretty_kv(w, "saturated", report.sync.saturated.to_string())?;
    for mutation in &report.pending {
        let marker = if mutation.attempts >= report.max_attempts {
            "!"
        } else {
            " "
        };
        writeln!(
            w,
            "{marker} #{:<5} {:<24} {}  attempts {}/{}",
            mutation.seq,
            mutation.action.as_str(),
            short_id(&mutation.target_id),
            mutation.attempts,
            report.max_attempts
        )?;
        if let Some(error) = &mutation.last_error {
            writeln!(w, "         {error}")?;
        }
    }
    Ok(())
}
