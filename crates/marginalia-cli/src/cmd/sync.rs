//! `mg sync` — drain the outbox, then fetch the authoritative list.

use anyhow::Result;
use clap::Args;
use marginalia_core::session::{DrainReport, FetchReport, SyncReport};
use serde::Serialize;
use std::io::Write;

use super::{Context, runtime};
use crate::output::{pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug, Default)]
pub struct SyncArgs {
    /// Only deliver pending mutations.
    #[arg(long, conflicts_with = "fetch_only")]
    pub push_only: bool,

    /// Only fetch; leave the outbox untouched.
    #[arg(long)]
    pub fetch_only: bool,
}

#[derive(Debug, Serialize)]
struct SyncSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    drain: Option<DrainReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fetch: Option<FetchReport>,
    pending: usize,
}

/// Run `mg sync`.
///
/// # Errors
///
/// Returns an error if no server is configured, the session cannot be
/// opened, or an outcome cannot be recorded locally. Delivery failures are
/// reported, not returned.
pub fn run_sync(args: &SyncArgs, ctx: &Context) -> Result<()> {
    ctx.server_url()?;
    let mut session = ctx.open_session()?;

    let summary = runtime()?.block_on(async {
        let (drain, fetch) = if args.push_only {
            (Some(session.drain().await?), None)
        } else if args.fetch_only {
            (None, Some(session.fetch_now().await?))
        } else {
            let SyncReport { drain, fetch } = session.sync().await?;
            (Some(drain), Some(fetch))
        };
        anyhow::Ok(SyncSummary {
            drain,
            fetch,
            pending: session.pending_mutations()?.len(),
        })
    })?;

    render_mode(
        ctx.output,
        &summary,
        |summary, w| {
            if let Some(drain) = &summary.drain {
                writeln!(
                    w,
                    "delivered={} failed={} discarded={} blocked={}",
                    drain.delivered, drain.failed, drain.discarded, drain.blocked
                )?;
            }
            if let Some(fetch) = &summary.fetch {
                writeln!(
                    w,
                    "fetched ok={} inserted={} updated={} kept_local={} closed={}",
                    fetch.ok, fetch.inserted, fetch.updated, fetch.kept_local, fetch.closed
                )?;
            }
            writeln!(w, "pending={}", summary.pending)
        },
        render_pretty,
    )
}

fn render_pretty(summary: &SyncSummary, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Sync")?;
    if let Some(drain) = &summary.drain {
        pretty_kv(w, "delivered", drain.delivered.to_string())?;
        if drain.failed > 0 {
            pretty_kv(w, "failed", format!("{} (will retry)", drain.failed))?;
        }
        if drain.blocked {
            pretty_kv(w, "blocked", "head mutation saturated, run `mg outbox reset`")?;
        }
    }
    if let Some(fetch) = &summary.fetch {
        match &fetch.error {
            Some(error) => pretty_kv(w, "fetch", format!("failed: {error}"))?,
            None => pretty_kv(
                w,
                "fetch",
                format!(
                    "{} new, {} updated, {} kept local",
                    fetch.inserted, fetch.updated, fetch.kept_local
                ),
            )?,
        }
        if fetch.closed {
            pretty_kv(w, "review", "closed")?;
        }
    }
    pretty_kv(w, "pending", summary.pending.to_string())
}
