//! `mg select` — focus a thread and report where the viewer should go.

use anyhow::Result;
use clap::Args;
use marginalia_core::thread::Destination;

use super::{Context, PageView};
use crate::output::{pretty_kv, render_mode, short_id};

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Id of the card to select.
    pub id: String,

    /// Page currently on screen (zero-based).
    #[arg(long, default_value_t = 0)]
    pub page: u32,
}

/// Run `mg select`.
///
/// # Errors
///
/// Returns an error if the session cannot be opened or the id is unknown.
pub fn run_select(args: &SelectArgs, ctx: &Context) -> Result<()> {
    let mut session = ctx.open_session_with_view(Box::new(PageView { page: args.page }))?;
    let selection = session.select(&args.id)?;

    render_mode(
        ctx.output,
        &selection,
        |selection, w| {
            writeln!(
                w,
                "{}  {}",
                selection.focused,
                describe(&selection.destination)
            )
        },
        |selection, w| {
            pretty_kv(w, "focused", short_id(&selection.focused))?;
            pretty_kv(w, "navigate", describe(&selection.destination))?;
            if selection.marked_read {
                pretty_kv(w, "read", "marked")?;
            }
            Ok(())
        },
    )
}

fn describe(destination: &Destination) -> String {
    match destination {
        Destination::Stay { page } => format!("stay on page {}", page + 1),
        Destination::Point { page, x, y } => format!("page {} at ({x:.1}, {y:.1})", page + 1),
        Destination::Page { page } => format!("top of page {}", page + 1),
    }
}
