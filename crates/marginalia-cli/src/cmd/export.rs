//! `mg export` — threaded JSON export of the review.

use anyhow::{Context as _, Result};
use clap::Args;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use super::Context;

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Write to this file instead of stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

/// Run `mg export`. Always JSON, whatever the output mode.
///
/// # Errors
///
/// Returns an error if the session cannot be opened or the file cannot be
/// written.
pub fn run_export(args: &ExportArgs, ctx: &Context) -> Result<()> {
    let session = ctx.open_session()?;
    let exported = session.export();
    let json = serde_json::to_string_pretty(&exported)?;

    match &args.output {
        Some(path) => {
            fs::write(path, format!("{json}\n"))
                .with_context(|| format!("write export to {}", path.display()))?;
            tracing::info!(path = %path.display(), threads = exported.len(), "exported review");
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            writeln!(out, "{json}")?;
        }
    }
    Ok(())
}
