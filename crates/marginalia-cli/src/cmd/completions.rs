use anyhow::{Context as _, Result};
use clap::Args;
use clap_complete::{Shell, generate, generate_to};
use std::path::PathBuf;

/// Arguments for `mg completions`.
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell for completion script generation.
    #[arg(value_enum)]
    pub shell: Shell,

    /// Write the script into this directory instead of stdout.
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

/// Generate a shell completion script.
///
/// # Errors
///
/// Returns an error if the script cannot be written.
pub fn run_completions(args: &CompletionsArgs, command: &mut clap::Command) -> Result<()> {
    match &args.dir {
        Some(dir) => {
            let path = generate_to(args.shell, command, "mg", dir)
                .with_context(|| format!("write completions to {}", dir.display()))?;
            tracing::info!(path = %path.display(), "wrote completion script");
        }
        None => generate(args.shell, command, "mg", &mut std::io::stdout()),
    }
    Ok(())
}
