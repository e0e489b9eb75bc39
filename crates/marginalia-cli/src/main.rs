#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{CommandFactory, Parser, Subcommand};
use marginalia_core::config::resolve_config;
use output::{CliError, OutputMode, render_error};
use std::env;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "marginalia: offline-durable review comments",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Review id (overrides MARGINALIA_REVIEW and the project config).
    #[arg(long, global = true)]
    review: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Annotations",
        about = "Add, reply to, edit or delete comments",
        long_about = "Record a local annotation edit and queue it for delivery.",
        after_help = "EXAMPLES:\n    # Comment on a highlighted line of page 3\n    mg comment add --page 2 --rect 72,700,300,688 \"typo: recieve\"\n\n    # Reply to a thread\n    mg comment reply 3f9a0c \"fixed in v2\"\n\n    # Set a thread's status\n    mg comment status 3f9a0c Accepted"
    )]
    Comment(cmd::comment::CommentArgs),

    #[command(
        next_help_heading = "Annotations",
        about = "Select a card and navigate to it",
        long_about = "Focus the card's thread, mark it read, and print where the viewer should go.",
        after_help = "EXAMPLES:\n    # Select a reply while page 1 is on screen\n    mg select 3f9a0c --page 0"
    )]
    Select(cmd::select::SelectArgs),

    #[command(
        next_help_heading = "Read",
        about = "List threads from the local mirror",
        long_about = "List threads in display order, applying the saved filter.",
        after_help = "EXAMPLES:\n    # List visible threads\n    mg list\n\n    # Include filtered-out cards\n    mg list --all\n\n    # Emit machine-readable output\n    mg list --json"
    )]
    List(cmd::list::ListArgs),

    #[command(
        next_help_heading = "Read",
        about = "Set, clear or show the saved filter",
        after_help = "EXAMPLES:\n    # Only unread threads mentioning a figure\n    mg filter set --text 'fig(ure)?' --unread\n\n    # Hide resolved threads\n    mg filter set --hide-status Accepted --hide-status Completed\n\n    # Reset\n    mg filter clear"
    )]
    Filter(cmd::filter::FilterArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Inspect or re-arm the outbox",
        after_help = "EXAMPLES:\n    # Show pending mutations\n    mg outbox list\n\n    # Retry mutations that hit the attempt cap\n    mg outbox reset"
    )]
    Outbox(cmd::outbox::OutboxArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Deliver pending edits and fetch the review",
        long_about = "Drain the outbox one mutation at a time, then fetch and merge the authoritative list.",
        after_help = "EXAMPLES:\n    # Full sync\n    mg sync\n\n    # Only push local edits\n    mg sync --push-only"
    )]
    Sync(cmd::sync::SyncArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Keep the review in sync until interrupted",
        long_about = "Run the session engine: deliver on reconnect, retry after backoff, refetch periodically.",
        after_help = "EXAMPLES:\n    # Watch with the default probe interval\n    mg watch\n\n    # Stream indicator changes as JSON lines\n    mg watch --json"
    )]
    Watch(cmd::watch::WatchArgs),

    #[command(
        next_help_heading = "Interoperability",
        about = "Export threads as JSON",
        after_help = "EXAMPLES:\n    # Export to a file\n    mg export -o review.json"
    )]
    Export(cmd::export::ExportArgs),

    #[command(
        next_help_heading = "Project Maintenance",
        about = "Generate shell completion scripts",
        after_help = "EXAMPLES:\n    # Generate bash completions\n    mg completions bash\n\n    # Install zsh completions\n    mg completions zsh --dir ~/.zfunc"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("MARGINALIA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| {
            EnvFilter::new(if verbose {
                "marginalia_core=debug,marginalia_cli=debug,info"
            } else {
                "marginalia_core=info,warn"
            })
        });

    let format = env::var("MARGINALIA_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(cli: Cli, output: OutputMode, ctx: &cmd::Context) -> anyhow::Result<()> {
    match cli.command {
        Commands::Comment(args) => cmd::comment::run_comment(args, ctx),
        Commands::Select(ref args) => cmd::select::run_select(args, ctx),
        Commands::List(ref args) => cmd::list::run_list(args, ctx),
        Commands::Filter(ref args) => cmd::filter::run_filter(args, ctx),
        Commands::Outbox(ref args) => cmd::outbox::run_outbox(args, ctx),
        Commands::Sync(ref args) => cmd::sync::run_sync(args, ctx),
        Commands::Watch(ref args) => cmd::watch::run_watch(args, ctx),
        Commands::Export(ref args) => cmd::export::run_export(args, ctx),
        Commands::Completions(ref args) => {
            debug!(?output, "generating completions");
            let mut command = Cli::command();
            cmd::completions::run_completions(args, &mut command)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let project_root = env::current_dir()?;
    let config = resolve_config(&project_root, cli.json, cli.review.as_deref())?;
    let output = OutputMode::from_resolved(&config.resolved_output);
    let ctx = cmd::Context { config, output };

    if let Err(err) = run(cli, output, &ctx) {
        render_error(output, &CliError::from(&err))?;
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_parses_before_and_after_subcommand() {
        let before = Cli::parse_from(["mg", "--json", "list"]);
        assert!(before.json);
        let after = Cli::parse_from(["mg", "list", "--json"]);
        assert!(after.json);
    }

    #[test]
    fn review_flag_is_global() {
        let cli = Cli::parse_from(["mg", "outbox", "list", "--review", "thesis"]);
        assert_eq!(cli.review.as_deref(), Some("thesis"));
        assert!(matches!(cli.command, Commands::Outbox(_)));
    }

    #[test]
    fn comment_add_requires_an_anchor() {
        assert!(Cli::try_parse_from(["mg", "comment", "add", "--page", "0", "text"]).is_err());
        let cli = Cli::parse_from([
            "mg", "comment", "add", "--page", "1", "--rect", "1,2,3,4", "--rect", "5,6", "text",
        ]);
        let Commands::Comment(args) = cli.command else {
            panic!("expected comment");
        };
        let cmd::comment::CommentCommand::Add(add) = args.command else {
            panic!("expected add");
        };
        assert_eq!(add.rects.len(), 2);
        assert_eq!(add.page, 1);
    }

    #[test]
    fn sync_flags_conflict() {
        assert!(Cli::try_parse_from(["mg", "sync", "--push-only", "--fetch-only"]).is_err());
    }

    #[test]
    fn completions_subcommand_parses() {
        let cli = Cli::parse_from(["mg", "completions", "bash"]);
        assert!(matches!(
            cli.command,
            Commands::Completions(cmd::completions::CompletionsArgs {
                shell: clap_complete::Shell::Bash,
                dir: None,
            })
        ));
    }

    #[test]
    fn all_subcommands_listed() {
        let subcommands = [
            vec!["mg", "comment", "add", "--page", "0", "--rect", "1,2", "x"],
            vec!["mg", "comment", "reply", "p", "x"],
            vec!["mg", "comment", "edit", "c", "x"],
            vec!["mg", "comment", "delete", "c"],
            vec!["mg", "comment", "status", "c", "Accepted"],
            vec!["mg", "comment", "read", "c"],
            vec!["mg", "select", "c", "--page", "2"],
            vec!["mg", "list", "--all"],
            vec!["mg", "filter", "set", "--text", "fig", "--unread"],
            vec!["mg", "filter", "clear"],
            vec!["mg", "filter", "show"],
            vec!["mg", "outbox", "list"],
            vec!["mg", "outbox", "reset"],
            vec!["mg", "sync"],
            vec!["mg", "watch", "--no-probe"],
            vec!["mg", "export", "-o", "out.json"],
            vec!["mg", "completions", "zsh"],
        ];
        for args in &subcommands {
            let result = Cli::try_parse_from(args.iter());
            assert!(result.is_ok(), "failed to parse {args:?}: {:?}", result.err());
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
