//! Rendering for `mg` commands.
//!
//! Each command builds one serializable report and hands it to
//! [`render_mode`] (or [`render`] when pretty and text look the same). JSON
//! output is the report itself, pretty-printed, so scripts see the same
//! fields whichever command produced them.
//!
//! Which mode applies is decided in `marginalia_core::config`: `--json`, then
//! `FORMAT`, then the user config, then pretty on a terminal and text
//! otherwise.

use marginalia_core::error::SyncError;
use serde::Serialize;
use std::io::{self, Write};

/// Column width of the rule under pretty headings.
pub const PRETTY_RULE_WIDTH: usize = 72;

pub fn pretty_rule(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{}", "-".repeat(PRETTY_RULE_WIDTH))
}

/// Heading line plus rule.
pub fn pretty_section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    pretty_rule(w)
}

/// `key:` padded to a fixed column, then the value.
pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    let label = format!("{key}:");
    writeln!(w, "{label:<12} {}", value.as_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Sections and aligned fields for a terminal.
    Pretty,
    /// One fact per line, for grep and shell loops.
    Text,
    Json,
}

impl OutputMode {
    /// Mode for a resolved output name. Anything unrecognized is text.
    #[must_use]
    pub fn from_resolved(name: &str) -> Self {
        match name {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Text,
        }
    }

    #[must_use]
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

fn write_json<T: Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

/// Write `value` to stdout as JSON or through the text/pretty writer.
///
/// # Errors
///
/// Returns an error if serialization or the stdout write fails.
pub fn render_mode<T: Serialize>(
    mode: OutputMode,
    value: &T,
    text: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
    pretty: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    match mode {
        OutputMode::Json => write_json(&mut out, value)?,
        OutputMode::Text => text(value, &mut out)?,
        OutputMode::Pretty => pretty(value, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

/// [`render_mode`] with one writer for both human modes.
///
/// # Errors
///
/// Returns an error if serialization or the stdout write fails.
pub fn render<T: Serialize>(
    mode: OutputMode,
    value: &T,
    human: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    if mode.is_json() {
        write_json(&mut out, value)?;
    } else {
        human(value, &mut out)?;
    }
    out.flush()?;
    Ok(())
}

/// Error as shown to the user: message, optional `E####` code and hint.
#[derive(Debug, Serialize)]
pub struct CliError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            hint: None,
        }
    }
}

impl From<&SyncError> for CliError {
    fn from(err: &SyncError) -> Self {
        Self {
            message: err.to_string(),
            code: Some(err.code().code().to_string()),
            hint: err.hint().map(str::to_string),
        }
    }
}

impl From<&anyhow::Error> for CliError {
    fn from(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<SyncError>())
            .map_or_else(|| Self::new(format!("{err:#}")), Self::from)
    }
}

/// Report a failed command on stderr.
///
/// # Errors
///
/// Returns an error if the stderr write fails.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let mut out = io::stderr().lock();
    if mode.is_json() {
        return write_json(&mut out, &serde_json::json!({ "error": error }));
    }
    let prefix = error
        .code
        .as_ref()
        .map_or_else(|| "error".to_string(), |code| format!("error[{code}]"));
    writeln!(out, "{prefix}: {}", error.message)?;
    if let Some(hint) = &error.hint {
        writeln!(out, "  hint: {hint}")?;
    }
    Ok(())
}

/// First 12 characters of an annotation id.
#[must_use]
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
