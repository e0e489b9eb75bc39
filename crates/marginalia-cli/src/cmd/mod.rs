pub mod comment;
pub mod completions;
pub mod export;
pub mod filter;
pub mod list;
pub mod outbox;
pub mod select;
pub mod sync;
pub mod watch;

use anyhow::{Context as _, Result, bail};
use marginalia_core::config::EffectiveConfig;
use marginalia_core::session::{ReviewSession, SessionSettings, ViewSink};
use marginalia_core::transport::HttpTransport;

use crate::output::OutputMode;

/// Everything a command handler needs from the top-level CLI.
#[derive(Debug)]
pub struct Context {
    pub config: EffectiveConfig,
    pub output: OutputMode,
}

impl Context {
    /// Review id from `--review`, `MARGINALIA_REVIEW` or the project config.
    ///
    /// # Errors
    ///
    /// Returns an error if no review is configured.
    pub fn review_id(&self) -> Result<&str> {
        match self.config.review_id.as_deref() {
            Some(review) => Ok(review),
            None => bail!(
                "no review selected; pass --review, set MARGINALIA_REVIEW, \
                 or set [server] review in .marginalia/config.toml"
            ),
        }
    }

    /// Server URL for commands that talk to the network.
    ///
    /// # Errors
    ///
    /// Returns an error if no server is configured.
    pub fn server_url(&self) -> Result<&str> {
        match self.config.server_url.as_deref() {
            Some(url) => Ok(url),
            None => bail!(
                "no review server configured; set MARGINALIA_SERVER \
                 or [server] url in .marginalia/config.toml"
            ),
        }
    }

    /// Open the session for the configured review.
    ///
    /// Local-only commands never send anything, so a missing server URL is
    /// tolerated there and requests would fail as transport errors.
    ///
    /// # Errors
    ///
    /// Returns an error if no review is configured, the data directory is
    /// locked by another process, or the store cannot be opened.
    pub fn open_session(&self) -> Result<ReviewSession<HttpTransport>> {
        let review = self.review_id()?;
        let transport = HttpTransport::new(
            self.config.server_url.as_deref().unwrap_or_default(),
            self.config.connect_timeout(),
        );
        let settings = SessionSettings::from_config(&self.config, review);
        ReviewSession::open(&self.config.data_dir, settings, transport)
            .with_context(|| format!("open review {review}"))
    }

    /// Open the session with a view attached.
    ///
    /// # Errors
    ///
    /// Same as [`Context::open_session`].
    pub fn open_session_with_view(
        &self,
        view: Box<dyn ViewSink>,
    ) -> Result<ReviewSession<HttpTransport>> {
        let mut session = self.open_session()?;
        session.attach_view(view)?;
        Ok(session)
    }
}

/// View used by one-shot commands: it only knows which page the caller is on.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageView {
    pub page: u32,
}

impl ViewSink for PageView {
    fn current_page_index(&self) -> u32 {
        self.page
    }
}

/// Build a current-thread runtime for commands that talk to the server.
///
/// # Errors
///
/// Returns an error if the runtime cannot be created.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}
