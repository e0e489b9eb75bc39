//! `mg watch` — run the review session until interrupted.
//!
//! Delivers queued mutations as connectivity allows, refetches on a timer and
//! after every reconnect, and prints the sync indicator whenever it changes.
//! Connectivity comes from a TCP probe of the review server.

use anyhow::{Context as _, Result, bail};
use clap::Args;
use marginalia_core::coordinator::SyncIndicator;
use marginalia_core::session::{Command, SessionHandle, ViewSink};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use super::{Context, runtime};
use crate::output::OutputMode;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Seconds between connectivity probes.
    #[arg(long, default_value_t = 15)]
    pub probe_secs: u64,

    /// Treat the server as always reachable.
    #[arg(long)]
    pub no_probe: bool,
}

/// Prints indicator changes as they happen.
struct WatchView {
    output: OutputMode,
}

impl ViewSink for WatchView {
    fn on_mirror_changed(&mut self, page: u32) {
        debug!(page, "mirror changed");
    }

    fn on_filter_changed(&mut self, visible: usize, total: usize) {
        debug!(visible, total, "projection updated");
    }

    fn on_sync_status(&mut self, indicator: SyncIndicator) {
        if self.output.is_json() {
            match serde_json::to_string(&indicator) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(%err, "failed to encode sync indicator"),
            }
        } else {
            println!(
                "{:?}  pending={} saturated={} online={}",
                indicator.state, indicator.pending, indicator.saturated, indicator.online
            );
        }
    }
}

/// Run `mg watch`.
///
/// # Errors
///
/// Returns an error if no server is configured, the session cannot be opened,
/// or local storage fails while running.
pub fn run_watch(args: &WatchArgs, ctx: &Context) -> Result<()> {
    let target = probe_target(ctx.server_url()?)?;
    let mut session = ctx.open_session_with_view(Box::new(WatchView { output: ctx.output }))?;
    let probe_every = Duration::from_secs(args.probe_secs.max(1));
    let probe = !args.no_probe;

    runtime()?.block_on(async move {
        let (handle, commands) = SessionHandle::channel(16);
        let (online_tx, online_rx) = watch::channel(true);
        if probe {
            tokio::spawn(probe_loop(target, probe_every, online_tx));
        } else {
            drop(online_tx);
        }
        tokio::spawn(async move {
            shutdown_signal().await;
            if let Err(err) = handle.call(Command::Shutdown).await {
                debug!(%err, "session already stopped");
            }
        });

        session.run(commands, online_rx).await?;
        anyhow::Ok(())
    })
}

/// `host:port` to probe for a server URL. A URL without a scheme is read as
/// `http://`.
///
/// # Errors
///
/// Returns an error if the URL does not parse or has no host.
pub fn probe_target(raw: &str) -> Result<String> {
    let parsed = if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("http://{raw}"))
    }
    .with_context(|| format!("invalid server url '{raw}'"))?;

    let Some(host) = parsed.host_str().filter(|host| !host.is_empty()) else {
        bail!("server url '{raw}' has no host");
    };
    let port = parsed.port_or_known_default().unwrap_or(80);
    Ok(format!("{host}:{port}"))
}

async fn probe_loop(target: String, every: Duration, online: watch::Sender<bool>) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let reachable = matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&target)).await,
            Ok(Ok(_))
        );
        let changed = online.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
        if changed {
            info!(%target, reachable, "server reachability changed");
        }
        if online.is_closed() {
            break;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C, stopping session"),
        () = terminate => info!("received SIGTERM, stopping session"),
    }
}
