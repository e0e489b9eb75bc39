//! Delivery coordinator: single-flight drain state machine for the outbox.
//!
//! The coordinator owns no I/O. The session asks it whether a dispatch may
//! start, tells it when one starts and how it ended, and feeds it
//! connectivity changes. Time comes from `tokio::time::Instant` so tests can
//! run on a paused clock.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::model::{Action, Mutation};

/// Backoff delay used when the configuration does not override it.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Draining,
    Backoff { until: Instant },
}

/// The mutation currently on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub seq: i64,
    pub action: Action,
    pub target_id: String,
    pub online_only: bool,
}

impl From<&Mutation> for InFlight {
    fn from(mutation: &Mutation) -> Self {
        Self {
            seq: mutation.seq,
            action: mutation.action,
            target_id: mutation.target_id.clone(),
            online_only: mutation.online_only,
        }
    }
}

/// How a finished dispatch must be recorded in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Server confirmed; remove the entry.
    Acknowledge(InFlight),
    /// Online-only entry; remove it whatever the outcome.
    Discard { flight: InFlight, delivered: bool },
    /// Count the failure and keep the entry at the head.
    Retry { flight: InFlight, error: String },
}

#[derive(Debug)]
pub struct Coordinator {
    state: DeliveryState,
    online: bool,
    in_flight: Option<InFlight>,
    backoff: Duration,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF)
    }
}

impl Coordinator {
    #[must_use]
    pub const fn new(backoff: Duration) -> Self {
        Self {
            state: DeliveryState::Idle,
            online: true,
            in_flight: None,
            backoff,
        }
    }

    #[must_use]
    pub const fn state(&self) -> DeliveryState {
        self.state
    }

    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.online
    }

    #[must_use]
    pub const fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    #[must_use]
    pub fn in_flight_seq(&self) -> Option<i64> {
        self.in_flight.as_ref().map(|flight| flight.seq)
    }

    /// Deadline of the current backoff wait, if any.
    #[must_use]
    pub const fn backoff_deadline(&self) -> Option<Instant> {
        match self.state {
            DeliveryState::Backoff { until } => Some(until),
            _ => None,
        }
    }

    /// Apply a connectivity change. Returns `true` when the session should try
    /// to drain right away (an offline to online transition).
    pub fn set_online(&mut self, online: bool) -> bool {
        if self.online == online {
            return false;
        }
        self.online = online;
        if online {
            info!("connectivity restored, draining outbox");
            self.state = DeliveryState::Draining;
            true
        } else {
            info!(in_flight = ?self.in_flight_seq(), "connectivity lost, delivery paused");
            self.state = DeliveryState::Idle;
            false
        }
    }

    /// Whether a new dispatch may start now.
    #[must_use]
    pub fn can_dispatch(&self, now: Instant) -> bool {
        if !self.online || self.in_flight.is_some() {
            return false;
        }
        match self.state {
            DeliveryState::Backoff { until } => now >= until,
            DeliveryState::Idle | DeliveryState::Draining => true,
        }
    }

    /// Record that `mutation` went on the wire.
    pub fn begin(&mut self, mutation: &Mutation) {
        debug!(
            seq = mutation.seq,
            action = %mutation.action,
            target = %mutation.target_id,
            attempts = mutation.attempts,
            "dispatching mutation"
        );
        self.in_flight = Some(InFlight::from(mutation));
        self.state = DeliveryState::Draining;
    }

    /// Record the outcome of the in-flight dispatch and decide what the
    /// outbox must do. Returns `None` if nothing was in flight.
    pub fn finish(&mut self, delivered: bool, error: &str, now: Instant) -> Option<Settlement> {
        let flight = self.in_flight.take()?;

        self.state = if !self.online {
            DeliveryState::Idle
        } else if delivered || flight.online_only {
            DeliveryState::Draining
        } else {
            DeliveryState::Backoff {
                until: now + self.backoff,
            }
        };

        Some(if flight.online_only {
            Settlement::Discard { flight, delivered }
        } else if delivered {
            Settlement::Acknowledge(flight)
        } else {
            Settlement::Retry {
                flight,
                error: error.to_string(),
            }
        })
    }

    /// Nothing eligible to send: the outbox is empty or its head is saturated.
    pub fn settle_idle(&mut self) {
        if self.in_flight.is_none() && matches!(self.state, DeliveryState::Draining) {
            self.state = DeliveryState::Idle;
        }
    }

    /// Leave backoff once the deadline passed.
    pub fn backoff_elapsed(&mut self, now: Instant) {
        if let DeliveryState::Backoff { until } = self.state
            && now >= until
        {
            self.state = DeliveryState::Draining;
        }
    }
}

/// Coarse delivery state reported to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Nothing pending.
    Synced,
    /// Entries pending, none on the wire.
    Pending,
    Sending,
    /// Waiting out a failed attempt.
    Retrying,
    Offline,
    /// The head entry hit the attempt cap and blocks the queue.
    Degraded,
}

/// Sync indicator shown next to the review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncIndicator {
    pub state: SyncState,
    pub pending: usize,
    pub saturated: usize,
    pub online: bool,
}

impl SyncIndicator {
    #[must_use]
    pub const fn compute(
        coordinator: &Coordinator,
        pending: usize,
        saturated: usize,
        head_saturated: bool,
    ) -> Self {
        let state = if head_saturated {
            SyncState::Degraded
        } else if !coordinator.online {
            SyncState::Offline
        } else if coordinator.in_flight.is_some() {
            SyncState::Sending
        } else if matches!(coordinator.state, DeliveryState::Backoff { .. }) {
            SyncState::Retrying
        } else if pending == 0 {
            SyncState::Synced
        } else {
            SyncState::Pending
        };
        Self {
            state,
            pending,
            saturated,
            online: coordinator.online,
        }
    }
}
