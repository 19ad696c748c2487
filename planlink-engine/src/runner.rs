//! Async driver for the pure protocol state machines.
//!
//! A session never awaits anything. It receives a [`SessionEvent`] together
//! with the current time and answers with a list of [`Effect`]s. [`drive`]
//! owns all the waiting: it performs the effects, then `select!`s over the
//! next inbound message, the session's retry deadline, the cancel flag and
//! the link status until the session reaches a terminal state.

use tokio::sync::watch;
use tokio::time::Instant;

// ---

use planlink_domain::{LinkMessage, LinkStatus, Result};

// ---

use crate::clock::Clock;
use crate::events::{EventTx, PlanEvent, Router};
use crate::link::LinkLease;

// ---------------------------------------------------------------------------
// SessionEvent / Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    // ---
    Start,
    Message(LinkMessage),

    /// The retry deadline may have passed.
    Tick,

    /// The user aborted the operation.
    Cancel,

    /// The health monitor declared the session's link lost.
    LinkLost,
}

// ---

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    // ---
    Send(LinkMessage),

    /// Not for this session; hand to the generic router.
    Forward(LinkMessage),

    Notify(PlanEvent),
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// A protocol state machine with pure transitions.
pub trait Exchange {
    // ---
    type Output;

    fn handle_event(&mut self, event: SessionEvent, now: Instant) -> Vec<Effect>;

    /// When the session next wants a [`SessionEvent::Tick`].
    fn deadline(&self) -> Option<Instant>;

    fn is_terminal(&self) -> bool;

    /// Resends consumed so far.
    fn retries(&self) -> u32;

    /// Consume a terminal session and yield its result.
    fn finish(self) -> Result<Self::Output>;
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// External conditions that can end a session early.
#[derive(Debug, Clone)]
pub struct Signals {
    // ---
    pub cancel: watch::Receiver<bool>,
    pub status: watch::Receiver<LinkStatus>,
}

// ---

/// Everything a running session may talk to besides its link.
pub struct Outlets<'a> {
    // ---
    pub router: &'a Router,
    pub events: &'a EventTx,
    pub clock: &'a dyn Clock,
}

// ---------------------------------------------------------------------------
// drive
// ---------------------------------------------------------------------------

/// Run `session` on `lease` until it is terminal.
///
/// Returns as soon as the session terminates; the caller drops the lease to
/// release the link.
pub async fn drive<E: Exchange>(session: &mut E, lease: &mut LinkLease, signals: &mut Signals, outlets: &Outlets<'_>) {
    // ---
    let link = lease.id();
    let mut cancel_open = true;
    let mut status_open = true;

    let first = if *signals.cancel.borrow_and_update() {
        SessionEvent::Cancel
    } else if !signals.status.borrow_and_update().permits(link) {
        SessionEvent::LinkLost
    } else {
        SessionEvent::Start
    };
    let mut effects = session.handle_event(first, outlets.clock.now());

    loop {
        // ---
        if let Err(e) = apply(effects, lease, outlets).await {
            tracing::warn!(link = ?link, "send failed: {e}");
            effects = session.handle_event(SessionEvent::LinkLost, outlets.clock.now());
            continue;
        }

        if session.is_terminal() {
            return;
        }

        let deadline = session.deadline();

        let event = tokio::select! {
            biased;

            changed = signals.cancel.changed(), if cancel_open => {
                if changed.is_err() {
                    cancel_open = false;
                    effects = Vec::new();
                    continue;
                }
                if !*signals.cancel.borrow_and_update() {
                    effects = Vec::new();
                    continue;
                }
                SessionEvent::Cancel
            }

            changed = signals.status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    effects = Vec::new();
                    continue;
                }
                let status = *signals.status.borrow_and_update();
                if status.permits(link) {
                    effects = Vec::new();
                    continue;
                }
                tracing::warn!(link = ?link, ?status, "link no longer usable — aborting session");
                SessionEvent::LinkLost
            }

            msg = lease.recv() => match msg {
                Some(msg) => SessionEvent::Message(msg),
                None => SessionEvent::LinkLost,
            },

            _ = sleep_until(deadline) => SessionEvent::Tick,
        };

        effects = session.handle_event(event, outlets.clock.now());
    }
}

// ---

async fn apply(effects: Vec<Effect>, lease: &LinkLease, outlets: &Outlets<'_>) -> Result<()> {
    // ---
    for effect in effects {
        match effect {
            Effect::Send(msg) => lease.send(&msg).await?,
            Effect::Forward(msg) => outlets.router.route(msg),
            Effect::Notify(event) => {
                outlets.events.send(event);
            }
        }
    }
    Ok(())
}

// ---

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
