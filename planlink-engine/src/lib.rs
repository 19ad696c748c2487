//! PlanLink protocol engine.
//!
//! Transfers mission, geofence and rally collections to and from a vehicle,
//! and flashes firmware through its bootloader, over unreliable links that
//! may drop, duplicate or reorder messages.
//!
//! # Structure
//!
//! - [`retry`]       — [`RetrySupervisor`]: one outstanding request, bounded resends
//! - [`transfer`]    — [`TransferSession`]: download / upload / clear state machine
//! - [`flash`]       — [`FlashSession`]: bootloader state machine
//! - [`runner`]      — [`Exchange`] trait and the async [`drive`] loop
//! - [`link`]        — [`LinkHandle`] reader task and exclusive [`LinkLease`]
//! - [`health`]      — [`LinkHealthMonitor`] and the [`HealthService`] task
//! - [`coordinator`] — [`PlanCoordinator`]: whole-plan operations
//! - [`events`]      — [`PlanEvent`] fan-out to a [`PlanHandler`](planlink_domain::PlanHandler)
//! - [`config`]      — [`EngineConfig`], loadable from TOML
//! - [`plan_file`]   — JSON plan documents on disk
//!
//! [`Engine`] wires all of it together for a set of links.

use std::sync::Arc;

// ---

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---

use planlink_domain::{LinkChannelPtr, LinkId, LinkStatus, PlanHandler, PlanLinkError, Result};

// ---

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod flash;
pub mod health;
pub mod link;
pub mod plan_file;
pub mod retry;
pub mod runner;
pub mod transfer;

// --- public API
pub use clock::{Clock, ClockPtr, ManualClock, TokioClock};
pub use config::EngineConfig;
pub use coordinator::{PlanCoordinator, PlanError, PlanOutcome};
pub use events::{EventBridge, EventTx, PlanEvent, Router};
pub use flash::{FirmwareImage, FlashError, FlashPolicy, FlashReport, FlashSession, FlashState};
pub use health::{HealthEvent, HealthPolicy, HealthService, LinkHealthMonitor};
pub use link::{LinkHandle, LinkLease, Traffic};
pub use plan_file::{load_plan, save_plan, PlanFile};
pub use retry::{Expected, RetryPoll, RetryPolicy, RetryState, RetrySupervisor};
pub use runner::{drive, Effect, Exchange, SessionEvent, Signals};
pub use transfer::{TransferSession, TransferState};

// ---------------------------------------------------------------------------
// EngineBuilder
// ---------------------------------------------------------------------------

/// Collects links and collaborators, then starts an [`Engine`].
pub struct EngineBuilder {
    // ---
    config: EngineConfig,
    links: Vec<(LinkId, LinkChannelPtr)>,
    handler: Option<Arc<dyn PlanHandler>>,
    events: EventTx,
    router: Router,
}

// ---

impl EngineBuilder {
    // ---
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            links: Vec::new(),
            handler: None,
            events: EventTx::disabled(),
            router: Router::detached(),
        }
    }

    /// Add a link. The first link added starts out active.
    pub fn link(mut self, id: LinkId, channel: LinkChannelPtr) -> Self {
        self.links.push((id, channel));
        self
    }

    /// Deliver events to `handler`. Takes precedence over [`Self::events`].
    pub fn handler(mut self, handler: Arc<dyn PlanHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Deliver raw [`PlanEvent`]s to `events`.
    pub fn events(mut self, events: EventTx) -> Self {
        self.events = events;
        self
    }

    /// Deliver unsolicited inbound messages to `router`.
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    // ---

    /// Spawn link readers, the health service and the event bridge.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> Result<Engine> {
        // ---
        if self.links.is_empty() {
            return Err(PlanLinkError::Transport("engine started with no links".into()));
        }

        let mut tasks = Vec::new();
        let events = match self.handler {
            Some(handler) => {
                let (tx, bridge) = EventBridge::spawn(handler);
                tasks.push(bridge);
                tx
            }
            None => self.events,
        };

        let (traffic_tx, traffic_rx) = mpsc::unbounded_channel();
        let ids: Vec<LinkId> = self.links.iter().map(|(id, _)| *id).collect();
        let handles = self
            .links
            .into_iter()
            .map(|(id, channel)| LinkHandle::spawn(id, channel, traffic_tx.clone()))
            .collect();
        drop(traffic_tx);

        let (status, health) = HealthService::spawn(self.config.health, &ids, traffic_rx, events.clone());
        tasks.push(health);

        tracing::info!(links = ?ids, "engine started");

        let coordinator = PlanCoordinator::new(self.config, handles, status, events, self.router);
        Ok(Engine {
            coordinator: Arc::new(coordinator),
            tasks,
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A running engine. Dropping it stops the background tasks.
pub struct Engine {
    // ---
    coordinator: Arc<PlanCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

// ---

impl Engine {
    // ---
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn coordinator(&self) -> Arc<PlanCoordinator> {
        self.coordinator.clone()
    }

    pub fn status(&self) -> LinkStatus {
        self.coordinator.status()
    }
}

// ---

impl Drop for Engine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests;
