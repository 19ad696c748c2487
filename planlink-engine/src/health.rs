//! Link health tracking and failover.
//!
//! [`LinkHealthMonitor`] is the pure part: it is fed arrivals and ticks and
//! answers with [`HealthEvent`]s. [`HealthService`] wraps it in a tokio task
//! that drains [`Traffic`] from the link readers, ticks on a fixed interval,
//! and publishes the resulting [`LinkStatus`] on a `watch` channel that every
//! running session observes.

use std::collections::BTreeMap;
use std::time::Duration;

// ---

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ---

use planlink_domain::{LinkId, LinkState, LinkStatus};

// ---

use crate::events::{EventTx, PlanEvent};
use crate::link::Traffic;

// ---------------------------------------------------------------------------
// HealthPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    // ---
    /// Evaluation interval of the health service.
    pub tick_ms: u64,

    /// Silence after which a link is `Degraded`.
    pub degraded_after_ms: u64,

    /// Silence after which a link is `Lost`.
    pub lost_after_ms: u64,

    /// Consecutive valid messages needed to bring a lost link back.
    pub recovery_messages: u32,
}

// ---

impl Default for HealthPolicy {
    fn default() -> Self {
        // ---
        Self {
            tick_ms: 250,
            degraded_after_ms: 2_000,
            lost_after_ms: 5_000,
            recovery_messages: 3,
        }
    }
}

// ---

impl HealthPolicy {
    // ---
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn degraded_after(&self) -> Duration {
        Duration::from_millis(self.degraded_after_ms)
    }

    pub fn lost_after(&self) -> Duration {
        Duration::from_millis(self.lost_after_ms)
    }
}

// ---------------------------------------------------------------------------
// HealthEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    // ---
    Changed {
        link: LinkId,
        from: LinkState,
        to: LinkState,
    },

    /// The active link moved to a healthy alternative.
    Failover { from: LinkId, to: LinkId },

    /// The active link was lost and nothing healthy could replace it.
    ActiveLost(LinkId),
}

// ---

#[derive(Debug, Clone, Copy)]
struct LinkRecord {
    // ---
    state: LinkState,
    last_rx: Instant,
    valid_streak: u32,
}

// ---------------------------------------------------------------------------
// LinkHealthMonitor
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LinkHealthMonitor {
    // ---
    policy: HealthPolicy,
    links: BTreeMap<LinkId, LinkRecord>,
    active: LinkId,
}

// ---

impl LinkHealthMonitor {
    // ---
    /// Every link starts `Healthy` as of `now`; the first one is active.
    ///
    /// `links` must not be empty.
    pub fn new(policy: HealthPolicy, links: &[LinkId], now: Instant) -> Self {
        // ---
        let records = links
            .iter()
            .map(|id| {
                let record = LinkRecord {
                    state: LinkState::Healthy,
                    last_rx: now,
                    valid_streak: 0,
                };
                (*id, record)
            })
            .collect();

        Self {
            policy,
            links: records,
            active: links.first().copied().unwrap_or(LinkId::Primary),
        }
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            active: self.active,
            state: self.state(self.active),
        }
    }

    pub fn state(&self, link: LinkId) -> LinkState {
        self.links.get(&link).map_or(LinkState::Lost, |r| r.state)
    }

    // ---

    /// Record one arrival on `link`. `valid` is false for undecodable packets.
    pub fn on_traffic(&mut self, link: LinkId, valid: bool, now: Instant) -> Vec<HealthEvent> {
        // ---
        let mut events = Vec::new();
        let recovery = self.policy.recovery_messages.max(1);
        let gap = self.policy.degraded_after();

        let Some(record) = self.links.get_mut(&link) else {
            return events;
        };

        if !valid {
            record.valid_streak = 0;
            return events;
        }

        let silence = now.saturating_duration_since(record.last_rx);
        record.last_rx = now;

        let from = record.state;
        match from {
            LinkState::Healthy => {}
            LinkState::Degraded => record.state = LinkState::Healthy,
            LinkState::Lost => {
                record.valid_streak = if silence > gap { 1 } else { record.valid_streak + 1 };
                if record.valid_streak >= recovery {
                    record.valid_streak = 0;
                    record.state = LinkState::Healthy;
                }
            }
        }

        if record.state != from {
            events.push(HealthEvent::Changed {
                link,
                from,
                to: record.state,
            });
        }

        self.reconcile(&mut events);
        events
    }

    // ---

    /// Re-evaluate silence on every link.
    pub fn tick(&mut self, now: Instant) -> Vec<HealthEvent> {
        // ---
        let mut events = Vec::new();
        let degraded_after = self.policy.degraded_after();
        let lost_after = self.policy.lost_after();

        for (link, record) in self.links.iter_mut() {
            let silence = now.saturating_duration_since(record.last_rx);
            let from = record.state;

            let to = match from {
                LinkState::Lost => LinkState::Lost,
                _ if silence >= lost_after => LinkState::Lost,
                _ if silence >= degraded_after => LinkState::Degraded,
                state => state,
            };

            if to != from {
                record.state = to;
                record.valid_streak = 0;
                events.push(HealthEvent::Changed { link: *link, from, to });
            }
        }

        self.reconcile(&mut events);
        events
    }

    // ---

    /// Promote a healthy link when the active one is lost.
    fn reconcile(&mut self, events: &mut Vec<HealthEvent>) {
        // ---
        if self.state(self.active) != LinkState::Lost {
            return;
        }

        let replacement = self
            .links
            .iter()
            .find(|(id, r)| **id != self.active && r.state == LinkState::Healthy)
            .map(|(id, _)| *id);

        match replacement {
            Some(to) => {
                events.push(HealthEvent::Failover { from: self.active, to });
                self.active = to;
            }
            None => {
                let active = self.active;
                let just_lost = events.iter().any(|e| {
                    matches!(e, HealthEvent::Changed { link, to: LinkState::Lost, .. } if *link == active)
                });
                if just_lost {
                    events.push(HealthEvent::ActiveLost(active));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HealthService
// ---------------------------------------------------------------------------

/// Background task owning a [`LinkHealthMonitor`].
pub struct HealthService {
    // ---
    monitor: LinkHealthMonitor,
    traffic: mpsc::UnboundedReceiver<Traffic>,
    status_tx: watch::Sender<LinkStatus>,
    events: EventTx,
    tick: Duration,
}

// ---

impl HealthService {
    // ---
    /// Spawn the service. Returns the status channel sessions observe.
    pub fn spawn(
        policy: HealthPolicy,
        links: &[LinkId],
        traffic: mpsc::UnboundedReceiver<Traffic>,
        events: EventTx,
    ) -> (watch::Receiver<LinkStatus>, JoinHandle<()>) {
        // ---
        let monitor = LinkHealthMonitor::new(policy, links, Instant::now());
        let (status_tx, status_rx) = watch::channel(monitor.status());

        let service = HealthService {
            monitor,
            traffic,
            status_tx,
            events,
            tick: policy.tick(),
        };

        (status_rx, tokio::spawn(service.run()))
    }

    // ---

    async fn run(mut self) {
        // ---
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let events = tokio::select! {
                arrival = self.traffic.recv() => match arrival {
                    Some(t) => self.monitor.on_traffic(t.link, t.valid, Instant::now()),
                    None => {
                        tracing::info!("all link readers gone — health service exiting");
                        return;
                    }
                },
                _ = ticker.tick() => self.monitor.tick(Instant::now()),
            };

            if events.is_empty() {
                continue;
            }

            for event in &events {
                match event {
                    HealthEvent::Changed { link, from, to } => {
                        tracing::info!(link = ?link, "link state {from:?} → {to:?}");
                    }
                    HealthEvent::Failover { from, to } => {
                        tracing::warn!("failover: {from:?} lost, {to:?} is now active");
                    }
                    HealthEvent::ActiveLost(link) => {
                        tracing::warn!(link = ?link, "active link lost, no healthy alternative");
                    }
                }
            }

            let status = self.monitor.status();
            let changed = self.status_tx.send_if_modified(|current| {
                if *current == status {
                    return false;
                }
                *current = status;
                true
            });
            if changed {
                self.events.send(PlanEvent::LinkStatus(status));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
