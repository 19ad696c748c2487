//! Item transfer sessions: download, upload and clear for one collection.
//!
//! Each session is a pure state machine implementing [`Exchange`]. It holds
//! exactly one outstanding request at a time through its
//! [`RetrySupervisor`]; sequence numbers within a collection are handled
//! strictly in order.

use std::time::Duration;

// ---

use tokio::time::Instant;

// ---

use planlink_domain::{
    // ---
    Collection,
    CollectionType,
    LinkMessage,
    MissionItem,
    NackCode,
    PlanLinkError,
    Result,
    TransferProgress,
};

// ---

use crate::events::PlanEvent;
use crate::retry::{Expected, RetryPoll, RetryPolicy, RetrySupervisor};
use crate::runner::{Effect, Exchange, SessionEvent};

// ---------------------------------------------------------------------------
// TransferState
// ---------------------------------------------------------------------------

/// Lifecycle of one transfer.
///
/// `RequestingItem`, `SendingCount` and `SendingItem` are transient: the
/// session passes through them inside a single transition while it arms the
/// next request.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    // ---
    Idle,

    // --- download
    AwaitingCount,
    RequestingItem(u16),
    AwaitingItem(u16),

    // --- upload
    SendingCount,
    AwaitingItemRequest,
    SendingItem(u16),

    AwaitingFinalAck,
    Complete,
    Failed(String),
}

// ---

#[derive(Debug)]
enum Direction {
    // ---
    Download {
        count: u16,
        items: Vec<MissionItem>,
    },
    Upload {
        collection: Collection,
        /// Highest seq sent so far.
        highest_sent: Option<u16>,
    },
    Clear,
}

// ---------------------------------------------------------------------------
// TransferSession
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TransferSession {
    // ---
    kind: CollectionType,
    direction: Direction,
    state: TransferState,
    retry: RetrySupervisor,
    policy: RetryPolicy,
    final_ack_timeout: Duration,
    error: Option<PlanLinkError>,
}

// ---

impl TransferSession {
    // ---
    /// Read `kind` from the vehicle.
    pub fn download(kind: CollectionType, policy: RetryPolicy) -> Self {
        Self::with_direction(
            kind,
            Direction::Download {
                count: 0,
                items: Vec::new(),
            },
            policy,
            policy.timeout(),
        )
    }

    /// Replace the vehicle's copy of `collection.kind()`.
    pub fn upload(collection: Collection, policy: RetryPolicy, final_ack_timeout: Duration) -> Self {
        let kind = collection.kind();
        Self::with_direction(
            kind,
            Direction::Upload {
                collection,
                highest_sent: None,
            },
            policy,
            final_ack_timeout,
        )
    }

    /// Remove `kind` from the vehicle.
    pub fn clear(kind: CollectionType, policy: RetryPolicy) -> Self {
        Self::with_direction(kind, Direction::Clear, policy, policy.timeout())
    }

    fn with_direction(kind: CollectionType, direction: Direction, policy: RetryPolicy, final_ack_timeout: Duration) -> Self {
        // ---
        Self {
            kind,
            direction,
            state: TransferState::Idle,
            retry: RetrySupervisor::new(policy),
            policy,
            final_ack_timeout,
            error: None,
        }
    }

    // ---

    pub fn kind(&self) -> CollectionType {
        self.kind
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    // ---

    fn start(&mut self, now: Instant, out: &mut Vec<Effect>) {
        // ---
        let kind = self.kind;
        match &self.direction {
            Direction::Download { .. } => {
                tracing::debug!(%kind, "requesting item count");
                let msg = self.retry.arm(LinkMessage::RequestList { kind }, Expected::ItemCount(kind), now);
                out.push(Effect::Send(msg));
                self.state = TransferState::AwaitingCount;
            }
            Direction::Upload { collection, .. } => {
                if let Err(e) = collection.validate() {
                    self.fail(e);
                    return;
                }
                self.state = TransferState::SendingCount;
                self.pump(now, out);
            }
            Direction::Clear => {
                tracing::debug!(%kind, "clearing collection on vehicle");
                let msg = self.retry.arm(LinkMessage::ClearAll { kind }, Expected::Ack(kind), now);
                out.push(Effect::Send(msg));
                self.state = TransferState::AwaitingFinalAck;
            }
        }
    }

    // ---

    /// Leave the transient states: arm and send whatever they call for.
    fn pump(&mut self, now: Instant, out: &mut Vec<Effect>) {
        // ---
        let kind = self.kind;

        match self.state {
            TransferState::RequestingItem(seq) => {
                let msg = self
                    .retry
                    .arm(LinkMessage::RequestItem { kind, seq }, Expected::Item(kind), now);
                out.push(Effect::Send(msg));
                self.state = TransferState::AwaitingItem(seq);
            }

            TransferState::SendingCount => {
                let Direction::Upload { collection, .. } = &self.direction else {
                    return;
                };
                let count = collection.len() as u16;
                tracing::debug!(%kind, count, "announcing upload");
                let announce = LinkMessage::ItemCount { kind, count };

                if count == 0 {
                    let msg = self.retry.arm(announce, Expected::Ack(kind), now);
                    out.push(Effect::Send(msg));
                    self.state = TransferState::AwaitingFinalAck;
                } else {
                    let msg = self.retry.arm(announce, Expected::ItemRequest(kind), now);
                    out.push(Effect::Send(msg));
                    self.state = TransferState::AwaitingItemRequest;
                }
            }

            TransferState::SendingItem(seq) => {
                let Direction::Upload {
                    collection,
                    highest_sent,
                } = &mut self.direction
                else {
                    return;
                };
                let Some(item) = collection.get(seq).cloned() else {
                    return;
                };
                let total = collection.len() as u16;
                let reply = LinkMessage::Item { kind, item };

                let done = highest_sent.map_or(seq, |h| h.max(seq));
                *highest_sent = Some(done);

                if done + 1 == total {
                    // Every item has gone out at least once: a re-served
                    // item keeps the session waiting on the final ack.
                    let msg = self.retry.arm_with(
                        reply,
                        Expected::Ack(kind),
                        self.final_ack_timeout,
                        self.policy.max_attempts,
                        now,
                    );
                    out.push(Effect::Send(msg));
                    self.state = TransferState::AwaitingFinalAck;
                } else {
                    let msg = self.retry.arm(reply, Expected::ItemRequest(kind), now);
                    out.push(Effect::Send(msg));
                    self.state = TransferState::AwaitingItemRequest;
                }
                out.push(self.progress(u32::from(done) + 1, u32::from(total)));
            }

            _ => {}
        }
    }

    // ---

    fn on_message(&mut self, msg: LinkMessage, now: Instant, out: &mut Vec<Effect>) {
        // ---
        if !self.retry.accepts(&msg) {
            out.push(Effect::Forward(msg));
            return;
        }

        let kind = self.kind;

        if let LinkMessage::Nack { code, .. } = msg {
            tracing::warn!(%kind, ?code, "vehicle rejected transfer");
            self.fail(PlanLinkError::PeerRejected { kind, code });
            return;
        }

        match (self.state.clone(), msg) {
            // --- download ---------------------------------------------------
            (TransferState::AwaitingCount, LinkMessage::ItemCount { count, .. }) => {
                tracing::debug!(%kind, count, "vehicle reports item count");
                if let Direction::Download { count: expected, items } = &mut self.direction {
                    *expected = count;
                    items.reserve(usize::from(count));
                }
                if count == 0 {
                    out.push(Effect::Send(LinkMessage::Ack { kind }));
                    out.push(self.progress(0, 0));
                    self.complete();
                } else {
                    out.push(self.progress(0, u32::from(count)));
                    self.state = TransferState::RequestingItem(0);
                    self.pump(now, out);
                }
            }

            (TransferState::AwaitingItem(_), LinkMessage::ItemCount { .. }) => {
                let started = matches!(&self.direction, Direction::Download { items, .. } if !items.is_empty());
                if started {
                    self.fail(PlanLinkError::ProtocolViolation(
                        "vehicle repeated item count after items started".into(),
                    ));
                } else {
                    tracing::debug!(%kind, "ignoring duplicate item count");
                }
            }

            (TransferState::AwaitingItem(wanted), LinkMessage::Item { item, .. }) => {
                let Direction::Download { count, items } = &mut self.direction else {
                    return;
                };
                let count = *count;

                if item.seq >= count {
                    tracing::warn!(%kind, seq = item.seq, count, "ignoring item outside announced range");
                    return;
                }
                if item.seq != wanted {
                    tracing::debug!(%kind, seq = item.seq, wanted, "discarding stale item");
                    return;
                }

                items.push(item);
                let done = items.len() as u16;
                out.push(self.progress(u32::from(done), u32::from(count)));

                if done == count {
                    self.retry.disarm();
                    out.push(Effect::Send(LinkMessage::Ack { kind }));
                    self.complete();
                } else {
                    self.state = TransferState::RequestingItem(done);
                    self.pump(now, out);
                }
            }

            // --- upload -----------------------------------------------------
            (TransferState::AwaitingItemRequest | TransferState::AwaitingFinalAck, LinkMessage::RequestItem { seq, .. })
                if matches!(self.direction, Direction::Upload { .. }) =>
            {
                let total = match &self.direction {
                    Direction::Upload { collection, .. } => collection.len() as u16,
                    _ => 0,
                };
                if seq >= total {
                    tracing::warn!(%kind, seq, total, "vehicle requested item outside range");
                    out.push(Effect::Send(LinkMessage::Nack {
                        kind,
                        code: NackCode::InvalidSequence,
                    }));
                    self.fail(PlanLinkError::ProtocolViolation(
                        "vehicle requested item outside range".into(),
                    ));
                    return;
                }
                tracing::trace!(%kind, seq, "sending item");
                self.state = TransferState::SendingItem(seq);
                self.pump(now, out);
            }

            (TransferState::AwaitingItemRequest | TransferState::AwaitingFinalAck, LinkMessage::Ack { .. }) => {
                let upload = match &self.direction {
                    Direction::Upload {
                        collection,
                        highest_sent,
                    } => Some((collection.len() as u16, *highest_sent)),
                    _ => None,
                };
                if let Some((total, highest_sent)) = upload {
                    if total > 0 && highest_sent != Some(total - 1) {
                        self.fail(PlanLinkError::ProtocolViolation(
                            "vehicle acknowledged before all items were sent".into(),
                        ));
                        return;
                    }
                    out.push(self.progress(u32::from(total), u32::from(total)));
                }
                self.complete();
            }

            (state, msg) => {
                tracing::debug!(%kind, ?state, msg = msg.name(), "unexpected response");
                out.push(Effect::Forward(msg));
            }
        }
    }

    // ---

    fn on_tick(&mut self, now: Instant, out: &mut Vec<Effect>) {
        // ---
        let kind = self.kind;
        match self.retry.poll(now) {
            RetryPoll::Resend(msg) => {
                let attempt = self.retry.state().map_or(0, |s| s.attempt);
                tracing::info!(%kind, attempt, msg = msg.name(), "no response, resending");
                out.push(Effect::Send(msg));
            }
            RetryPoll::Exhausted { attempts } => {
                let what = self.timeout_reason();
                tracing::warn!(%kind, attempts, "{what}");
                self.fail(PlanLinkError::Timeout { what, attempts });
            }
            RetryPoll::Idle | RetryPoll::Waiting => {}
        }
    }

    fn timeout_reason(&self) -> String {
        // ---
        match (&self.state, &self.direction) {
            (TransferState::AwaitingCount, _) => "vehicle did not respond to request for item count".into(),
            (TransferState::AwaitingItem(seq), _) => format!("vehicle did not send {} item {seq}", self.kind),
            (TransferState::AwaitingItemRequest, Direction::Upload { highest_sent: None, .. }) => {
                "vehicle did not respond to item count".into()
            }
            (TransferState::AwaitingItemRequest, _) => "vehicle did not request the next item".into(),
            (TransferState::AwaitingFinalAck, Direction::Clear) => {
                format!("vehicle did not acknowledge clearing {}", self.kind)
            }
            _ => "vehicle failed to send final ack".into(),
        }
    }

    // ---

    fn progress(&self, done: u32, total: u32) -> Effect {
        Effect::Notify(PlanEvent::Progress(TransferProgress {
            kind: self.kind,
            items_done: done,
            items_total: total,
        }))
    }

    fn complete(&mut self) {
        self.retry.disarm();
        self.state = TransferState::Complete;
        tracing::debug!(kind = %self.kind, retries = self.retry.resends(), "transfer complete");
    }

    fn fail(&mut self, err: PlanLinkError) {
        // ---
        self.retry.disarm();
        if let Direction::Download { items, .. } = &mut self.direction {
            items.clear();
        }
        self.state = TransferState::Failed(err.to_string());
        self.error = Some(err);
    }
}

// ---

impl Exchange for TransferSession {
    // ---
    /// The collection as it now exists on the vehicle.
    type Output = Collection;

    fn handle_event(&mut self, event: SessionEvent, now: Instant) -> Vec<Effect> {
        // ---
        let mut out = Vec::new();

        if self.is_terminal() {
            if let SessionEvent::Message(msg) = event {
                out.push(Effect::Forward(msg));
            }
            return out;
        }

        match event {
            SessionEvent::Start => {
                if self.state == TransferState::Idle {
                    self.start(now, &mut out);
                }
            }
            SessionEvent::Message(msg) => self.on_message(msg, now, &mut out),
            SessionEvent::Tick => self.on_tick(now, &mut out),
            SessionEvent::Cancel => {
                if self.state != TransferState::Idle {
                    out.push(Effect::Send(LinkMessage::Nack {
                        kind: self.kind,
                        code: NackCode::OperationCancelled,
                    }));
                }
                self.fail(PlanLinkError::Cancelled);
            }
            SessionEvent::LinkLost => self.fail(PlanLinkError::LinkLost),
        }
        out
    }

    fn deadline(&self) -> Option<Instant> {
        self.retry.deadline()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, TransferState::Complete | TransferState::Failed(_))
    }

    fn retries(&self) -> u32 {
        self.retry.resends()
    }

    fn finish(self) -> Result<Collection> {
        // ---
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.state != TransferState::Complete {
            return Err(PlanLinkError::ProtocolViolation(format!(
                "{} transfer finished in state {:?}",
                self.kind, self.state
            )));
        }
        match self.direction {
            Direction::Download { items, .. } => Collection::from_wire(self.kind, items),
            Direction::Upload { collection, .. } => Ok(collection),
            Direction::Clear => Ok(Collection::new(self.kind)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
