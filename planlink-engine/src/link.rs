//! Link handles and the exclusive link-busy token.
//!
//! Each link gets a reader task that runs for the lifetime of the handle.
//! It reports every arrival to the health service (so an idle link is still
//! monitored), swallows heartbeats, and queues everything else for whoever
//! holds the link's [`LinkLease`].
//!
//! The inbound queue *is* the busy token: it sits behind a tokio mutex that
//! is only ever taken with `try_lock_owned`. Holding the owned guard means
//! holding the right to talk on the link; dropping it releases both.

use std::sync::Arc;

// ---

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

// ---

use planlink_domain::{LinkChannelPtr, LinkId, LinkMessage, PlanLinkError, Result};

// ---------------------------------------------------------------------------
// Traffic
// ---------------------------------------------------------------------------

/// One arrival on a link, as seen by the health service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Traffic {
    // ---
    pub link: LinkId,

    /// `false` for a packet that failed to decode.
    pub valid: bool,
}

// ---

type Inbound = mpsc::UnboundedReceiver<LinkMessage>;

// ---------------------------------------------------------------------------
// LinkHandle
// ---------------------------------------------------------------------------

pub struct LinkHandle {
    // ---
    id: LinkId,
    channel: LinkChannelPtr,
    inbound: Arc<Mutex<Inbound>>,
    reader: JoinHandle<()>,
}

// ---

impl LinkHandle {
    // ---
    /// Start the reader task for `channel`.
    pub fn spawn(id: LinkId, channel: LinkChannelPtr, traffic: mpsc::UnboundedSender<Traffic>) -> Self {
        // ---
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(id, channel.clone(), inbound_tx, traffic));

        Self {
            id,
            channel,
            inbound: Arc::new(Mutex::new(inbound_rx)),
            reader,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    // ---

    /// Take the link for one exchange. Fails with [`PlanLinkError::LinkBusy`]
    /// while another lease is alive; never waits.
    pub fn try_acquire(&self) -> Result<LinkLease> {
        // ---
        let inbound = self
            .inbound
            .clone()
            .try_lock_owned()
            .map_err(|_| PlanLinkError::LinkBusy(self.id))?;

        Ok(LinkLease {
            id: self.id,
            channel: self.channel.clone(),
            inbound,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.inbound.try_lock().is_err()
    }
}

// ---

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ---

async fn read_loop(
    id: LinkId,
    channel: LinkChannelPtr,
    inbound: mpsc::UnboundedSender<LinkMessage>,
    traffic: mpsc::UnboundedSender<Traffic>,
) {
    // ---
    loop {
        match channel.recv().await {
            Ok(msg) => {
                let _ = traffic.send(Traffic { link: id, valid: true });
                if msg == LinkMessage::Heartbeat {
                    continue;
                }
                if inbound.send(msg).is_err() {
                    break;
                }
            }
            Err(PlanLinkError::ChannelClosed) => {
                tracing::info!(link = ?id, "link channel closed — reader exiting");
                break;
            }
            Err(e) => {
                tracing::debug!(link = ?id, "undecodable packet: {e}");
                let _ = traffic.send(Traffic { link: id, valid: false });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LinkLease
// ---------------------------------------------------------------------------

/// Exclusive right to exchange messages on one link.
pub struct LinkLease {
    // ---
    id: LinkId,
    channel: LinkChannelPtr,
    inbound: OwnedMutexGuard<Inbound>,
}

// ---

impl LinkLease {
    // ---
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub async fn send(&self, msg: &LinkMessage) -> Result<()> {
        tracing::trace!(link = ?self.id, msg = msg.name(), "send");
        self.channel.send(msg).await
    }

    /// Next queued inbound message. `None` once the reader has exited.
    pub async fn recv(&mut self) -> Option<LinkMessage> {
        self.inbound.recv().await
    }

    /// Take everything that arrived before this lease was granted.
    pub fn drain_stale(&mut self) -> Vec<LinkMessage> {
        // ---
        let mut stale = Vec::new();
        while let Ok(msg) = self.inbound.try_recv() {
            stale.push(msg);
        }
        stale
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
