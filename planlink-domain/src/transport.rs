use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---

use super::error::Result;
use super::message::LinkMessage;

// ---------------------------------------------------------------------------
// LinkId
// ---------------------------------------------------------------------------

/// Identity of one of the redundant links to the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LinkId {
    Primary,
    Secondary,
}

// ---------------------------------------------------------------------------
// LinkState
// ---------------------------------------------------------------------------

/// Observable health of a single link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    // ---
    /// Traffic arriving within the expected window.
    Healthy,

    /// Traffic has paused longer than usual but the link is not yet lost.
    Degraded,

    /// No traffic for the full loss window, or not yet recovered from it.
    Lost,
}

// ---------------------------------------------------------------------------
// LinkStatus
// ---------------------------------------------------------------------------

/// Snapshot published to sessions: which link is active and how it is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    // ---
    pub active: LinkId,
    pub state: LinkState,
}

// ---

impl LinkStatus {
    // ---
    pub fn healthy(active: LinkId) -> Self {
        Self {
            active,
            state: LinkState::Healthy,
        }
    }

    /// True when a session bound to `link` may keep exchanging messages.
    pub fn permits(&self, link: LinkId) -> bool {
        self.active == link && self.state != LinkState::Lost
    }
}

// ---------------------------------------------------------------------------
// LinkChannel
// ---------------------------------------------------------------------------

/// Bidirectional, message-delimited, unreliable channel to one peer.
///
/// Implementations may silently drop, duplicate or delay messages; the
/// protocol layers above are responsible for recovery.
#[async_trait]
pub trait LinkChannel: Send + Sync {
    // ---
    /// Queue one message for transmission. A successful return says nothing
    /// about delivery.
    async fn send(&self, msg: &LinkMessage) -> Result<()>;

    /// Wait for the next inbound message.
    ///
    /// Returns [`PlanLinkError::Framing`] for a packet that arrived but failed
    /// to decode, and [`PlanLinkError::ChannelClosed`] once the channel is gone.
    ///
    /// [`PlanLinkError::Framing`]: super::error::PlanLinkError::Framing
    /// [`PlanLinkError::ChannelClosed`]: super::error::PlanLinkError::ChannelClosed
    async fn recv(&self) -> Result<LinkMessage>;
}

// ---

/// Convenience type alias for a shared [`LinkChannel`].
pub type LinkChannelPtr = Arc<dyn LinkChannel>;
