use thiserror::Error;

// ---

use super::collection::CollectionType;
use super::message::NackCode;
use super::transport::LinkId;

// ---

#[derive(Debug, Error)]
pub enum PlanLinkError {
    // ---
    /// Bounded retries were exhausted without a response.
    #[error("{what} (no response after {attempts} attempts)")]
    Timeout { what: String, attempts: u32 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("vehicle rejected {kind} transfer: {}", code.describe())]
    PeerRejected { kind: CollectionType, code: NackCode },

    #[error("bootloader rejected request: {0}")]
    BootloaderRejected(String),

    #[error("communication link lost")]
    LinkLost,

    #[error("integrity failure at 0x{address:08X}: {detail}")]
    IntegrityFailure { address: u32, detail: String },

    #[error("firmware targets board id {expected}, bootloader reports {actual}")]
    BoardMismatch { expected: u32, actual: u32 },

    #[error("firmware image is {image_len} bytes, board flash holds {flash_size}")]
    ImageTooLarge { image_len: usize, flash_size: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0:?} link is busy with another exchange")]
    LinkBusy(LinkId),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("link channel closed")]
    ChannelClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

impl PlanLinkError {
    // ---
    /// True when the link itself is gone rather than the peer misbehaving;
    /// only these failures let a transfer move to another link.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Self::LinkLost | Self::ChannelClosed)
    }
}

// ---

pub type Result<T> = std::result::Result<T, PlanLinkError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
