use serde::{Deserialize, Serialize};

// ---

use super::collection::CollectionType;
use super::item::MissionItem;

// ---------------------------------------------------------------------------
// NackCode
// ---------------------------------------------------------------------------

/// Reason carried by a negative acknowledgement.
///
/// Mirrors the non-accepted MAV_MISSION_RESULT values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackCode {
    Error,
    UnsupportedFrame,
    Unsupported,
    NoSpace,
    Invalid,
    /// Parameter 1..=7 holds an invalid value.
    InvalidParam(u8),
    InvalidSequence,
    Denied,
    OperationCancelled,
}

// ---

impl NackCode {
    // ---
    /// Operator-facing explanation.
    pub fn describe(&self) -> String {
        // ---
        match self {
            Self::Error => "generic error".into(),
            Self::UnsupportedFrame => "coordinate frame is not supported".into(),
            Self::Unsupported => "command is not supported".into(),
            Self::NoSpace => "not enough storage on vehicle for all items".into(),
            Self::Invalid => "one of the parameters has an invalid value".into(),
            Self::InvalidParam(n) => format!("parameter {n} has an invalid value"),
            Self::InvalidSequence => "item received out of sequence".into(),
            Self::Denied => "vehicle is not accepting items".into(),
            Self::OperationCancelled => "operation was cancelled".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// LinkMessage
// ---------------------------------------------------------------------------

/// Every message exchanged over a link, for both the item transfer protocol
/// and the bootloader.
///
/// Closed set: a peer sending anything else fails to decode at the framing
/// layer instead of surfacing as an unknown command at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LinkMessage {
    // ---
    /// Periodic liveness beacon. Consumed by link health tracking.
    Heartbeat,

    // --- item transfer ------------------------------------------------------
    RequestList { kind: CollectionType },
    ItemCount { kind: CollectionType, count: u16 },
    RequestItem { kind: CollectionType, seq: u16 },
    Item { kind: CollectionType, item: MissionItem },
    Ack { kind: CollectionType },
    Nack { kind: CollectionType, code: NackCode },
    ClearAll { kind: CollectionType },

    // --- bootloader ---------------------------------------------------------
    Connect,
    BoardInfo { board_id: u32, flash_size: u32 },
    Erase,
    EraseDone,
    WriteBlock { addr: u32, bytes: Vec<u8> },
    WriteAck { addr: u32, count: u32 },
    ReadBlock { addr: u32, len: u32 },
    ReadData { addr: u32, bytes: Vec<u8> },
    GetCrc,
    CrcReport { crc: u32 },
    BootError { detail: String },
    Reboot,
}

// ---

impl LinkMessage {
    // ---
    /// Collection an item-transfer message belongs to, if any.
    pub fn collection(&self) -> Option<CollectionType> {
        // ---
        match self {
            Self::RequestList { kind }
            | Self::ItemCount { kind, .. }
            | Self::RequestItem { kind, .. }
            | Self::Item { kind, .. }
            | Self::Ack { kind }
            | Self::Nack { kind, .. }
            | Self::ClearAll { kind } => Some(*kind),
            _ => None,
        }
    }

    // ---

    /// True for messages spoken by the bootloader protocol.
    pub fn is_bootloader(&self) -> bool {
        matches!(
            self,
            Self::Connect
                | Self::BoardInfo { .. }
                | Self::Erase
                | Self::EraseDone
                | Self::WriteBlock { .. }
                | Self::WriteAck { .. }
                | Self::ReadBlock { .. }
                | Self::ReadData { .. }
                | Self::GetCrc
                | Self::CrcReport { .. }
                | Self::BootError { .. }
                | Self::Reboot
        )
    }

    /// Short name for log lines; payload bytes are never logged.
    pub fn name(&self) -> &'static str {
        // ---
        match self {
            Self::Heartbeat => "Heartbeat",
            Self::RequestList { .. } => "RequestList",
            Self::ItemCount { .. } => "ItemCount",
            Self::RequestItem { .. } => "RequestItem",
            Self::Item { .. } => "Item",
            Self::Ack { .. } => "Ack",
            Self::Nack { .. } => "Nack",
            Self::ClearAll { .. } => "ClearAll",
            Self::Connect => "Connect",
            Self::BoardInfo { .. } => "BoardInfo",
            Self::Erase => "Erase",
            Self::EraseDone => "EraseDone",
            Self::WriteBlock { .. } => "WriteBlock",
            Self::WriteAck { .. } => "WriteAck",
            Self::ReadBlock { .. } => "ReadBlock",
            Self::ReadData { .. } => "ReadData",
            Self::GetCrc => "GetCrc",
            Self::CrcReport { .. } => "CrcReport",
            Self::BootError { .. } => "BootError",
            Self::Reboot => "Reboot",
        }
    }
}
