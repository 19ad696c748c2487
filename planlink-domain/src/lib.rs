//! Core types, link messages and wire framing for the PlanLink transfer
//! protocol.
//!
//! This crate defines the vocabulary of the system. The engine and the link
//! simulator both depend on `planlink-domain` and speak its types. No
//! protocol logic lives here.
//!
//! # Structure
//!
//! - [`error`]      — [`PlanLinkError`] and [`Result<T>`] alias
//! - [`item`]       — mission, fence and rally items
//! - [`collection`] — [`Collection`] and fence/rally wire encoding
//! - [`plan`]       — [`Plan`], the ground-side view of all three collections
//! - [`message`]    — [`LinkMessage`], the closed message set
//! - [`framing`]    — frame encode/decode
//! - [`transport`]  — [`LinkChannel`] trait, [`LinkId`], [`LinkState`]
//! - [`handler`]    — [`PlanHandler`] callback trait

mod collection;
mod error;
mod framing;
mod handler;
mod item;
mod message;
mod plan;
mod transport;

// --- error
pub use error::{PlanLinkError, Result};

// --- item
pub use item::{
    // ---
    cmd,
    ComplexItem,
    Coordinate,
    FenceCircle,
    FencePolygon,
    GeoFence,
    MavFrame,
    MissionItem,
    PlanItem,
    RallyPoint,
    ITEM_SCHEMA_VERSION,
};

// --- collection
pub use collection::{
    // ---
    fence_from_collection,
    fence_to_collection,
    rally_from_collection,
    rally_to_collection,
    Collection,
    CollectionType,
};

// --- plan
pub use plan::Plan;

// --- message
pub use message::{LinkMessage, NackCode};

// --- framing
pub use framing::{decode_frame, encode_frame, read_frame, write_frame};

// --- transport
pub use transport::{
    // ---
    LinkChannel,
    LinkChannelPtr,
    LinkId,
    LinkState,
    LinkStatus,
};

// --- handler
pub use handler::{
    // ---
    FlashPhase,
    FlashProgress,
    PlanHandler,
    TransferProgress,
};
