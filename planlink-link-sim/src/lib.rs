//! In-process simulated link and vehicle for PlanLink testing and demos.
//!
//! [`LinkSimTransport`] produces connected [`LinkSimChannel`] pairs that
//! implement [`planlink_domain::LinkChannel`] over tokio channels.
//! [`LinkSimConfig`] controls injected impairments:
//!
//! - Message drop probability
//! - Message duplication probability
//! - Deterministic RNG seed for reproducible runs
//!
//! A [`LinkSwitch`] takes the link dark on demand. [`SimVehicle`] plays the
//! onboard side: a mission server for all three collections and an optional
//! bootloader, each with fault modes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use planlink_link_sim::{LinkSimConfig, LinkSimTransport, SimVehicle, SimVehicleConfig};
//!
//! # async fn demo() {
//! let (ground, vehicle) = LinkSimTransport::new(LinkSimConfig::lossy_radio(7)).connected_pair();
//! let onboard = SimVehicle::new(SimVehicleConfig::default()).spawn(vehicle);
//! # let _ = (ground, onboard);
//! # }
//! ```

mod channel;
mod config;
mod transport;
mod vehicle;

// --- public API
pub use channel::{LinkSimChannel, LinkSwitch};
pub use config::LinkSimConfig;
pub use transport::LinkSimTransport;
pub use vehicle::{
    // ---
    BootFault,
    BootloaderConfig,
    MissionFault,
    SimVehicle,
    SimVehicleConfig,
    SimVehicleHandle,
    VehicleStats,
};
