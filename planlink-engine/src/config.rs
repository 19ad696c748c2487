//! Engine configuration.
//!
//! Every timeout and retry bound the engine uses lives here. Loadable from
//! TOML; any field left out takes its default:
//!
//! ```toml
//! final_ack_timeout_ms = 5000
//! auto_restart_on_failover = true
//!
//! [retry]
//! timeout_ms = 1500
//! max_attempts = 5
//!
//! [health]
//! lost_after_ms = 8000
//!
//! [flash]
//! block_size = 128
//! ```

use std::path::Path;
use std::time::Duration;

// ---

use serde::{Deserialize, Serialize};

// ---

use planlink_domain::{PlanLinkError, Result};

// ---

use crate::flash::FlashPolicy;
use crate::health::HealthPolicy;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // ---
    pub retry: RetryPolicy,

    /// Wait for the vehicle's acknowledgement after the last uploaded item.
    pub final_ack_timeout_ms: u64,

    pub health: HealthPolicy,

    pub flash: FlashPolicy,

    /// Restart a sub-transfer once on the new active link after failover.
    pub auto_restart_on_failover: bool,
}

// ---

impl Default for EngineConfig {
    fn default() -> Self {
        // ---
        Self {
            retry: RetryPolicy::default(),
            final_ack_timeout_ms: 5_000,
            health: HealthPolicy::default(),
            flash: FlashPolicy::default(),
            auto_restart_on_failover: false,
        }
    }
}

// ---

impl EngineConfig {
    // ---
    pub fn final_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.final_ack_timeout_ms)
    }

    // ---

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PlanLinkError::Schema(format!("engine config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        // ---
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "engine config loaded");
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
