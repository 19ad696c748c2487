// ---------------------------------------------------------------------------
// LinkSimConfig
// ---------------------------------------------------------------------------

/// Impairments injected by a simulated link. Probabilities are per message
/// and per direction; the default is a perfect link.
#[derive(Debug, Clone, Default)]
pub struct LinkSimConfig {
    // ---
    /// Chance a message never arrives.
    pub drop_percent: f64,

    /// Chance a message arrives twice, back to back.
    pub dup_percent: f64,

    /// Chance a message arrives with a damaged header and fails to decode,
    /// as a frame with a bad checksum would on a real radio.
    pub corrupt_percent: f64,

    /// Seed for reproducible impairment sequences. `None` = entropy.
    pub seed: Option<u64>,
}

// ---

impl LinkSimConfig {
    // ---
    pub fn perfect() -> Self {
        Self::default()
    }

    /// Telemetry radio near the edge of its range.
    pub fn lossy_radio(seed: u64) -> Self {
        // ---
        Self {
            drop_percent: 0.10,
            dup_percent: 0.02,
            corrupt_percent: 0.0,
            seed: Some(seed),
        }
    }

    /// Long serial cable with electrical noise: nothing is lost outright,
    /// but some frames arrive damaged.
    pub fn noisy_serial(seed: u64) -> Self {
        // ---
        Self {
            drop_percent: 0.0,
            dup_percent: 0.0,
            corrupt_percent: 0.05,
            seed: Some(seed),
        }
    }
}
