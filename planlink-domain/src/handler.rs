use async_trait::async_trait;

// ---

use super::collection::CollectionType;
use super::transport::LinkStatus;

// ---------------------------------------------------------------------------
// TransferProgress
// ---------------------------------------------------------------------------

/// Progress snapshot for the collection currently being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    // ---
    pub kind: CollectionType,

    pub items_done: u32,

    pub items_total: u32,
}

// ---

impl TransferProgress {
    // ---
    /// `0.0 ..= 100.0`; an empty collection counts as complete.
    pub fn percent_done(&self) -> f64 {
        // ---
        if self.items_total == 0 {
            return 100.0;
        }
        f64::from(self.items_done) * 100.0 / f64::from(self.items_total)
    }
}

// ---------------------------------------------------------------------------
// FlashProgress
// ---------------------------------------------------------------------------

/// Which pass of a flash operation a progress report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    Erase,
    Write,
    Verify,
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashProgress {
    // ---
    pub phase: FlashPhase,

    pub bytes_done: u32,

    pub bytes_total: u32,
}

// ---------------------------------------------------------------------------
// PlanHandler
// ---------------------------------------------------------------------------

/// Application callback interface.
///
/// Implement this to receive progress and completion events from the plan
/// engine. All methods have default no-op implementations; implementors
/// only override what they need.
#[async_trait]
pub trait PlanHandler: Send + Sync {
    // ---
    /// Called as each item of a collection is transferred.
    async fn on_progress(&self, progress: TransferProgress) {
        let _ = progress;
    }

    // ---

    /// Called once per user-level operation with the aggregated outcome.
    ///
    /// `errors` is empty on success and otherwise names the failing
    /// collection and reason.
    async fn on_result(&self, success: bool, errors: Vec<String>) {
        let _ = (success, errors);
    }

    // ---

    /// Called per block during firmware flashing.
    async fn on_flash_progress(&self, progress: FlashProgress) {
        let _ = progress;
    }

    // ---

    /// Called on every link health transition and failover.
    async fn on_link_status_update(&self, status: LinkStatus) {
        let _ = status;
    }
}
