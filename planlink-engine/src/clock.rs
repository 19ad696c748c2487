//! Time sources: [`TokioClock`] for the running engine, [`ManualClock`] for
//! stepping the state machines by hand in tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---

use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for the protocol state machines.
///
/// Sessions never read the time themselves; every event carries `now`. The
/// runner reads it from a `Clock`, and tests substitute a [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

// ---

pub type ClockPtr = Arc<dyn Clock>;

// ---------------------------------------------------------------------------
// TokioClock
// ---------------------------------------------------------------------------

/// Production clock. Follows tokio's paused time under `test-util`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    // ---
    now: Mutex<Instant>,
}

// ---

impl ManualClock {
    // ---
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

// ---

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

// ---

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}
