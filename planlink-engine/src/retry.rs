//! Per-request retry and timeout supervision.
//!
//! A [`RetrySupervisor`] holds at most one outstanding request. Sessions arm
//! it with the message they just sent and the kind of response they expect,
//! then poll it on every tick. The supervisor decides whether to resend,
//! keep waiting, or give up; it never touches the link itself.

use std::time::Duration;

// ---

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---

use planlink_domain::{CollectionType, LinkMessage};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Timeout and attempt bound for ordinary request/response exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    // ---
    /// How long to wait for a response before resending.
    pub timeout_ms: u64,

    /// Total sends, including the first, before the request fails.
    pub max_attempts: u32,
}

// ---

impl Default for RetryPolicy {
    fn default() -> Self {
        // ---
        Self {
            timeout_ms: 1_500,
            max_attempts: 5,
        }
    }
}

// ---

impl RetryPolicy {
    // ---
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Expected
// ---------------------------------------------------------------------------

/// Response kind an outstanding request is waiting for.
///
/// A negative acknowledgement for the same collection, or a bootloader
/// error during flashing, always counts as a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    // ---
    ItemCount(CollectionType),

    /// Download in progress: items, or a count repeated by the vehicle.
    Item(CollectionType),

    /// Upload in progress: the vehicle asks for items or acknowledges.
    ItemRequest(CollectionType),

    /// Final acknowledgement; late item requests are still answered.
    Ack(CollectionType),

    BoardInfo,
    EraseDone,
    WriteAck(u32),
    ReadData(u32),
    CrcReport,
}

// ---

impl Expected {
    // ---
    pub fn matches(&self, msg: &LinkMessage) -> bool {
        // ---
        use LinkMessage as M;

        match *self {
            Self::ItemCount(k) => match msg {
                M::ItemCount { kind, .. } | M::Nack { kind, .. } => *kind == k,
                _ => false,
            },
            Self::Item(k) => match msg {
                M::Item { kind, .. } | M::ItemCount { kind, .. } | M::Nack { kind, .. } => *kind == k,
                _ => false,
            },
            Self::ItemRequest(k) | Self::Ack(k) => match msg {
                M::RequestItem { kind, .. } | M::Ack { kind } | M::Nack { kind, .. } => *kind == k,
                _ => false,
            },
            Self::BoardInfo => matches!(msg, M::BoardInfo { .. } | M::BootError { .. }),
            Self::EraseDone => matches!(msg, M::EraseDone | M::BootError { .. }),
            Self::WriteAck(a) => match msg {
                M::WriteAck { addr, .. } => *addr == a,
                M::BootError { .. } => true,
                _ => false,
            },
            Self::ReadData(a) => match msg {
                M::ReadData { addr, .. } => *addr == a,
                M::BootError { .. } => true,
                _ => false,
            },
            Self::CrcReport => matches!(msg, M::CrcReport { .. } | M::BootError { .. }),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    // ---
    /// Sends so far, starting at 1.
    pub attempt: u32,

    pub deadline: Instant,
}

// ---

/// Result of [`RetrySupervisor::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPoll {
    // ---
    /// Nothing armed.
    Idle,

    /// Deadline not reached yet.
    Waiting,

    /// Deadline passed; send this message again.
    Resend(LinkMessage),

    /// Attempt bound reached. The supervisor is disarmed.
    Exhausted { attempts: u32 },
}

// ---

#[derive(Debug)]
struct Outstanding {
    // ---
    message: LinkMessage,
    expected: Expected,
    timeout: Duration,
    max_attempts: u32,
    state: RetryState,
}

// ---------------------------------------------------------------------------
// RetrySupervisor
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RetrySupervisor {
    // ---
    policy: RetryPolicy,
    outstanding: Option<Outstanding>,

    /// Resends across the supervisor's lifetime.
    resends: u32,
}

// ---

impl RetrySupervisor {
    // ---
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            outstanding: None,
            resends: 0,
        }
    }

    // ---

    /// Start supervising `message` under the default policy. Returns the
    /// message so the caller can send it.
    pub fn arm(&mut self, message: LinkMessage, expected: Expected, now: Instant) -> LinkMessage {
        let (timeout, attempts) = (self.policy.timeout(), self.policy.max_attempts);
        self.arm_with(message, expected, timeout, attempts, now)
    }

    /// Start supervising `message` with a per-request timeout and bound.
    pub fn arm_with(
        &mut self,
        message: LinkMessage,
        expected: Expected,
        timeout: Duration,
        max_attempts: u32,
        now: Instant,
    ) -> LinkMessage {
        // ---
        self.outstanding = Some(Outstanding {
            message: message.clone(),
            expected,
            timeout,
            max_attempts: max_attempts.max(1),
            state: RetryState {
                attempt: 1,
                deadline: now + timeout,
            },
        });
        message
    }

    pub fn disarm(&mut self) {
        self.outstanding = None;
    }

    // ---

    /// True when `msg` answers the outstanding request.
    pub fn accepts(&self, msg: &LinkMessage) -> bool {
        self.outstanding
            .as_ref()
            .is_some_and(|o| o.expected.matches(msg))
    }

    pub fn state(&self) -> Option<RetryState> {
        self.outstanding.as_ref().map(|o| o.state)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().map(|o| o.state.deadline)
    }

    pub fn resends(&self) -> u32 {
        self.resends
    }

    // ---

    pub fn poll(&mut self, now: Instant) -> RetryPoll {
        // ---
        let Some(outstanding) = self.outstanding.as_mut() else {
            return RetryPoll::Idle;
        };

        if now < outstanding.state.deadline {
            return RetryPoll::Waiting;
        }

        if outstanding.state.attempt >= outstanding.max_attempts {
            let attempts = outstanding.state.attempt;
            self.outstanding = None;
            return RetryPoll::Exhausted { attempts };
        }

        outstanding.state.attempt += 1;
        outstanding.state.deadline = now + outstanding.timeout;
        self.resends += 1;
        RetryPoll::Resend(outstanding.message.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
