//! Firmware flashing through the vehicle's bootloader.
//!
//! [`FlashSession`] walks the bootloader through connect, erase, block
//! writes, block readback, a whole-image CRC check and reboot. Only the
//! connect and CRC requests are retried: a write or readback that goes
//! unanswered leaves flash in an unknown state, so it ends the session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ---

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;

// ---

use planlink_domain::{FlashPhase, FlashProgress, LinkMessage, PlanLinkError, Result};

// ---

use crate::events::PlanEvent;
use crate::retry::{Expected, RetryPoll, RetryPolicy, RetrySupervisor};
use crate::runner::{Effect, Exchange, SessionEvent};

// ---------------------------------------------------------------------------
// FlashPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashPolicy {
    // ---
    /// Bytes per `WriteBlock` / `ReadBlock`.
    pub block_size: u32,

    /// Full-chip erase can take tens of seconds.
    pub erase_timeout_ms: u64,

    /// Per write, read and CRC request.
    pub request_timeout_ms: u64,

    /// Connect attempts before giving up on the bootloader.
    pub connect_attempts: u32,
}

// ---

impl Default for FlashPolicy {
    fn default() -> Self {
        // ---
        Self {
            block_size: 252,
            erase_timeout_ms: 20_000,
            request_timeout_ms: 1_000,
            connect_attempts: 5,
        }
    }
}

// ---

impl FlashPolicy {
    // ---
    fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.erase_timeout_ms)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// FirmwareImage
// ---------------------------------------------------------------------------

/// Immutable firmware bytes plus the board they are built for.
#[derive(Clone)]
pub struct FirmwareImage {
    // ---
    board_id: u32,
    bytes: Arc<[u8]>,
}

// ---

impl FirmwareImage {
    // ---
    pub fn new(board_id: u32, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            board_id,
            bytes: bytes.into(),
        }
    }

    pub fn board_id(&self) -> u32 {
        self.board_id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    // ---

    /// SHA-256 of the image, hex encoded. Logged to identify the build.
    pub fn digest(&self) -> String {
        // ---
        Sha256::digest(&self.bytes)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// CRC-32 of the image padded with erased bytes (0xFF) to `flash_size`.
    pub fn padded_crc(&self, flash_size: u32) -> u32 {
        // ---
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.bytes);

        let erased = [0xFF_u8; 256];
        let mut remaining = (flash_size as usize).saturating_sub(self.bytes.len());
        while remaining > 0 {
            let n = remaining.min(erased.len());
            hasher.update(&erased[..n]);
            remaining -= n;
        }
        hasher.finalize()
    }
}

// ---

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("board_id", &self.board_id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FlashState / FlashReport / FlashError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FlashState {
    // ---
    Idle,
    Connecting,
    Erasing,
    Writing(u32),
    Verifying(u32),
    CheckingCrc,
    Rebooting,
    Done,
    Failed(String),
}

// ---

#[derive(Debug, Clone, PartialEq)]
pub struct FlashReport {
    // ---
    pub board_id: u32,
    pub flash_size: u32,
    pub bytes_written: u32,
    pub blocks: u32,
    pub crc: u32,
    pub digest: String,
}

// ---

#[derive(Debug, Error)]
#[error("flash failed ({}): {source}", describe_good(.last_good_address))]
pub struct FlashError {
    // ---
    /// Highest address known to hold the right byte. `None` before the
    /// first block was confirmed.
    pub last_good_address: Option<u32>,

    #[source]
    pub source: PlanLinkError,
}

fn describe_good(addr: &Option<u32>) -> String {
    match addr {
        Some(addr) => format!("good through 0x{addr:08X}"),
        None => "nothing confirmed".into(),
    }
}

// ---------------------------------------------------------------------------
// FlashSession
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FlashSession {
    // ---
    image: FirmwareImage,
    policy: FlashPolicy,
    crc_attempts: u32,
    state: FlashState,
    retry: RetrySupervisor,
    flash_size: u32,
    last_good_address: Option<u32>,
    crc: u32,
    error: Option<PlanLinkError>,
}

// ---

impl FlashSession {
    // ---
    pub fn new(image: FirmwareImage, policy: FlashPolicy, retry: RetryPolicy) -> Self {
        // ---
        Self {
            image,
            policy,
            crc_attempts: retry.max_attempts,
            state: FlashState::Idle,
            retry: RetrySupervisor::new(retry),
            flash_size: 0,
            last_good_address: None,
            crc: 0,
            error: None,
        }
    }

    pub fn state(&self) -> &FlashState {
        &self.state
    }

    pub fn last_good_address(&self) -> Option<u32> {
        self.last_good_address
    }

    // ---

    fn block_size(&self) -> u32 {
        self.policy.block_size.max(1)
    }

    fn block_count(&self) -> u32 {
        (self.image.len() as u32).div_ceil(self.block_size())
    }

    /// `(addr, bytes)` of block `index`.
    fn block(&self, index: u32) -> (u32, &[u8]) {
        // ---
        let addr = index * self.block_size();
        let start = addr as usize;
        let end = (start + self.block_size() as usize).min(self.image.len());
        (addr, &self.image.bytes()[start..end])
    }

    // ---

    fn write_block(&mut self, index: u32, now: Instant, out: &mut Vec<Effect>) {
        // ---
        let (addr, bytes) = self.block(index);
        let msg = LinkMessage::WriteBlock {
            addr,
            bytes: bytes.to_vec(),
        };
        let timeout = self.policy.request_timeout();
        out.push(Effect::Send(self.retry.arm_with(msg, Expected::WriteAck(addr), timeout, 1, now)));
        self.state = FlashState::Writing(index);
    }

    fn read_block(&mut self, index: u32, now: Instant, out: &mut Vec<Effect>) {
        // ---
        let (addr, bytes) = self.block(index);
        let msg = LinkMessage::ReadBlock {
            addr,
            len: bytes.len() as u32,
        };
        let timeout = self.policy.request_timeout();
        out.push(Effect::Send(self.retry.arm_with(msg, Expected::ReadData(addr), timeout, 1, now)));
        self.state = FlashState::Verifying(index);
    }

    fn check_crc(&mut self, now: Instant, out: &mut Vec<Effect>) {
        // ---
        let timeout = self.policy.request_timeout();
        let attempts = self.crc_attempts;
        out.push(Effect::Send(self.retry.arm_with(LinkMessage::GetCrc, Expected::CrcReport, timeout, attempts, now)));
        self.state = FlashState::CheckingCrc;
    }

    fn progress(&self, phase: FlashPhase, done: usize) -> Effect {
        Effect::Notify(PlanEvent::FlashProgress(FlashProgress {
            phase,
            bytes_done: done as u32,
            bytes_total: self.image.len() as u32,
        }))
    }

    // ---

    fn on_message(&mut self, msg: LinkMessage, now: Instant, out: &mut Vec<Effect>) {
        // ---
        if !self.retry.accepts(&msg) {
            out.push(Effect::Forward(msg));
            return;
        }

        match (self.state.clone(), msg) {
            (_, LinkMessage::BootError { detail }) => {
                self.fail(PlanLinkError::BootloaderRejected(detail));
            }

            (FlashState::Connecting, LinkMessage::BoardInfo { board_id, flash_size }) => {
                tracing::info!(board_id, flash_size, "bootloader connected");
                if board_id != self.image.board_id() {
                    self.fail(PlanLinkError::BoardMismatch {
                        expected: self.image.board_id(),
                        actual: board_id,
                    });
                    return;
                }
                if self.image.len() > flash_size as usize {
                    self.fail(PlanLinkError::ImageTooLarge {
                        image_len: self.image.len(),
                        flash_size,
                    });
                    return;
                }
                self.flash_size = flash_size;
                let timeout = self.policy.erase_timeout();
                out.push(Effect::Send(self.retry.arm_with(LinkMessage::Erase, Expected::EraseDone, timeout, 1, now)));
                out.push(self.progress(FlashPhase::Erase, 0));
                self.state = FlashState::Erasing;
            }

            (FlashState::Erasing, LinkMessage::EraseDone) => {
                tracing::info!("erase complete");
                out.push(self.progress(FlashPhase::Erase, self.image.len()));
                if self.block_count() == 0 {
                    self.check_crc(now, out);
                } else {
                    self.write_block(0, now, out);
                }
            }

            (FlashState::Writing(index), LinkMessage::WriteAck { addr, count }) => {
                let sent = self.block(index).1.len() as u32;
                if count != sent {
                    tracing::error!(addr, count, sent, "short write acknowledgement");
                    self.fail(PlanLinkError::IntegrityFailure {
                        address: addr,
                        detail: format!("bootloader acknowledged {count} of {sent} bytes"),
                    });
                    return;
                }
                self.last_good_address = Some(addr + sent - 1);
                out.push(self.progress(FlashPhase::Write, (addr + sent) as usize));

                if index + 1 < self.block_count() {
                    self.write_block(index + 1, now, out);
                } else {
                    self.read_block(0, now, out);
                }
            }

            (FlashState::Verifying(index), LinkMessage::ReadData { addr, bytes }) => {
                let expected = self.block(index).1;
                if let Some(offset) = expected.iter().zip(&bytes).position(|(e, a)| e != a) {
                    let address = addr + offset as u32;
                    let detail = format!("expected 0x{:02X}, read 0x{:02X}", expected[offset], bytes[offset]);
                    tracing::error!(addr = address, "readback mismatch: {detail}");
                    self.last_good_address = address.checked_sub(1);
                    self.fail(PlanLinkError::IntegrityFailure { address, detail });
                    return;
                }
                if bytes.len() != expected.len() {
                    let address = addr + bytes.len() as u32;
                    let detail = format!("read back {} of {} bytes", bytes.len(), expected.len());
                    self.last_good_address = address.checked_sub(1);
                    self.fail(PlanLinkError::IntegrityFailure { address, detail });
                    return;
                }
                out.push(self.progress(FlashPhase::Verify, addr as usize + bytes.len()));

                if index + 1 < self.block_count() {
                    self.read_block(index + 1, now, out);
                } else {
                    self.check_crc(now, out);
                }
            }

            (FlashState::CheckingCrc, LinkMessage::CrcReport { crc }) => {
                let expected = self.image.padded_crc(self.flash_size);
                if crc != expected {
                    // Every image byte was read back intact, so the
                    // difference lies in the erased tail.
                    self.fail(PlanLinkError::IntegrityFailure {
                        address: self.image.len() as u32,
                        detail: format!("image crc 0x{expected:08X}, bootloader reports 0x{crc:08X}"),
                    });
                    return;
                }
                self.crc = crc;
                self.retry.disarm();
                self.state = FlashState::Rebooting;
                tracing::info!("flash verified (crc 0x{crc:08X}), rebooting");

                // The bootloader resets without answering.
                out.push(Effect::Send(LinkMessage::Reboot));
                self.state = FlashState::Done;
            }

            (state, msg) => {
                tracing::debug!(?state, msg = msg.name(), "unexpected bootloader response");
                out.push(Effect::Forward(msg));
            }
        }
    }

    // ---

    fn on_tick(&mut self, now: Instant, out: &mut Vec<Effect>) {
        // ---
        match self.retry.poll(now) {
            RetryPoll::Resend(msg) => {
                tracing::info!(msg = msg.name(), "bootloader silent, resending");
                out.push(Effect::Send(msg));
            }
            RetryPoll::Exhausted { attempts } => {
                let what = match self.state {
                    FlashState::Connecting => "bootloader did not respond to connect".to_string(),
                    FlashState::Erasing => "bootloader did not finish erase".to_string(),
                    FlashState::Writing(i) => {
                        format!("bootloader did not acknowledge block at 0x{:08X}", self.block(i).0)
                    }
                    FlashState::Verifying(i) => {
                        format!("bootloader did not return block at 0x{:08X}", self.block(i).0)
                    }
                    _ => "bootloader did not report crc".to_string(),
                };
                self.fail(PlanLinkError::Timeout { what, attempts });
            }
            RetryPoll::Idle | RetryPoll::Waiting => {}
        }
    }

    fn fail(&mut self, err: PlanLinkError) {
        // ---
        tracing::warn!(state = ?self.state, "flash failed: {err}");
        self.retry.disarm();
        self.state = FlashState::Failed(err.to_string());
        self.error = Some(err);
    }
}

// ---

impl Exchange for FlashSession {
    // ---
    type Output = FlashReport;

    fn handle_event(&mut self, event: SessionEvent, now: Instant) -> Vec<Effect> {
        // ---
        let mut out = Vec::new();

        if self.is_terminal() {
            if let SessionEvent::Message(msg) = event {
                out.push(Effect::Forward(msg));
            }
            return out;
        }

        match event {
            SessionEvent::Start => {
                if self.state == FlashState::Idle {
                    tracing::info!(
                        board_id = self.image.board_id(),
                        len = self.image.len(),
                        sha256 = %self.image.digest(),
                        "flashing firmware"
                    );
                    let attempts = self.policy.connect_attempts;
                    let timeout = self.policy.request_timeout();
                    out.push(Effect::Send(self.retry.arm_with(LinkMessage::Connect, Expected::BoardInfo, timeout, attempts, now)));
                    self.state = FlashState::Connecting;
                }
            }
            SessionEvent::Message(msg) => self.on_message(msg, now, &mut out),
            SessionEvent::Tick => self.on_tick(now, &mut out),
            SessionEvent::Cancel => self.fail(PlanLinkError::Cancelled),
            SessionEvent::LinkLost => self.fail(PlanLinkError::LinkLost),
        }
        out
    }

    fn deadline(&self) -> Option<Instant> {
        self.retry.deadline()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, FlashState::Done | FlashState::Failed(_))
    }

    fn retries(&self) -> u32 {
        self.retry.resends()
    }

    fn finish(self) -> Result<FlashReport> {
        // ---
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(FlashReport {
            board_id: self.image.board_id(),
            flash_size: self.flash_size,
            bytes_written: self.image.len() as u32,
            blocks: self.block_count(),
            crc: self.crc,
            digest: self.image.digest(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::clock::{Clock, ManualClock};

    // ---

    fn session(image: Vec<u8>) -> FlashSession {
        let policy = FlashPolicy {
            block_size: 4,
            ..Default::default()
        };
        FlashSession::new(FirmwareImage::new(7, image), policy, RetryPolicy::default())
    }

    fn sends(effects: &[Effect]) -> Vec<LinkMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    fn reply(s: &mut FlashSession, clock: &ManualClock, msg: LinkMessage) -> Vec<LinkMessage> {
        sends(&s.handle_event(SessionEvent::Message(msg), clock.now()))
    }

    // ---

    #[test]
    fn padded_crc_matches_erased_flash() {
        // ---
        let image = FirmwareImage::new(1, vec![1, 2, 3]);
        let mut flash = vec![0xFF_u8; 600];
        flash[..3].copy_from_slice(&[1, 2, 3]);
        assert_eq!(image.padded_crc(600), crc32fast::hash(&flash));
        assert_eq!(image.digest().len(), 64);
    }

    // ---

    #[test]
    fn board_mismatch_is_fatal() {
        // ---
        let clock = ManualClock::new();
        let mut s = session(vec![0; 8]);
        s.handle_event(SessionEvent::Start, clock.now());

        let out = reply(&mut s, &clock, LinkMessage::BoardInfo { board_id: 8, flash_size: 64 });
        assert!(out.is_empty());
        assert!(matches!(
            s.finish(),
            Err(PlanLinkError::BoardMismatch { expected: 7, actual: 8 })
        ));
    }

    // ---

    #[test]
    fn oversized_image_is_fatal() {
        // ---
        let clock = ManualClock::new();
        let mut s = session(vec![0; 80]);
        s.handle_event(SessionEvent::Start, clock.now());
        reply(&mut s, &clock, LinkMessage::BoardInfo { board_id: 7, flash_size: 64 });
        assert!(matches!(s.finish(), Err(PlanLinkError::ImageTooLarge { .. })));
    }

    // ---

    #[test]
    fn short_write_ack_stops_at_that_block() {
        // ---
        let clock = ManualClock::new();
        let mut s = session(vec![0xAB; 8]);
        s.handle_event(SessionEvent::Start, clock.now());
        reply(&mut s, &clock, LinkMessage::BoardInfo { board_id: 7, flash_size: 64 });
        reply(&mut s, &clock, LinkMessage::EraseDone);

        let next = reply(&mut s, &clock, LinkMessage::WriteAck { addr: 0, count: 4 });
        assert_eq!(
            next,
            vec![LinkMessage::WriteBlock {
                addr: 4,
                bytes: vec![0xAB; 4]
            }]
        );

        let none = reply(&mut s, &clock, LinkMessage::WriteAck { addr: 4, count: 3 });
        assert!(none.is_empty());
        assert_eq!(s.last_good_address(), Some(3));
        assert!(matches!(
            s.finish(),
            Err(PlanLinkError::IntegrityFailure { address: 4, .. })
        ));
    }

    // ---

    #[test]
    fn readback_mismatch_names_the_byte() {
        // ---
        let clock = ManualClock::new();
        let mut s = session(vec![1, 2, 3, 4]);
        s.handle_event(SessionEvent::Start, clock.now());
        reply(&mut s, &clock, LinkMessage::BoardInfo { board_id: 7, flash_size: 64 });
        reply(&mut s, &clock, LinkMessage::EraseDone);
        let read = reply(&mut s, &clock, LinkMessage::WriteAck { addr: 0, count: 4 });
        assert_eq!(read, vec![LinkMessage::ReadBlock { addr: 0, len: 4 }]);

        reply(
            &mut s,
            &clock,
            LinkMessage::ReadData {
                addr: 0,
                bytes: vec![1, 2, 9, 4],
            },
        );
        match s.finish() {
            Err(PlanLinkError::IntegrityFailure { address, detail }) => {
                assert_eq!(address, 2);
                assert_eq!(detail, "expected 0x03, read 0x09");
            }
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    // ---

    #[test]
    fn write_timeout_is_not_retried() {
        // ---
        let clock = ManualClock::new();
        let mut s = session(vec![0; 8]);
        s.handle_event(SessionEvent::Start, clock.now());
        reply(&mut s, &clock, LinkMessage::BoardInfo { board_id: 7, flash_size: 64 });
        reply(&mut s, &clock, LinkMessage::EraseDone);

        clock.advance(Duration::from_millis(1_000));
        let out = s.handle_event(SessionEvent::Tick, clock.now());
        assert!(sends(&out).is_empty());
        assert!(matches!(s.finish(), Err(PlanLinkError::Timeout { attempts: 1, .. })));
    }

    // ---

    #[test]
    fn crc_mismatch_fails_after_verified_readback() {
        // ---
        let clock = ManualClock::new();
        let image = vec![5_u8; 4];
        let mut s = session(image.clone());
        s.handle_event(SessionEvent::Start, clock.now());
        reply(&mut s, &clock, LinkMessage::BoardInfo { board_id: 7, flash_size: 16 });
        reply(&mut s, &clock, LinkMessage::EraseDone);
        reply(&mut s, &clock, LinkMessage::WriteAck { addr: 0, count: 4 });
        reply(&mut s, &clock, LinkMessage::ReadData { addr: 0, bytes: vec![5; 4] });

        let good = FirmwareImage::new(7, image).padded_crc(16);
        let out = reply(&mut s, &clock, LinkMessage::CrcReport { crc: good ^ 1 });
        assert!(out.is_empty(), "no reboot after a crc mismatch");
        assert_eq!(s.last_good_address(), Some(3));
        match s.finish() {
            Err(PlanLinkError::IntegrityFailure { address, detail }) => {
                assert_eq!(address, 4);
                assert!(detail.contains(&format!("0x{good:08X}")), "{detail}");
            }
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    // ---

    #[test]
    fn erase_waits_for_its_own_timeout_then_fails() {
        // ---
        let clock = ManualClock::new();
        let mut s = session(vec![0; 8]);
        s.handle_event(SessionEvent::Start, clock.now());
        reply(&mut s, &clock, LinkMessage::BoardInfo { board_id: 7, flash_size: 64 });

        clock.advance(Duration::from_millis(1_000));
        s.handle_event(SessionEvent::Tick, clock.now());
        assert_eq!(s.state(), &FlashState::Erasing);

        clock.advance(Duration::from_millis(19_000));
        let out = s.handle_event(SessionEvent::Tick, clock.now());
        assert!(sends(&out).is_empty(), "erase is never re-sent");
        match s.finish() {
            Err(PlanLinkError::Timeout { what, attempts: 1 }) => {
                assert_eq!(what, "bootloader did not finish erase");
            }
            other => panic!("expected erase timeout, got {other:?}"),
        }
    }

    // ---

    #[test]
    fn complete_flash_reboots() {
        // ---
        let clock = ManualClock::new();
        let image = vec![5_u8; 6];
        let mut s = session(image.clone());
        s.handle_event(SessionEvent::Start, clock.now());
        reply(&mut s, &clock, LinkMessage::BoardInfo { board_id: 7, flash_size: 16 });
        reply(&mut s, &clock, LinkMessage::EraseDone);
        reply(&mut s, &clock, LinkMessage::WriteAck { addr: 0, count: 4 });
        reply(&mut s, &clock, LinkMessage::WriteAck { addr: 4, count: 2 });
        reply(&mut s, &clock, LinkMessage::ReadData { addr: 0, bytes: vec![5; 4] });
        let crc_req = reply(&mut s, &clock, LinkMessage::ReadData { addr: 4, bytes: vec![5; 2] });
        assert_eq!(crc_req, vec![LinkMessage::GetCrc]);

        let crc = FirmwareImage::new(7, image).padded_crc(16);
        let last = reply(&mut s, &clock, LinkMessage::CrcReport { crc });
        assert_eq!(last, vec![LinkMessage::Reboot]);

        let report = s.finish().unwrap();
        assert_eq!(report.blocks, 2);
        assert_eq!(report.crc, crc);
    }
}
