//! Simulated vehicle: an onboard mission server plus an optional bootloader.
//!
//! [`SimVehicle`] answers the item transfer protocol for all three
//! collections and, when configured with a [`BootloaderConfig`], the
//! firmware flashing protocol. Fault modes reproduce the ways real
//! autopilots misbehave so the ground-side engine can be exercised against
//! each recovery path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ---

use tokio::task::JoinHandle;

// ---

use planlink_domain::{CollectionType, LinkChannel, LinkMessage, MissionItem, NackCode, PlanLinkError};

// ---

use super::LinkSimChannel;

// ---------------------------------------------------------------------------
// Fault modes
// ---------------------------------------------------------------------------

/// Misbehaviour injected into the mission server.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionFault {
    // ---
    /// Respond correctly.
    None,

    /// Ignore every item transfer message.
    NoResponse,

    /// Ignore the first request for this item; answer later requests.
    DropItemOnce(u16),

    /// Answer item requests below this sequence number, then go silent.
    StopAfterItems(u16),

    /// Negatively acknowledge every request with this code.
    NakAll(NackCode),

    /// Answer the first request for this item with the previous item.
    StaleItemOnce(u16),

    /// While receiving an upload, request an item past the announced count
    /// after the first item arrives.
    RequestOutOfRange,

    /// Store uploads but never send the final acknowledgement.
    NoFinalAck,

    /// Repeat the item count after serving item 1 of a download.
    ResendCount,
}

// ---

/// Misbehaviour injected into the bootloader.
#[derive(Debug, Clone, PartialEq)]
pub enum BootFault {
    // ---
    None,

    /// Acknowledge the block at this address one byte short.
    ShortWriteAck(u32),

    /// Flip the byte at this address when it is read back.
    CorruptReadback(u32),

    /// Report a wrong whole-image CRC.
    BadCrc,

    /// Start the erase but never report it finished.
    EraseHangs,

    /// Stop answering once the erase completes.
    SilentAfterErase,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BootloaderConfig {
    // ---
    pub board_id: u32,
    pub flash_size: u32,
    pub fault: BootFault,
}

// ---

#[derive(Debug, Clone)]
pub struct SimVehicleConfig {
    // ---
    pub mission_fault: MissionFault,

    /// `None` = no bootloader on this link.
    pub bootloader: Option<BootloaderConfig>,

    /// Emit a heartbeat at this period. `None` = never.
    pub heartbeat: Option<Duration>,
}

// ---

impl Default for SimVehicleConfig {
    fn default() -> Self {
        // ---
        Self {
            mission_fault: MissionFault::None,
            bootloader: None,
            heartbeat: None,
        }
    }
}

// ---------------------------------------------------------------------------
// VehicleStats
// ---------------------------------------------------------------------------

/// Counters exposed to tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleStats {
    // ---
    pub list_requests: u32,
    pub item_requests: u32,
    pub items_received: u32,
    pub acks_received: u32,
    pub write_blocks: u32,
    pub read_blocks: u32,
    pub rebooted: bool,
}

// ---------------------------------------------------------------------------
// VehicleState
// ---------------------------------------------------------------------------

/// Onboard storage shared between the vehicle task and its handle.
#[derive(Debug, Default)]
struct VehicleState {
    // ---
    collections: HashMap<CollectionType, Vec<MissionItem>>,
    flash: Vec<u8>,
    stats: VehicleStats,
}

// ---

/// Upload currently being received from the ground station.
#[derive(Debug)]
struct InboundUpload {
    // ---
    kind: CollectionType,
    count: u16,
    items: Vec<MissionItem>,
}

// ---------------------------------------------------------------------------
// SimVehicle
// ---------------------------------------------------------------------------

pub struct SimVehicle {
    // ---
    config: SimVehicleConfig,
    state: Arc<Mutex<VehicleState>>,
    upload: Option<InboundUpload>,

    /// Last completed upload `(kind, count)`, for re-acking a repeated last item.
    committed: Option<(CollectionType, u16)>,

    /// Items whose one-shot fault has already fired.
    faults_fired: HashSet<u16>,
    out_of_range_sent: bool,
    boot_silent: bool,
}

// ---

impl SimVehicle {
    // ---
    pub fn new(config: SimVehicleConfig) -> Self {
        // ---
        let flash_size = config
            .bootloader
            .as_ref()
            .map(|b| b.flash_size as usize)
            .unwrap_or(0);

        let state = VehicleState {
            flash: vec![0xFF; flash_size],
            ..Default::default()
        };

        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            upload: None,
            committed: None,
            faults_fired: HashSet::new(),
            out_of_range_sent: false,
            boot_silent: false,
        }
    }

    // ---

    /// Preload onboard storage for `kind`, renumbering `seq` from zero.
    pub fn with_collection(self, kind: CollectionType, mut items: Vec<MissionItem>) -> Self {
        // ---
        for (index, item) in items.iter_mut().enumerate() {
            item.seq = index as u16;
        }
        lock(&self.state).collections.insert(kind, items);
        self
    }

    // ---

    /// Run the vehicle on `channel` until the channel closes.
    pub fn spawn(mut self, channel: LinkSimChannel) -> SimVehicleHandle {
        // ---
        let state = self.state.clone();
        let heartbeat = self.config.heartbeat;

        let task = tokio::spawn(async move {
            // ---
            let mut ticker = heartbeat.map(tokio::time::interval);

            loop {
                let msg = tokio::select! {
                    msg = channel.recv() => msg,
                    _ = tick(&mut ticker) => {
                        if channel.send(&LinkMessage::Heartbeat).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let msg = match msg {
                    Ok(msg) => msg,
                    Err(PlanLinkError::ChannelClosed) => break,
                    Err(e) => {
                        tracing::debug!("sim-vehicle: discarding bad packet: {e}");
                        continue;
                    }
                };

                for reply in self.handle(msg) {
                    if channel.send(&reply).await.is_err() {
                        tracing::debug!("sim-vehicle: channel closed while replying");
                        return;
                    }
                }
            }

            tracing::debug!("sim-vehicle: link closed, exiting");
        });

        SimVehicleHandle { state, task }
    }

    // ---

    /// Process one inbound message and return the replies to send.
    pub fn handle(&mut self, msg: LinkMessage) -> Vec<LinkMessage> {
        // ---
        if msg.is_bootloader() {
            return self.handle_bootloader(msg);
        }

        if msg.collection().is_none() {
            return Vec::new();
        }

        match self.config.mission_fault.clone() {
            MissionFault::NoResponse => return Vec::new(),
            MissionFault::NakAll(code) => {
                return match msg {
                    LinkMessage::Ack { .. } | LinkMessage::Nack { .. } => Vec::new(),
                    other => other
                        .collection()
                        .map(|kind| LinkMessage::Nack { kind, code })
                        .into_iter()
                        .collect(),
                };
            }
            _ => {}
        }

        match msg {
            LinkMessage::RequestList { kind } => {
                lock(&self.state).stats.list_requests += 1;
                let count = self.stored_len(kind);
                vec![LinkMessage::ItemCount { kind, count }]
            }

            LinkMessage::RequestItem { kind, seq } => self.serve_item(kind, seq),

            LinkMessage::ItemCount { kind, count } => self.begin_upload(kind, count),

            LinkMessage::Item { kind, item } => self.receive_item(kind, item),

            LinkMessage::Ack { kind } => {
                tracing::debug!(%kind, "sim-vehicle: ground acknowledged download");
                lock(&self.state).stats.acks_received += 1;
                Vec::new()
            }

            LinkMessage::Nack { kind, code } => {
                tracing::debug!(%kind, ?code, "sim-vehicle: ground aborted transfer");
                if self.upload.as_ref().is_some_and(|u| u.kind == kind) {
                    self.upload = None;
                }
                Vec::new()
            }

            LinkMessage::ClearAll { kind } => {
                lock(&self.state).collections.remove(&kind);
                vec![LinkMessage::Ack { kind }]
            }

            _ => Vec::new(),
        }
    }

    // ---

    fn stored_len(&self, kind: CollectionType) -> u16 {
        lock(&self.state)
            .collections
            .get(&kind)
            .map(|items| items.len() as u16)
            .unwrap_or(0)
    }

    // ---

    fn serve_item(&mut self, kind: CollectionType, seq: u16) -> Vec<LinkMessage> {
        // ---
        let stored = {
            let mut state = lock(&self.state);
            state.stats.item_requests += 1;
            state
                .collections
                .get(&kind)
                .cloned()
                .unwrap_or_default()
        };

        if usize::from(seq) >= stored.len() {
            return vec![LinkMessage::Nack {
                kind,
                code: NackCode::InvalidSequence,
            }];
        }

        match self.config.mission_fault {
            MissionFault::DropItemOnce(target) if target == seq => {
                if self.faults_fired.insert(seq) {
                    tracing::debug!(seq, "sim-vehicle: dropping item request");
                    return Vec::new();
                }
            }
            MissionFault::StopAfterItems(limit) if seq >= limit => return Vec::new(),
            MissionFault::StaleItemOnce(target) if target == seq && seq > 0 => {
                if self.faults_fired.insert(seq) {
                    let stale = stored[usize::from(seq) - 1].clone();
                    return vec![LinkMessage::Item { kind, item: stale }];
                }
            }
            _ => {}
        }

        let mut replies = vec![LinkMessage::Item {
            kind,
            item: stored[usize::from(seq)].clone(),
        }];

        if self.config.mission_fault == MissionFault::ResendCount && seq == 1 {
            replies.push(LinkMessage::ItemCount {
                kind,
                count: stored.len() as u16,
            });
        }

        replies
    }

    // ---

    fn begin_upload(&mut self, kind: CollectionType, count: u16) -> Vec<LinkMessage> {
        // ---
        if let Some(upload) = self.upload.as_ref() {
            if upload.kind == kind && !upload.items.is_empty() {
                // Count repeated mid-upload: keep going from where we are.
                return vec![LinkMessage::RequestItem {
                    kind,
                    seq: upload.items.len() as u16,
                }];
            }
        }

        if count == 0 {
            self.upload = None;
            return self.commit(kind, Vec::new());
        }

        self.upload = Some(InboundUpload {
            kind,
            count,
            items: Vec::with_capacity(usize::from(count)),
        });
        vec![LinkMessage::RequestItem { kind, seq: 0 }]
    }

    // ---

    fn receive_item(&mut self, kind: CollectionType, item: MissionItem) -> Vec<LinkMessage> {
        // ---
        let Some(upload) = self.upload.as_mut().filter(|u| u.kind == kind) else {
            // Last item repeated after completion: the ack was lost.
            return match self.committed {
                Some((k, count)) if k == kind && item.seq + 1 == count => self.final_ack(kind),
                _ => Vec::new(),
            };
        };

        let next = upload.items.len() as u16;
        if item.seq != next {
            return vec![LinkMessage::RequestItem { kind, seq: next }];
        }

        upload.items.push(item);
        lock(&self.state).stats.items_received += 1;

        if self.config.mission_fault == MissionFault::RequestOutOfRange && !self.out_of_range_sent {
            self.out_of_range_sent = true;
            return vec![LinkMessage::RequestItem {
                kind,
                seq: upload.count,
            }];
        }

        if upload.items.len() == usize::from(upload.count) {
            let done = self.upload.take().map(|u| u.items).unwrap_or_default();
            return self.commit(kind, done);
        }

        vec![LinkMessage::RequestItem {
            kind,
            seq: next + 1,
        }]
    }

    // ---

    fn commit(&mut self, kind: CollectionType, items: Vec<MissionItem>) -> Vec<LinkMessage> {
        // ---
        let count = items.len() as u16;
        lock(&self.state).collections.insert(kind, items);
        self.committed = Some((kind, count));
        tracing::debug!(%kind, count, "sim-vehicle: upload stored");
        self.final_ack(kind)
    }

    fn final_ack(&self, kind: CollectionType) -> Vec<LinkMessage> {
        // ---
        if self.config.mission_fault == MissionFault::NoFinalAck {
            return Vec::new();
        }
        vec![LinkMessage::Ack { kind }]
    }

    // ---

    fn handle_bootloader(&mut self, msg: LinkMessage) -> Vec<LinkMessage> {
        // ---
        let Some(boot) = self.config.bootloader.clone() else {
            return Vec::new();
        };
        if self.boot_silent {
            return Vec::new();
        }

        let mut state = lock(&self.state);

        match msg {
            LinkMessage::Connect => vec![LinkMessage::BoardInfo {
                board_id: boot.board_id,
                flash_size: boot.flash_size,
            }],

            LinkMessage::Erase => {
                state.flash.iter_mut().for_each(|b| *b = 0xFF);
                match boot.fault {
                    BootFault::EraseHangs => {
                        self.boot_silent = true;
                        return Vec::new();
                    }
                    BootFault::SilentAfterErase => self.boot_silent = true,
                    _ => {}
                }
                vec![LinkMessage::EraseDone]
            }

            LinkMessage::WriteBlock { addr, bytes } => {
                state.stats.write_blocks += 1;
                let start = addr as usize;
                let end = start + bytes.len();
                if end > state.flash.len() {
                    return vec![LinkMessage::BootError {
                        detail: format!("write past end of flash at 0x{addr:08X}"),
                    }];
                }
                state.flash[start..end].copy_from_slice(&bytes);

                let mut count = bytes.len() as u32;
                if boot.fault == BootFault::ShortWriteAck(addr) {
                    count = count.saturating_sub(1);
                }
                vec![LinkMessage::WriteAck { addr, count }]
            }

            LinkMessage::ReadBlock { addr, len } => {
                state.stats.read_blocks += 1;
                let start = addr as usize;
                let end = (start + len as usize).min(state.flash.len());
                let mut bytes = state.flash[start.min(end)..end].to_vec();
                if let BootFault::CorruptReadback(bad) = boot.fault {
                    if bad >= addr && ((bad - addr) as usize) < bytes.len() {
                        bytes[(bad - addr) as usize] ^= 0xA5;
                    }
                }
                vec![LinkMessage::ReadData { addr, bytes }]
            }

            LinkMessage::GetCrc => {
                let mut crc = crc32fast::hash(&state.flash);
                if boot.fault == BootFault::BadCrc {
                    crc ^= 0xDEAD_BEEF;
                }
                vec![LinkMessage::CrcReport { crc }]
            }

            LinkMessage::Reboot => {
                state.stats.rebooted = true;
                Vec::new()
            }

            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// SimVehicleHandle
// ---------------------------------------------------------------------------

/// Inspection handle for a running [`SimVehicle`].
pub struct SimVehicleHandle {
    // ---
    state: Arc<Mutex<VehicleState>>,
    task: JoinHandle<()>,
}

// ---

impl SimVehicleHandle {
    // ---
    /// Items currently stored onboard for `kind`.
    pub fn collection(&self, kind: CollectionType) -> Vec<MissionItem> {
        lock(&self.state)
            .collections
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> VehicleStats {
        lock(&self.state).stats.clone()
    }

    /// Snapshot of simulated flash memory.
    pub fn flash(&self) -> Vec<u8> {
        lock(&self.state).flash.clone()
    }

    /// Stop the vehicle task.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

// ---

fn lock(state: &Mutex<VehicleState>) -> MutexGuard<'_, VehicleState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
