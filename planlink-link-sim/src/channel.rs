use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Mutex};

// ---

use planlink_domain::{decode_frame, encode_frame, LinkChannel, LinkMessage, PlanLinkError, Result};

// ---

use super::LinkSimConfig;

// ---------------------------------------------------------------------------
// LinkSwitch
// ---------------------------------------------------------------------------

/// Outage injection handle shared by both ends of a simulated link.
///
/// While disabled, every message sent in either direction is silently
/// discarded and the link goes dark without either end being told.
#[derive(Debug, Clone)]
pub struct LinkSwitch {
    // ---
    enabled: Arc<AtomicBool>,
}

// ---

impl LinkSwitch {
    // ---
    pub(crate) fn new() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// LinkSimChannel
// ---------------------------------------------------------------------------

/// One end of an in-process simulated link backed by mpsc channels.
///
/// Created in connected pairs by
/// [`super::transport::LinkSimTransport::connected_pair`]. Each message is
/// framed on send and decoded on receive, so framing errors surface exactly
/// as they would on a real radio.
pub struct LinkSimChannel {
    // ---
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    switch: LinkSwitch,
    rng: std::sync::Mutex<StdRng>,
    config: LinkSimConfig,
}

// ---

impl LinkSimChannel {
    // ---
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        switch: LinkSwitch,
        config: LinkSimConfig,
        seed_offset: u64,
    ) -> Self {
        // ---
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(seed_offset)),
            None => StdRng::from_entropy(),
        };

        Self {
            tx,
            rx: Mutex::new(rx),
            switch,
            rng: std::sync::Mutex::new(rng),
            config,
        }
    }

    /// Outage switch shared with the other end of this link.
    pub fn switch(&self) -> LinkSwitch {
        self.switch.clone()
    }

    // ---

    /// Inject raw bytes as if they had arrived from the peer. Used to feed
    /// corrupt packets to the receiver.
    pub fn inject_raw(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx.send(bytes).map_err(|_| PlanLinkError::ChannelClosed)
    }

    // ---

    /// Roll the impairment dice for one outgoing message.
    fn impair(&self) -> Impairment {
        // ---
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut roll = |p: f64| p > 0.0 && rng.gen_bool(p.min(1.0));

        if roll(self.config.drop_percent) {
            Impairment::Drop
        } else if roll(self.config.corrupt_percent) {
            Impairment::Corrupt
        } else if roll(self.config.dup_percent) {
            Impairment::Duplicate
        } else {
            Impairment::Deliver
        }
    }
}

// ---

enum Impairment {
    Deliver,
    Drop,
    Duplicate,
    Corrupt,
}

// ---

#[async_trait]
impl LinkChannel for LinkSimChannel {
    // ---
    async fn send(&self, msg: &LinkMessage) -> Result<()> {
        // ---
        let frame = encode_frame(msg)?;

        if !self.switch.is_enabled() {
            tracing::trace!(msg = msg.name(), "link-sim: link down, message lost");
            return Ok(());
        }

        let copies = match self.impair() {
            Impairment::Deliver => vec![frame],
            Impairment::Drop => {
                tracing::trace!(msg = msg.name(), "link-sim: dropped");
                Vec::new()
            }
            Impairment::Duplicate => vec![frame.clone(), frame],
            Impairment::Corrupt => {
                tracing::trace!(msg = msg.name(), "link-sim: corrupted");
                let mut damaged = frame;
                damaged[0] ^= 0xFF;
                vec![damaged]
            }
        };
        for copy in copies {
            self.tx.send(copy).map_err(|_| PlanLinkError::ChannelClosed)?;
        }
        Ok(())
    }

    // ---

    async fn recv(&self) -> Result<LinkMessage> {
        // ---
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(frame) => decode_frame(&frame),
            None => Err(PlanLinkError::ChannelClosed),
        }
    }
}
