use tokio::sync::mpsc;

// ---

use super::channel::{LinkSimChannel, LinkSwitch};
use super::config::LinkSimConfig;

// ---------------------------------------------------------------------------
// LinkSimTransport
// ---------------------------------------------------------------------------

/// In-process simulated link. Does not use real serial ports or sockets.
pub struct LinkSimTransport {
    // ---
    config: LinkSimConfig,
}

// ---

impl LinkSimTransport {
    // ---
    pub fn new(config: LinkSimConfig) -> Self {
        Self { config }
    }

    // ---

    /// Create the two ends of one link: `(ground, vehicle)`.
    ///
    /// Both ends share a single [`LinkSwitch`]; impairments apply to each
    /// direction independently.
    pub fn connected_pair(&self) -> (LinkSimChannel, LinkSimChannel) {
        // ---
        let (ground_tx, vehicle_rx) = mpsc::unbounded_channel();
        let (vehicle_tx, ground_rx) = mpsc::unbounded_channel();
        let switch = LinkSwitch::new();

        let ground = LinkSimChannel::new(ground_tx, ground_rx, switch.clone(), self.config.clone(), 0);
        let vehicle = LinkSimChannel::new(vehicle_tx, vehicle_rx, switch, self.config.clone(), 1);

        (ground, vehicle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use planlink_domain::{CollectionType, LinkChannel, LinkMessage, PlanLinkError};

    use super::*;

    // ---

    #[tokio::test]
    async fn perfect_link_delivers_in_order() {
        // ---
        let (ground, vehicle) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();

        for seq in 0..5 {
            ground
                .send(&LinkMessage::RequestItem {
                    kind: CollectionType::Mission,
                    seq,
                })
                .await
                .unwrap();
        }

        for seq in 0..5 {
            let got = vehicle.recv().await.unwrap();
            assert_eq!(
                got,
                LinkMessage::RequestItem {
                    kind: CollectionType::Mission,
                    seq
                }
            );
        }
    }

    // ---

    #[tokio::test]
    async fn disabled_link_swallows_traffic() {
        // ---
        let (ground, vehicle) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
        ground.switch().set_enabled(false);

        ground.send(&LinkMessage::Heartbeat).await.unwrap();
        ground.switch().set_enabled(true);
        ground.send(&LinkMessage::Connect).await.unwrap();

        assert_eq!(vehicle.recv().await.unwrap(), LinkMessage::Connect);
    }

    // ---

    #[tokio::test]
    async fn seeded_loss_is_reproducible() {
        // ---
        let config = LinkSimConfig {
            drop_percent: 0.5,
            seed: Some(42),
            ..Default::default()
        };

        let mut delivered = Vec::new();
        for _ in 0..2 {
            let (ground, vehicle) = LinkSimTransport::new(config.clone()).connected_pair();
            for _ in 0..32 {
                ground.send(&LinkMessage::Heartbeat).await.unwrap();
            }
            drop(ground);

            let mut n = 0;
            while vehicle.recv().await.is_ok() {
                n += 1;
            }
            delivered.push(n);
        }

        assert_eq!(delivered[0], delivered[1]);
        assert!(delivered[0] < 32, "half the traffic should be lost");
    }

    // ---

    #[tokio::test]
    async fn corrupt_packet_surfaces_as_framing_error() {
        // ---
        let (ground, vehicle) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
        ground.inject_raw(vec![0xFF, 0x01, 0, 0, 0, 0]).unwrap();

        let err = vehicle.recv().await.unwrap_err();
        assert!(matches!(err, PlanLinkError::Framing(_)));
    }

    // ---

    #[tokio::test]
    async fn damaged_frames_surface_as_framing_errors() {
        // ---
        let config = LinkSimConfig {
            corrupt_percent: 1.0,
            seed: Some(7),
            ..Default::default()
        };
        let (ground, vehicle) = LinkSimTransport::new(config).connected_pair();

        ground.send(&LinkMessage::Heartbeat).await.unwrap();
        ground.send(&LinkMessage::Heartbeat).await.unwrap();

        for _ in 0..2 {
            let err = vehicle.recv().await.unwrap_err();
            assert!(matches!(err, PlanLinkError::Framing(_)), "got {err:?}");
        }
    }
}
