//! Whole-engine tests: a real [`Engine`] talking to a [`SimVehicle`] over
//! simulated links, with tokio time paused so retry and health timers run
//! instantly.

use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::sync::mpsc;

// ---

use planlink_domain::{
    // ---
    Collection,
    CollectionType,
    Coordinate,
    FencePolygon,
    FlashPhase,
    LinkChannelPtr,
    LinkId,
    LinkState,
    MissionItem,
    NackCode,
    Plan,
    PlanLinkError,
    RallyPoint,
    ITEM_SCHEMA_VERSION,
};
use planlink_link_sim::{
    // ---
    BootFault,
    BootloaderConfig,
    LinkSimConfig,
    LinkSimTransport,
    LinkSwitch,
    MissionFault,
    SimVehicle,
    SimVehicleConfig,
    SimVehicleHandle,
};

// ---

use super::*;

// ---------------------------------------------------------------------------
// Rig
// ---------------------------------------------------------------------------

const HEARTBEAT: Duration = Duration::from_millis(500);

struct Rig {
    // ---
    engine: Engine,
    vehicle: SimVehicleHandle,
    switch: LinkSwitch,
    events: mpsc::UnboundedReceiver<PlanEvent>,
}

// ---

impl Rig {
    // ---
    fn start(config: EngineConfig, link: LinkSimConfig, vehicle: SimVehicle) -> Self {
        // ---
        let (ground, onboard) = LinkSimTransport::new(link).connected_pair();
        let switch = ground.switch();
        let vehicle = vehicle.spawn(onboard);

        let (events_tx, events) = EventTx::channel();
        let channel: LinkChannelPtr = Arc::new(ground);
        let engine = Engine::builder(config)
            .link(LinkId::Primary, channel)
            .events(events_tx)
            .start()
            .unwrap();

        Self {
            engine,
            vehicle,
            switch,
            events,
        }
    }

    fn coordinator(&self) -> Arc<PlanCoordinator> {
        self.engine.coordinator()
    }

    fn drain_events(&mut self) -> Vec<PlanEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

// ---

fn chatty(fault: MissionFault) -> SimVehicleConfig {
    SimVehicleConfig {
        mission_fault: fault,
        heartbeat: Some(HEARTBEAT),
        ..Default::default()
    }
}

fn waypoints(n: usize) -> Vec<MissionItem> {
    (0..n)
        .map(|i| MissionItem::waypoint(Coordinate::new(47.39 + i as f64 * 1e-3, 8.54, 20.0 + i as f64)))
        .collect()
}

fn survey_plan() -> Plan {
    // ---
    let mut plan = Plan::with_mission(waypoints(3));
    plan.fence.polygons.push(FencePolygon {
        vertices: vec![
            Coordinate::new(47.38, 8.53, 0.0),
            Coordinate::new(47.41, 8.53, 0.0),
            Coordinate::new(47.41, 8.56, 0.0),
            Coordinate::new(47.38, 8.56, 0.0),
        ],
        inclusion: true,
        version: ITEM_SCHEMA_VERSION,
    });
    plan.rally.push(RallyPoint::new(Coordinate::new(47.3979, 8.5461, 20.0)));
    plan.rally.push(RallyPoint::new(Coordinate::new(47.4001, 8.5502, 25.0)));
    plan
}

fn assert_same_collections(a: &Plan, b: &Plan) {
    for kind in CollectionType::ALL {
        assert_eq!(a.collection(kind), b.collection(kind), "{kind} differs");
    }
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn downloads_stored_mission() {
    // ---
    let vehicle = SimVehicle::new(chatty(MissionFault::None)).with_collection(CollectionType::Mission, waypoints(7));
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), vehicle);

    let mission = rig
        .coordinator()
        .download_collection(CollectionType::Mission)
        .await
        .unwrap();

    assert_eq!(mission.len(), 7);
    assert_eq!(mission, Collection::from_items(CollectionType::Mission, waypoints(7)));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.vehicle.stats().acks_received, 1);
    assert!(!rig.coordinator().is_busy());
}

// ---

#[tokio::test(start_paused = true)]
async fn plan_survives_upload_then_download() {
    // ---
    let mut rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), SimVehicle::new(chatty(MissionFault::None)));
    let coordinator = rig.coordinator();
    let plan = survey_plan();

    let outcome = coordinator.upload(&plan).await.unwrap();
    assert_eq!(outcome, PlanOutcome::default());
    assert_eq!(
        rig.drain_events().last(),
        Some(&PlanEvent::Result {
            success: true,
            errors: Vec::new()
        })
    );
    assert_eq!(rig.vehicle.collection(CollectionType::Mission).len(), 3);
    assert_eq!(rig.vehicle.collection(CollectionType::Rally).len(), 2);

    let first = coordinator.download().await.unwrap();
    assert_same_collections(&first, &plan);
    assert_eq!(first.fence, plan.fence);
    assert_eq!(first.rally, plan.rally);

    // Writing back what was read changes nothing onboard.
    coordinator.upload(&first).await.unwrap();
    let second = coordinator.download().await.unwrap();
    assert_eq!(second, first);
}

// ---

#[tokio::test(start_paused = true)]
async fn lossy_link_round_trip_is_lossless() {
    // ---
    let items = waypoints(12);
    let vehicle = SimVehicle::new(chatty(MissionFault::None)).with_collection(CollectionType::Mission, items.clone());
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::lossy_radio(42), vehicle);
    let coordinator = rig.coordinator();

    let downloaded = coordinator.download().await.unwrap();
    assert_eq!(
        downloaded.mission_collection(),
        Collection::from_items(CollectionType::Mission, items)
    );

    coordinator.upload(&downloaded).await.unwrap();
    let again = coordinator.download().await.unwrap();
    assert_same_collections(&again, &downloaded);
}

// ---

#[tokio::test(start_paused = true)]
async fn damaged_frames_are_recovered_like_lost_ones() {
    // ---
    let rig = Rig::start(
        EngineConfig::default(),
        LinkSimConfig::noisy_serial(3),
        SimVehicle::new(chatty(MissionFault::None)),
    );
    let plan = Plan::with_mission(waypoints(15));

    rig.coordinator().upload(&plan).await.unwrap();

    let stored = rig.vehicle.collection(CollectionType::Mission);
    assert_eq!(stored.len(), 15);
    assert_eq!(
        rig.coordinator().download().await.unwrap().mission_collection(),
        plan.mission_collection()
    );
}

// ---

#[tokio::test(start_paused = true)]
async fn dropped_item_is_requested_again() {
    // ---
    let vehicle =
        SimVehicle::new(chatty(MissionFault::DropItemOnce(2))).with_collection(CollectionType::Mission, waypoints(5));
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), vehicle);

    let mission = rig
        .coordinator()
        .download_collection(CollectionType::Mission)
        .await
        .unwrap();

    assert_eq!(mission.len(), 5);
    // Five items plus the re-request for item 2.
    assert_eq!(rig.vehicle.stats().item_requests, 6);
}

// ---

#[tokio::test(start_paused = true)]
async fn stale_item_is_discarded_and_download_completes() {
    // ---
    let vehicle =
        SimVehicle::new(chatty(MissionFault::StaleItemOnce(3))).with_collection(CollectionType::Mission, waypoints(5));
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), vehicle);

    let mission = rig
        .coordinator()
        .download_collection(CollectionType::Mission)
        .await
        .unwrap();

    // Item 2 arriving in place of item 3 is not stored twice.
    assert_eq!(mission, Collection::from_items(CollectionType::Mission, waypoints(5)));
    assert_eq!(rig.vehicle.stats().item_requests, 6);
}

// ---

#[tokio::test(start_paused = true)]
async fn repeated_count_mid_download_is_a_protocol_violation() {
    // ---
    let vehicle =
        SimVehicle::new(chatty(MissionFault::ResendCount)).with_collection(CollectionType::Mission, waypoints(5));
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), vehicle);

    let err = rig
        .coordinator()
        .download_collection(CollectionType::Mission)
        .await
        .unwrap_err();

    assert_eq!(err.collection, Some(CollectionType::Mission));
    assert!(matches!(err.source, PlanLinkError::ProtocolViolation(_)), "{err}");
    assert_eq!(rig.vehicle.stats().acks_received, 0);
    assert!(!rig.coordinator().is_busy());
}

// ---

#[tokio::test(start_paused = true)]
async fn silent_vehicle_mid_download_times_out() {
    // ---
    let vehicle =
        SimVehicle::new(chatty(MissionFault::StopAfterItems(4))).with_collection(CollectionType::Mission, waypoints(5));
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), vehicle);

    let err = rig
        .coordinator()
        .download_collection(CollectionType::Mission)
        .await
        .unwrap_err();

    assert_eq!(err.collection, Some(CollectionType::Mission));
    match err.source {
        PlanLinkError::Timeout { what, attempts } => {
            assert!(what.contains("item 4"), "{what}");
            assert_eq!(attempts, RetryPolicy::default().max_attempts);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(rig.vehicle.stats().acks_received, 0);
    assert!(!rig.coordinator().is_busy());
}

// ---

#[tokio::test(start_paused = true)]
async fn out_of_range_request_aborts_upload() {
    // ---
    let rig = Rig::start(
        EngineConfig::default(),
        LinkSimConfig::perfect(),
        SimVehicle::new(chatty(MissionFault::RequestOutOfRange)),
    );

    let collection = Collection::from_items(CollectionType::Mission, waypoints(3));
    let err = rig.coordinator().upload_collection(collection).await.unwrap_err();

    assert!(matches!(err.source, PlanLinkError::ProtocolViolation(_)), "{err}");
    assert_eq!(rig.vehicle.stats().items_received, 1);
    assert!(rig.vehicle.collection(CollectionType::Mission).is_empty());
}

// ---

#[tokio::test(start_paused = true)]
async fn vehicle_rejection_is_reported_with_its_code() {
    // ---
    let rig = Rig::start(
        EngineConfig::default(),
        LinkSimConfig::perfect(),
        SimVehicle::new(chatty(MissionFault::NakAll(NackCode::NoSpace))),
    );

    let err = rig.coordinator().upload(&survey_plan()).await.unwrap_err();
    assert_eq!(err.collection, Some(CollectionType::Mission));
    assert!(matches!(
        err.source,
        PlanLinkError::PeerRejected {
            kind: CollectionType::Mission,
            code: NackCode::NoSpace
        }
    ));
}

// ---

#[tokio::test(start_paused = true)]
async fn clear_all_empties_vehicle_storage() {
    // ---
    let vehicle = SimVehicle::new(chatty(MissionFault::None)).with_collection(CollectionType::Rally, waypoints(2));
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), vehicle);

    rig.coordinator().clear_all(CollectionType::Rally).await.unwrap();
    assert!(rig.vehicle.collection(CollectionType::Rally).is_empty());
}

// ---

#[tokio::test(start_paused = true)]
async fn progress_and_result_events_are_published() {
    // ---
    let vehicle = SimVehicle::new(chatty(MissionFault::None)).with_collection(CollectionType::Mission, waypoints(4));
    let mut rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), vehicle);

    rig.coordinator()
        .download_collection(CollectionType::Mission)
        .await
        .unwrap();

    let events = rig.drain_events();
    let done: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            PlanEvent::Progress(p) if p.kind == CollectionType::Mission => Some(p.items_done),
            _ => None,
        })
        .collect();
    assert_eq!(done, vec![0, 1, 2, 3, 4]);
    assert_eq!(
        events.last(),
        Some(&PlanEvent::Result {
            success: true,
            errors: Vec::new()
        })
    );
}

// ---------------------------------------------------------------------------
// Link ownership, cancel, health
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn second_operation_is_refused_while_link_is_busy() {
    // ---
    let rig = Rig::start(
        EngineConfig::default(),
        LinkSimConfig::perfect(),
        SimVehicle::new(chatty(MissionFault::NoResponse)),
    );
    let coordinator = rig.coordinator();

    let running = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.download().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(coordinator.is_busy());

    let err = coordinator.clear_all(CollectionType::Fence).await.unwrap_err();
    assert_eq!(err.collection, None);
    assert!(matches!(err.source, PlanLinkError::LinkBusy(LinkId::Primary)));

    coordinator.cancel();
    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err.source, PlanLinkError::Cancelled));
    assert!(!coordinator.is_busy());
}

// ---

#[tokio::test(start_paused = true)]
async fn cancel_ends_upload_and_frees_link() {
    // ---
    let rig = Rig::start(
        EngineConfig::default(),
        LinkSimConfig::perfect(),
        SimVehicle::new(chatty(MissionFault::NoFinalAck)),
    );
    let coordinator = rig.coordinator();

    let running = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.upload(&survey_plan()).await }
    });
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    coordinator.cancel();

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err.source, PlanLinkError::Cancelled), "{err}");
    assert!(!coordinator.is_busy());

    // Only the acknowledgement was missing; the items were stored.
    assert_eq!(rig.vehicle.collection(CollectionType::Mission).len(), 3);
}

// ---

#[tokio::test(start_paused = true)]
async fn link_silence_ends_transfer_with_link_lost() {
    // ---
    let health = EngineConfig::default().health;
    let vehicle = SimVehicle::new(chatty(MissionFault::None)).with_collection(CollectionType::Mission, waypoints(5));
    let started = tokio::time::Instant::now();
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), vehicle);
    rig.switch.set_enabled(false);

    let err = rig.coordinator().download().await.unwrap_err();
    let lost_at = started.elapsed();

    assert_eq!(err.collection, Some(CollectionType::Mission));
    assert!(matches!(err.source, PlanLinkError::LinkLost), "{err}");
    // The link is released within one health tick of going silent too long.
    assert!(lost_at >= health.lost_after(), "{lost_at:?}");
    assert!(lost_at <= health.lost_after() + health.tick(), "{lost_at:?}");
    assert_eq!(rig.engine.status().state, LinkState::Lost);
    assert!(!rig.coordinator().is_busy());

    // Nothing starts on a lost link.
    let err = rig.coordinator().download().await.unwrap_err();
    assert_eq!(err.collection, None);
    assert!(matches!(err.source, PlanLinkError::LinkLost));
}

// ---

#[tokio::test(start_paused = true)]
async fn failover_restarts_transfer_on_secondary() {
    // ---
    let items = waypoints(6);

    let (primary, primary_onboard) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
    let (secondary, secondary_onboard) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
    primary.switch().set_enabled(false);

    let _primary_vehicle = SimVehicle::new(chatty(MissionFault::None))
        .with_collection(CollectionType::Mission, items.clone())
        .spawn(primary_onboard);
    let _secondary_vehicle = SimVehicle::new(chatty(MissionFault::None))
        .with_collection(CollectionType::Mission, items.clone())
        .spawn(secondary_onboard);

    let config = EngineConfig {
        auto_restart_on_failover: true,
        ..Default::default()
    };
    let primary: LinkChannelPtr = Arc::new(primary);
    let secondary: LinkChannelPtr = Arc::new(secondary);
    let engine = Engine::builder(config)
        .link(LinkId::Primary, primary)
        .link(LinkId::Secondary, secondary)
        .start()
        .unwrap();

    let mission = engine
        .coordinator()
        .download_collection(CollectionType::Mission)
        .await
        .unwrap();

    assert_eq!(mission, Collection::from_items(CollectionType::Mission, items));
    assert_eq!(engine.status().active, LinkId::Secondary);
    assert!(!engine.coordinator().is_busy());
}

// ---

#[tokio::test(start_paused = true)]
async fn failover_without_restart_reports_link_lost() {
    // ---
    let (primary, primary_onboard) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
    let (secondary, secondary_onboard) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
    primary.switch().set_enabled(false);

    let _primary_vehicle = SimVehicle::new(chatty(MissionFault::None)).spawn(primary_onboard);
    let _secondary_vehicle = SimVehicle::new(chatty(MissionFault::None)).spawn(secondary_onboard);

    let primary: LinkChannelPtr = Arc::new(primary);
    let secondary: LinkChannelPtr = Arc::new(secondary);
    let engine = Engine::builder(EngineConfig::default())
        .link(LinkId::Primary, primary)
        .link(LinkId::Secondary, secondary)
        .start()
        .unwrap();

    let err = engine
        .coordinator()
        .download_collection(CollectionType::Mission)
        .await
        .unwrap_err();
    assert!(matches!(err.source, PlanLinkError::LinkLost));

    // The promoted link serves the next operation.
    assert_eq!(engine.status().active, LinkId::Secondary);
    let mission = engine
        .coordinator()
        .download_collection(CollectionType::Mission)
        .await
        .unwrap();
    assert!(mission.is_empty());
}

// ---------------------------------------------------------------------------
// Firmware
// ---------------------------------------------------------------------------

const BOARD: u32 = 9;

fn bootloader_vehicle(fault: BootFault) -> SimVehicle {
    SimVehicle::new(SimVehicleConfig {
        bootloader: Some(BootloaderConfig {
            board_id: BOARD,
            flash_size: 4_096,
            fault,
        }),
        heartbeat: Some(HEARTBEAT),
        ..Default::default()
    })
}

fn image(len: usize) -> FirmwareImage {
    FirmwareImage::new(BOARD, (0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>())
}

// ---

#[tokio::test(start_paused = true)]
async fn firmware_is_written_verified_and_booted() {
    // ---
    let mut rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), bootloader_vehicle(BootFault::None));
    let image = image(1_000);

    let report = rig.coordinator().flash(&image).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(report.bytes_written, 1_000);
    assert_eq!(report.blocks, 4);
    assert_eq!(report.digest, image.digest());
    assert_eq!(&rig.vehicle.flash()[..1_000], image.bytes());
    assert!(rig.vehicle.stats().rebooted);

    let last_write = rig
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            PlanEvent::FlashProgress(p) if p.phase == FlashPhase::Write => Some(p.bytes_done),
            _ => None,
        })
        .last();
    assert_eq!(last_write, Some(1_000));
}

// ---

#[tokio::test(start_paused = true)]
async fn short_write_ack_stops_flash_at_that_block() {
    // ---
    let rig = Rig::start(
        EngineConfig::default(),
        LinkSimConfig::perfect(),
        bootloader_vehicle(BootFault::ShortWriteAck(504)),
    );

    let err = rig.coordinator().flash(&image(1_000)).await.unwrap_err();

    assert!(matches!(err.source, PlanLinkError::IntegrityFailure { address: 504, .. }), "{err}");
    assert_eq!(err.last_good_address, Some(503));
    assert_eq!(rig.vehicle.stats().write_blocks, 3);
    assert!(!rig.vehicle.stats().rebooted);
    assert!(!rig.coordinator().is_busy());
}

// ---

#[tokio::test(start_paused = true)]
async fn corrupt_readback_is_caught() {
    // ---
    let rig = Rig::start(
        EngineConfig::default(),
        LinkSimConfig::perfect(),
        bootloader_vehicle(BootFault::CorruptReadback(300)),
    );

    let err = rig.coordinator().flash(&image(1_000)).await.unwrap_err();
    assert!(matches!(err.source, PlanLinkError::IntegrityFailure { address: 300, .. }), "{err}");
    assert_eq!(err.last_good_address, Some(299));
}

// ---

#[tokio::test(start_paused = true)]
async fn bad_crc_is_reported_with_last_good_address() {
    // ---
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), bootloader_vehicle(BootFault::BadCrc));

    let err = rig.coordinator().flash(&image(1_000)).await.unwrap_err();

    match &err.source {
        PlanLinkError::IntegrityFailure { address, detail } => {
            assert_eq!(*address, 1_000);
            assert!(detail.contains("bootloader reports"), "{detail}");
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }
    assert_eq!(err.last_good_address, Some(999));
    assert_eq!(rig.vehicle.stats().write_blocks, 4);
    assert!(!rig.vehicle.stats().rebooted);
}

// ---

#[tokio::test(start_paused = true)]
async fn silent_erase_times_out() {
    // ---
    let config = EngineConfig::default();
    let erase_timeout = Duration::from_millis(config.flash.erase_timeout_ms);
    let rig = Rig::start(config, LinkSimConfig::perfect(), bootloader_vehicle(BootFault::EraseHangs));

    let started = tokio::time::Instant::now();
    let err = rig.coordinator().flash(&image(1_000)).await.unwrap_err();

    assert!(
        matches!(&err.source, PlanLinkError::Timeout { what, attempts: 1 } if what == "bootloader did not finish erase"),
        "{err}"
    );
    assert!(started.elapsed() >= erase_timeout);
    assert_eq!(err.last_good_address, None);
    assert_eq!(rig.vehicle.stats().write_blocks, 0);
    assert!(!rig.coordinator().is_busy());
}

// ---

#[tokio::test(start_paused = true)]
async fn unanswered_write_is_fatal() {
    // ---
    let rig = Rig::start(
        EngineConfig::default(),
        LinkSimConfig::perfect(),
        bootloader_vehicle(BootFault::SilentAfterErase),
    );

    let err = rig.coordinator().flash(&image(1_000)).await.unwrap_err();

    assert!(
        matches!(&err.source, PlanLinkError::Timeout { what, attempts: 1 } if what.contains("0x00000000")),
        "{err}"
    );
    assert_eq!(err.last_good_address, None);
    // The bootloader went quiet before it looked at the block.
    assert_eq!(rig.vehicle.stats().write_blocks, 0);
}

// ---

#[tokio::test(start_paused = true)]
async fn wrong_board_is_refused_before_erase() {
    // ---
    let rig = Rig::start(EngineConfig::default(), LinkSimConfig::perfect(), bootloader_vehicle(BootFault::None));

    let foreign = FirmwareImage::new(BOARD + 1, vec![0u8; 64]);
    let err = rig.coordinator().flash(&foreign).await.unwrap_err();

    assert!(matches!(
        err.source,
        PlanLinkError::BoardMismatch {
            expected,
            actual: BOARD
        } if expected == BOARD + 1
    ));
    assert_eq!(err.last_good_address, None);
    assert_eq!(rig.vehicle.stats().write_blocks, 0);
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[tokio::test]
async fn engine_without_links_is_refused() {
    assert!(Engine::builder(EngineConfig::default()).start().is_err());
}
