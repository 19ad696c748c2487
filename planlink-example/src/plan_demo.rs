//! Plan round trip demo — upload a plan over a lossy radio link, download it
//! again and check that every collection came back unchanged.

use std::sync::Arc;

// ---

use anyhow::Context;

// ---

use planlink_domain::{
    // ---
    CollectionType,
    ComplexItem,
    Coordinate,
    FenceCircle,
    FencePolygon,
    LinkChannelPtr,
    LinkId,
    MissionItem,
    Plan,
    PlanHandler,
    PlanItem,
    RallyPoint,
    ITEM_SCHEMA_VERSION,
};
use planlink_engine::{load_plan, save_plan, Engine, EngineConfig};
use planlink_link_sim::{LinkSimConfig, LinkSimTransport, SimVehicle, SimVehicleConfig};

// ---

use super::Config;

// ---

pub async fn run(engine_config: &EngineConfig, handler: Arc<dyn PlanHandler>, cfg: &Config) -> anyhow::Result<()> {
    // ---
    let plan = match &cfg.plan {
        Some(path) => load_plan(path).with_context(|| format!("loading {}", path.display()))?,
        None => survey_plan(),
    };

    let (ground, onboard) = LinkSimTransport::new(LinkSimConfig::lossy_radio(cfg.seed)).connected_pair();
    let vehicle = SimVehicle::new(SimVehicleConfig {
        heartbeat: Some(std::time::Duration::from_millis(500)),
        ..Default::default()
    })
    .spawn(onboard);

    let channel: LinkChannelPtr = Arc::new(ground);
    let engine = Engine::builder(engine_config.clone())
        .link(LinkId::Primary, channel)
        .handler(handler)
        .start()?;
    let coordinator = engine.coordinator();

    println!("uploading: {} mission entries, {} rally points", plan.mission.len(), plan.rally.len());
    let outcome = coordinator.upload(&plan).await?;
    println!("upload done ({} retries)", outcome.retries);

    let readback = coordinator.download().await?;
    for kind in CollectionType::ALL {
        let sent = plan.collection(kind);
        let received = readback.collection(kind);
        println!(
            "{:<8} sent {:>3} items, vehicle holds {:>3}, read back {:>3} — match: {}",
            kind.to_string(),
            sent.len(),
            vehicle.collection(kind).len(),
            received.len(),
            sent == received
        );
        anyhow::ensure!(sent == received, "{kind} changed in transit");
    }

    if let Some(path) = &cfg.out {
        save_plan(&readback, path)?;
        println!("saved read-back plan to {}", path.display());
    }

    vehicle.shutdown();
    Ok(())
}

// ---

fn survey_plan() -> Plan {
    // ---
    let home = Coordinate::new(47.397742, 8.545594, 488.0);

    let mut plan = Plan::with_mission(vec![
        MissionItem::at(planlink_domain::cmd::NAV_TAKEOFF, home.with_alt(30.0)),
        MissionItem::waypoint(Coordinate::new(47.3985, 8.5462, 40.0)),
    ]);
    plan.mission.push(PlanItem::Complex(ComplexItem::Survey {
        polygon: vec![
            Coordinate::new(47.3990, 8.5450, 0.0),
            Coordinate::new(47.4000, 8.5450, 0.0),
            Coordinate::new(47.4000, 8.5470, 0.0),
            Coordinate::new(47.3990, 8.5470, 0.0),
        ],
        transects: vec![
            Coordinate::new(47.3990, 8.5452, 0.0),
            Coordinate::new(47.4000, 8.5452, 0.0),
            Coordinate::new(47.4000, 8.5458, 0.0),
            Coordinate::new(47.3990, 8.5458, 0.0),
        ],
        altitude: 60.0,
        trigger_distance: 25.0,
        version: ITEM_SCHEMA_VERSION,
    }));
    plan.mission
        .push(PlanItem::Simple(MissionItem::at(planlink_domain::cmd::NAV_RETURN_TO_LAUNCH, home)));
    plan.home = Some(home);

    plan.fence.polygons.push(FencePolygon {
        vertices: vec![
            Coordinate::new(47.3960, 8.5430, 0.0),
            Coordinate::new(47.4020, 8.5430, 0.0),
            Coordinate::new(47.4020, 8.5490, 0.0),
            Coordinate::new(47.3960, 8.5490, 0.0),
        ],
        inclusion: true,
        version: ITEM_SCHEMA_VERSION,
    });
    plan.fence.circles.push(FenceCircle {
        center: Coordinate::new(47.3995, 8.5480, 0.0),
        radius: 15.0,
        inclusion: false,
        version: ITEM_SCHEMA_VERSION,
    });
    plan.fence.breach_return = Some(home.with_alt(40.0));

    plan.rally.push(RallyPoint::new(Coordinate::new(47.3979, 8.5461, 20.0)));
    plan.rally.push(RallyPoint::new(Coordinate::new(47.4010, 8.5440, 25.0)));
    plan
}
