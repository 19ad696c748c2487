//! Failover demo — two radios to the same vehicle. The primary goes dark
//! as a download starts; once the health service declares it lost (a few
//! seconds of silence) it promotes the secondary and the coordinator
//! restarts the download there.

use std::sync::Arc;
use std::time::Duration;

// ---

use planlink_domain::{CollectionType, Coordinate, LinkChannelPtr, LinkId, MissionItem, PlanHandler};
use planlink_engine::{Engine, EngineConfig};
use planlink_link_sim::{LinkSimConfig, LinkSimTransport, SimVehicle, SimVehicleConfig};

// ---

pub async fn run(engine_config: &EngineConfig, handler: Arc<dyn PlanHandler>) -> anyhow::Result<()> {
    // ---
    let mission: Vec<MissionItem> = (0..40)
        .map(|i| MissionItem::waypoint(Coordinate::new(47.39 + f64::from(i) * 5e-4, 8.54, 50.0)))
        .collect();

    let vehicle_config = SimVehicleConfig {
        heartbeat: Some(Duration::from_millis(500)),
        ..Default::default()
    };

    let (primary, primary_onboard) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
    let (secondary, secondary_onboard) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
    let primary_switch = primary.switch();

    // One vehicle reachable over both radios: the same onboard storage is
    // preloaded on each simulated endpoint.
    let primary_vehicle = SimVehicle::new(vehicle_config.clone())
        .with_collection(CollectionType::Mission, mission.clone())
        .spawn(primary_onboard);
    let secondary_vehicle = SimVehicle::new(vehicle_config)
        .with_collection(CollectionType::Mission, mission.clone())
        .spawn(secondary_onboard);

    let config = EngineConfig {
        auto_restart_on_failover: true,
        ..engine_config.clone()
    };
    let primary: LinkChannelPtr = Arc::new(primary);
    let secondary: LinkChannelPtr = Arc::new(secondary);
    let engine = Engine::builder(config)
        .link(LinkId::Primary, primary)
        .link(LinkId::Secondary, secondary)
        .handler(handler)
        .start()?;

    // The primary drops every frame from here on without either end being
    // told; only the health service's silence timer can notice.
    println!("  -- primary radio goes dark --");
    primary_switch.set_enabled(false);

    let started = tokio::time::Instant::now();
    let downloaded = engine
        .coordinator()
        .download_collection(CollectionType::Mission)
        .await?;

    println!(
        "downloaded {} items in {:.1}s, now on {:?}",
        downloaded.len(),
        started.elapsed().as_secs_f64(),
        engine.status().active
    );
    anyhow::ensure!(downloaded.len() == mission.len(), "mission incomplete after failover");

    primary_vehicle.shutdown();
    secondary_vehicle.shutdown();
    Ok(())
}
