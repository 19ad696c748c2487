//! Firmware flash demo — erase, write, read back, CRC check and reboot
//! through the simulated bootloader, then a second attempt against a
//! bootloader that misreports one write.

use std::sync::Arc;
use std::time::Duration;

// ---

use planlink_domain::{LinkChannelPtr, LinkId, PlanHandler};
use planlink_engine::{Engine, EngineConfig, FirmwareImage};
use planlink_link_sim::{BootFault, BootloaderConfig, LinkSimConfig, LinkSimTransport, SimVehicle, SimVehicleConfig};

// ---

const BOARD_ID: u32 = 50;
const FLASH_SIZE: u32 = 64 * 1024;

// ---

pub async fn run(engine_config: &EngineConfig, handler: Arc<dyn PlanHandler>) -> anyhow::Result<()> {
    // ---
    let image = FirmwareImage::new(BOARD_ID, synthetic_image(3_000));
    println!("image: {} bytes, sha256 {}", image.len(), image.digest());

    let report = flash_once(engine_config, handler.clone(), &image, BootFault::None).await?;
    println!(
        "flashed {} bytes in {} blocks, crc 0x{:08X}",
        report.bytes_written, report.blocks, report.crc
    );

    let bad_block = engine_config.flash.block_size * 3;
    println!();
    println!("again, with the bootloader short-acking the block at 0x{bad_block:08X}:");
    match flash_once(engine_config, handler, &image, BootFault::ShortWriteAck(bad_block)).await {
        Ok(_) => anyhow::bail!("short write acknowledgement went unnoticed"),
        Err(e) => println!("refused as expected: {e}"),
    }

    Ok(())
}

// ---

async fn flash_once(
    engine_config: &EngineConfig,
    handler: Arc<dyn PlanHandler>,
    image: &FirmwareImage,
    fault: BootFault,
) -> anyhow::Result<planlink_engine::FlashReport> {
    // ---
    let (ground, onboard) = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
    let vehicle = SimVehicle::new(SimVehicleConfig {
        bootloader: Some(BootloaderConfig {
            board_id: BOARD_ID,
            flash_size: FLASH_SIZE,
            fault,
        }),
        heartbeat: Some(Duration::from_millis(500)),
        ..Default::default()
    })
    .spawn(onboard);

    let channel: LinkChannelPtr = Arc::new(ground);
    let engine = Engine::builder(engine_config.clone())
        .link(LinkId::Primary, channel)
        .handler(handler)
        .start()?;

    let result = engine.coordinator().flash(image).await;
    vehicle.shutdown();
    Ok(result?)
}

// ---

/// Deterministic pseudo-random bytes standing in for a firmware binary.
fn synthetic_image(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}
