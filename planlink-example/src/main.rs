//! PlanLink example — demonstrations against the simulated vehicle.
//!
//! * Plan round trip: upload a plan over a lossy radio link, read it back
//!   and compare. `--plan` loads the plan from a file instead of using the
//!   built-in survey; `--out` saves what was read back.
//!
//! * Firmware flash: write, verify and boot an image through the simulated
//!   bootloader.
//!
//! * Failover: take the primary link dark mid-download and let the engine
//!   finish on the secondary.
//!
//! Run with:
//!   cargo run -p planlink-example
//!   cargo run -p planlink-example -- --plan survey.plan --out readback.plan
//!   cargo run -p planlink-example -- --config engine.toml --seed 7
//!   RUST_LOG=planlink_engine=debug cargo run -p planlink-example

use std::path::PathBuf;
use std::sync::Arc;

// ---

use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::EnvFilter;

// ---

use planlink_domain::{FlashProgress, LinkStatus, PlanHandler, TransferProgress};
use planlink_engine::EngineConfig;

// ---

mod failover_demo;
mod flash_demo;
mod plan_demo;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "planlink-example", about = "PlanLink demo runner")]
pub struct Config {
    // ---
    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Plan file to upload instead of the built-in survey.
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Save the plan read back from the vehicle to this file.
    #[arg(long)]
    out: Option<PathBuf>,

    /// RNG seed for the lossy radio link.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Skip the firmware flash demo.
    #[arg(long, default_value_t = false)]
    skip_flash: bool,

    /// Skip the failover demo.
    #[arg(long, default_value_t = false)]
    skip_failover: bool,
}

// ---------------------------------------------------------------------------
// ConsoleHandler
// ---------------------------------------------------------------------------

/// Prints engine events as they arrive.
pub struct ConsoleHandler;

#[async_trait]
impl PlanHandler for ConsoleHandler {
    // ---
    async fn on_progress(&self, progress: TransferProgress) {
        println!(
            "  {:<8} {:>3}/{:<3} ({:5.1}%)",
            progress.kind.to_string(),
            progress.items_done,
            progress.items_total,
            progress.percent_done()
        );
    }

    async fn on_result(&self, success: bool, errors: Vec<String>) {
        if success {
            println!("  result: ok");
        } else {
            println!("  result: FAILED — {}", errors.join("; "));
        }
    }

    async fn on_flash_progress(&self, progress: FlashProgress) {
        println!(
            "  {:?}: {}/{} bytes",
            progress.phase, progress.bytes_done, progress.bytes_total
        );
    }

    async fn on_link_status_update(&self, status: LinkStatus) {
        println!("  link: {:?} is active, {:?}", status.active, status.state);
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .without_time()
        .with_ansi(!no_color)
        .init();

    let engine_config = match &cfg.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let handler: Arc<dyn PlanHandler> = Arc::new(ConsoleHandler);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), retry = ?engine_config.retry, "planlink-example starting");

    println!("=== 1. Plan round trip (lossy radio, seed {}) ===", cfg.seed);
    plan_demo::run(&engine_config, handler.clone(), &cfg).await?;

    if !cfg.skip_flash {
        println!();
        println!("=== 2. Firmware flash ===");
        flash_demo::run(&engine_config, handler.clone()).await?;
    }

    if !cfg.skip_failover {
        println!();
        println!("=== 3. Link failover ===");
        failover_demo::run(&engine_config, handler).await?;
    }

    Ok(())
}
