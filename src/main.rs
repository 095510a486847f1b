//! Demo host binary: runs a protocol against a mock chip.
//!
//! Useful for exercising the engine end to end without hardware; real
//! deployments embed the library behind a transport front end instead.

use clap::Parser;
use mimalloc::MiMalloc;
use rust_lab::device::mock::MockController;
use rust_lab::device::DeviceAdapter;
use rust_lab::eval::Expr;
use rust_lab::master::Master;
use rust_lab::process::timer::TimerBlock;
use rust_lab::protocol::{Block, Protocol, RepeatBlock, SequenceBlock, ShorthandBlock};
use rust_lab::runner::{Chip, TracingRunner};
use rust_lab::settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "rust_lab", about = "Laboratory protocol automation host")]
struct Cli {
    /// Path to a TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a protocol JSON export; runs a built-in demo when omitted.
    #[arg(long)]
    protocol: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    // A supervised mock device stands in for real drivers.
    let controller = Arc::new(MockController::new());
    controller.add_device("mock0");
    let adapter = DeviceAdapter::new("mock0", controller, settings.adapter.options());
    adapter.connect().await?;

    let protocol = match &cli.protocol {
        Some(path) => {
            let data = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            Protocol::import(&data)?
        }
        None => demo_protocol(),
    };

    let chip = Chip::new().with_runner(Arc::new(TracingRunner::new("devices")));
    let master = Master::new(chip, protocol, settings.engine.clone());
    let mut completed = master.completed();
    master.start().await?;
    completed.wait_for(|done| *done).await?;

    adapter.stop().await;
    println!("{}", serde_json::to_string_pretty(&master.export())?);
    Ok(())
}

fn demo_protocol() -> Protocol {
    let wash = Arc::new(SequenceBlock::new(vec![
        Arc::new(TimerBlock::duration(Duration::from_millis(200))) as Arc<dyn Block>,
        Arc::new(TimerBlock::duration(Duration::from_millis(100))),
    ]));
    Protocol::new("demo")
        .with_segment(Arc::new(ShorthandBlock::new(
            "cycles",
            serde_json::json!(3),
            Arc::new(RepeatBlock::new(Expr::Var("cycles".into()), wash)),
        )))
        .with_segment(Arc::new(TimerBlock::duration(Duration::from_millis(250))))
}
