//! Controller backend entry point: wires the message bus and plugs in the
//! supervisor. With `--emulated` the in-process device emulation stands in
//! for real hardware; otherwise ports are enumerated over serial and a
//! transport crate must provide the driver (none is linked in this build).

use clap::Parser;
use controller::emulated::Bench;
use controller::supervisor::{DropbotController, LISTENER_NAME};
use controller::ControllerConfig;
use mf_bus::{ListenerActor, MessageBus};
use mf_protocol::topics;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "controller", about = "Microfluidics hardware controller backend")]
struct Args {
    /// Path to the TOML config; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against the in-process device emulation.
    #[arg(long)]
    emulated: bool,

    /// Begin device monitoring immediately.
    #[arg(long, default_value_t = true)]
    monitor: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };

    let bus = MessageBus::new();

    let controller = if args.emulated {
        let bench = Bench::new(config.expected_channels);
        let scanner = Arc::new(controller::emulated::ScriptedScanner::new(vec![vec![
            "emu0".to_owned(),
        ]]));
        info!("running with emulated hardware");
        DropbotController::new(bus.clone(), config, scanner, bench.factory())
    } else {
        return Err(
            "no serial driver transport is linked in this build; run with --emulated".into(),
        );
    };

    let rx = bus.register_listener(LISTENER_NAME);
    for pattern in DropbotController::subscriptions() {
        bus.subscribe(pattern, LISTENER_NAME);
    }

    let actor = ListenerActor::spawn(
        LISTENER_NAME,
        controller,
        DropbotController::handler_table(),
        rx,
    );

    if args.monitor {
        bus.publish(topics::START_DEVICE_MONITORING, "");
    }

    info!("controller backend running; ctrl-c to exit");
    tokio::signal::ctrl_c().await?;
    actor.abort();
    Ok(())
}
