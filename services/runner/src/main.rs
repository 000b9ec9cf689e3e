//! Runner backend entry point: wires the message bus, loads a protocol
//! file, and plugs in the runner, its bus listener, and the device viewer
//! bridge.

use clap::Parser;
use mf_bus::{ListenerActor, MessageBus};
use protocol_core::flat::{from_flat_export, FlatProtocol};
use protocol_core::ProtocolState;
use runner::listener::RunnerListener;
use runner::spawn_runner;
use runner::viewer::{self, ViewerBridge};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "runner", about = "Microfluidics protocol runner backend")]
struct Args {
    /// Flat protocol JSON to load.
    #[arg(long)]
    protocol: Option<PathBuf>,

    /// Start immediately in preview mode (no hardware side effects).
    #[arg(long)]
    preview: bool,

    /// Start the run on launch.
    #[arg(long)]
    run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let state = match &args.protocol {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            let flat = FlatProtocol::from_json(&raw)?;
            let state = from_flat_export(&flat);
            info!(path = %path.display(), "protocol loaded");
            state
        }
        None => ProtocolState::new(),
    };
    let shared = Arc::new(Mutex::new(state));

    let bus = MessageBus::new();

    let (handle, mut notices) = spawn_runner(bus.clone(), shared.clone());
    RunnerListener::attach(&bus, handle.sender());

    let bridge_rx = bus.register_listener(viewer::LISTENER_NAME);
    for pattern in ViewerBridge::subscriptions() {
        bus.subscribe(pattern, viewer::LISTENER_NAME);
    }
    ListenerActor::spawn(
        viewer::LISTENER_NAME,
        ViewerBridge::new(bus.clone(), shared.clone()),
        ViewerBridge::handler_table(),
        bridge_rx,
    );

    if args.run {
        handle.start(args.preview);
    }

    info!("runner backend running; ctrl-c to exit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => match notice {
                Some(notice) => info!(?notice, "runner notice"),
                None => break,
            },
        }
    }
    handle.stop();
    Ok(())
}
