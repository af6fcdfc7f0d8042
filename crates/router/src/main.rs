use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use fpvlink_core::model::TomlModelStore;
use fpvlink_core::ModelStore;
use fpvlink_ipc::{FifoTransport, IpcHub};
use fpvlink_radio::{RadioInterfaces, UdpRadio};
use fpvlink_router::{Router, RouterConfig};

#[derive(Parser, Debug)]
#[command(name = "fpvlink-router", about = "Routes packets between the radio links and the local processes")]
struct Args {
    /// Router configuration file
    #[arg(short, long, default_value = "/etc/fpvlink/router.toml")]
    config: PathBuf,

    /// Overrides the vehicle model path from the configuration
    #[arg(short, long)]
    model: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = RouterConfig::load(&args.config)?;
    if let Some(model) = args.model {
        config.model_path = model;
    }

    let store = TomlModelStore::new(&config.model_path);
    let model = store
        .load()
        .with_context(|| format!("loading vehicle model {}", config.model_path.display()))?;
    info!(
        "Loaded model for vehicle {} ({} radio links, {} interfaces)",
        model.vehicle_id,
        model.radio_links.len(),
        model.radio_interfaces.len()
    );

    let mut interfaces = RadioInterfaces::new();
    for binding in &config.radios {
        let params = model
            .radio_interfaces
            .get(binding.interface)
            .with_context(|| format!("radio {} bound to unknown interface {}", binding.name, binding.interface))?
            .clone();
        let radio = UdpRadio::bind(&binding.name, binding.local, binding.peer)
            .await
            .with_context(|| format!("binding radio {}", binding.name))?;
        interfaces.add(params, Box::new(radio));
    }
    if interfaces.is_empty() {
        warn!("No radio interfaces configured, running IPC only");
    }

    let transport = FifoTransport::new(&config.ipc.dir)
        .with_context(|| format!("creating IPC directory {}", config.ipc.dir.display()))?;
    let hub = IpcHub::new(transport);

    let mut router = Router::new(config, model, store, hub, interfaces)?;
    router.open_channels()?;
    router
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Can't listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
