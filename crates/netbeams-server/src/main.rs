//! NetBeams server binary.
//!
//! Configuration is loaded from `ServerConfig.ron` in the config directory
//! (created with defaults on first run) and can be overridden via CLI flags.
//! Run with `cargo run -p netbeams-server -- --port 30814`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use netbeams_config::{CliArgs, Config};
use netbeams_net::{
    BeamMpApi, ConnectionMap, ProtocolSettings, ServerContext, SlotManager, Supervisor, TcpServer,
    UdpServer,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(|| PathBuf::from("."));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = (!config.logging.log_dir.is_empty())
        .then(|| config_dir.join(&config.logging.log_dir));
    netbeams_log::init_logging(log_dir.as_deref(), log_dir.is_some(), Some(&config));

    let config = config.validated()?;
    let settings = ProtocolSettings::from_config(&config)?;

    let slots = Arc::new(SlotManager::from_config(&config));
    let api = Arc::new(BeamMpApi::from_config(&config.auth));
    let ctx = Arc::new(ServerContext {
        settings,
        slots: Arc::clone(&slots),
        auth: api.clone(),
        connections: Arc::new(ConnectionMap::new()),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.general.port));
    let mut supervisor = Supervisor::new();
    supervisor
        .register(slots)
        .register(api)
        .register(Arc::new(TcpServer::new(addr, ctx)))
        .register(Arc::new(UdpServer::new(addr)));

    supervisor.start_all().await?;
    info!(
        name = %config.general.name,
        map = %config.general.map,
        max_players = config.general.max_players,
        "NetBeams server running on port {}",
        config.general.port
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    supervisor.stop_all().await;

    for (name, status) in supervisor.statuses() {
        info!(service = %name, "Final status: {status}");
    }
    Ok(())
}
