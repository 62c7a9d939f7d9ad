//! Command-line argument parsing for the NetBeams server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// NetBeams command-line arguments.
///
/// CLI values override settings loaded from `ServerConfig.ron`.
#[derive(Parser, Debug)]
#[command(name = "netbeams", about = "NetBeams - a BeamMP compatible game server")]
pub struct CliArgs {
    /// Port to listen on (TCP and UDP).
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum number of players.
    #[arg(long)]
    pub max_players: Option<u32>,

    /// Map path sent to clients.
    #[arg(long)]
    pub map: Option<String>,

    /// Server password.
    #[arg(long)]
    pub password: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (defaults to the working directory).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.general.port = port;
        }
        if let Some(max) = args.max_players {
            self.general.max_players = max;
        }
        if let Some(ref map) = args.map {
            self.general.map = map.clone();
        }
        if let Some(ref password) = args.password {
            self.general.password = password.clone();
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }
}
