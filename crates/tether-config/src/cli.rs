//! Command-line argument parsing for hosts embedding Tether.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tether command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Tick-synchronized state replication")]
pub struct CliArgs {
    /// Simulation tick rate (Hz).
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Ticks between server state sends.
    #[arg(long)]
    pub send_rate: Option<u8>,

    /// Maximum connected players.
    #[arg(long)]
    pub max_players: Option<u8>,

    /// Largest unreliable datagram in bytes.
    #[arg(long)]
    pub max_packet_size: Option<usize>,

    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(rate) = args.tick_rate {
            self.simulation.tick_rate = rate;
        }
        if let Some(rate) = args.send_rate {
            self.server.send_rate = rate;
        }
        if let Some(max) = args.max_players {
            self.server.max_players = max;
        }
        if let Some(size) = args.max_packet_size {
            self.network.max_unreliable_packet_size = size;
        }
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
