//! Configuration system for Tether.
//!
//! Provides the tick, send, capacity and buffer settings shared by the server
//! and client engines. Settings persist to disk as RON files, support CLI
//! overrides via clap, hot-reload detection, and forward/backward compatible
//! serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    ClientConfig, Config, DebugConfig, NetworkConfig, ServerConfig, SimulationConfig,
    default_config_dir,
};
pub use error::ConfigError;
