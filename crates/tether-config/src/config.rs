//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level replication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Tick loop settings shared by server and client.
    pub simulation: SimulationConfig,
    /// Server engine settings.
    pub server: ServerConfig,
    /// Client engine settings.
    pub client: ClientConfig,
    /// Network/transport settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Fixed-timestep settings. Both peers must agree on these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Maximum ticks run in a single frame before the backlog is dropped.
    pub max_ticks_per_frame: u32,
    /// Size in bytes of one encoded player input.
    pub input_size: usize,
    /// Delta-compress consecutive inputs inside an input packet.
    pub delta_inputs: bool,
}

/// Server engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum number of connected players (ids `1..=max_players`).
    pub max_players: u8,
    /// Maximum number of live entities.
    pub max_entities: u16,
    /// Ticks between state sends (1 = every tick).
    pub send_rate: u8,
    /// Depth of the lag-compensation history ring (power of two).
    pub lag_compensation_depth: u16,
    /// Maximum buffered, not yet processed inputs per player.
    pub input_queue_len: usize,
    /// Ticks a player's acknowledgement may lag before a baseline resync.
    pub max_ack_lag: u16,
}

/// Client engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Number of received-state slots (power of two).
    pub state_ring_size: u16,
    /// Maximum unacknowledged inputs kept for replay.
    pub input_buffer_size: usize,
}

/// Network/transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Largest datagram handed to the unreliable path, in bytes.
    pub max_unreliable_packet_size: usize,
    /// Server address for clients.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            max_ticks_per_frame: 5,
            input_size: 16,
            delta_inputs: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_players: 32,
            max_entities: 4096,
            send_rate: 1,
            lag_compensation_depth: 32,
            input_queue_len: 32,
            max_ack_lag: 1024,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            state_ring_size: 32,
            input_buffer_size: 128,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_unreliable_packet_size: 1200,
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Returns the platform config directory for Tether (`<config_dir>/tether`),
/// falling back to the working directory when the platform has none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// --- Validation ---

impl SimulationConfig {
    /// Duration of one tick in seconds.
    pub fn tick_duration_secs(&self) -> f64 {
        1.0 / f64::from(self.tick_rate.max(1))
    }
}

impl Config {
    /// Checks cross-field constraints the engines rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation.tick_rate == 0 {
            return Err(invalid("simulation.tick_rate", "must be at least 1"));
        }
        if self.simulation.max_ticks_per_frame == 0 {
            return Err(invalid("simulation.max_ticks_per_frame", "must be at least 1"));
        }
        if self.simulation.input_size == 0 || self.simulation.input_size > 1024 {
            return Err(invalid("simulation.input_size", "must be in 1..=1024"));
        }
        if self.server.max_players == 0 || self.server.max_players == u8::MAX {
            return Err(invalid("server.max_players", "must be in 1..=254"));
        }
        if self.server.max_entities == 0 {
            return Err(invalid("server.max_entities", "must be at least 1"));
        }
        if self.server.send_rate == 0 {
            return Err(invalid("server.send_rate", "must be at least 1"));
        }
        if !self.server.lag_compensation_depth.is_power_of_two() {
            return Err(invalid(
                "server.lag_compensation_depth",
                "must be a power of two",
            ));
        }
        if self.server.input_queue_len == 0 {
            return Err(invalid("server.input_queue_len", "must be at least 1"));
        }
        if self.server.max_ack_lag == 0 || self.server.max_ack_lag > i16::MAX as u16 {
            return Err(invalid("server.max_ack_lag", "must be in 1..=32767"));
        }
        if !self.client.state_ring_size.is_power_of_two() || self.client.state_ring_size < 2 {
            return Err(invalid(
                "client.state_ring_size",
                "must be a power of two of at least 2",
            ));
        }
        if self.client.input_buffer_size == 0 || self.client.input_buffer_size > 255 {
            return Err(invalid("client.input_buffer_size", "must be in 1..=255"));
        }
        // Room for a diff part header, footer and at least one input chunk.
        let min_packet = 16 + self.simulation.input_size + 8;
        if self.network.max_unreliable_packet_size < min_packet.max(64) {
            return Err(invalid(
                "network.max_unreliable_packet_size",
                format!("must be at least {}", min_packet.max(64)),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("tick_rate: 60"));
        assert!(ron_str.contains("server_port: 7777"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(simulation: (), server: (send_rate: 3))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.client, ClientConfig::default());
        assert_eq!(config.server.send_rate, 3);
        assert_eq!(config.server.max_players, 32);
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.max_players = 8;
        config.client.state_ring_size = 64;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.simulation.tick_rate = 30;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().simulation.tick_rate, 30);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_ring_size_must_be_power_of_two() {
        let mut config = Config::default();
        config.client.state_ring_size = 24;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "client.state_ring_size",
                ..
            }
        ));
    }

    #[test]
    fn test_lag_compensation_depth_must_be_power_of_two() {
        let mut config = Config::default();
        config.server.lag_compensation_depth = 48;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_packet_size_rejected() {
        let mut config = Config::default();
        config.network.max_unreliable_packet_size = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_duration() {
        let sim = SimulationConfig {
            tick_rate: 50,
            ..Default::default()
        };
        assert!((sim.tick_duration_secs() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_default_config_dir_ends_with_tether() {
        let dir = default_config_dir();
        assert!(dir.ends_with("tether") || dir == PathBuf::from("."));
    }
}
