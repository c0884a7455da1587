//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use nebula_replication::{PredictionConfig, ReplicationConfig, VisibilityConfig};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Network loop settings.
    pub network: NetworkConfig,
    /// Server-side replication.
    pub replication: ReplicationConfig,
    /// Per-client visibility.
    pub visibility: VisibilityConfig,
    /// Client-side prediction.
    pub prediction: PredictionConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Tick rate for network updates (Hz).
    pub net_tick_rate: u32,
    /// Clients the headless demo connects over loopback.
    pub clients: u32,
    /// Entities the headless demo spawns.
    pub entities: u32,
    /// Ticks a client input spends in flight before the server applies it.
    pub input_delay_ticks: u32,
    /// Probability that an update-channel packet is lost (0.0 - 1.0).
    pub packet_loss: f64,
    /// Probability that the server's result for an input deviates from
    /// the client's prediction (0.0 - 1.0).
    pub divergence_chance: f64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Ticks the headless demo runs before exiting.
    pub demo_ticks: u64,
    /// Log every visibility transition at info level.
    pub log_visibility_changes: bool,
    /// Seed for the demo's random number generator.
    pub seed: u64,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            net_tick_rate: 20,
            clients: 2,
            entities: 8,
            input_delay_ticks: 2,
            packet_loss: 0.05,
            divergence_chance: 0.02,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            demo_ticks: 200,
            log_visibility_changes: false,
            seed: 0x5eed,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for this runtime, e.g.
    /// `~/.config/nebula-replication` on Linux.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nebula-replication"))
    }

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

    /// Rejects values the runtime cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.net_tick_rate == 0 {
            return Err(ConfigError::Invalid("network.net_tick_rate must be at least 1"));
        }
        for (value, message) in [
            (
                self.network.packet_loss,
                "network.packet_loss must be within 0.0..=1.0",
            ),
            (
                self.network.divergence_chance,
                "network.divergence_chance must be within 0.0..=1.0",
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(message));
            }
        }
        if self.replication.update_interval_ticks == 0 {
            return Err(ConfigError::Invalid(
                "replication.update_interval_ticks must be at least 1",
            ));
        }
        if self.prediction.max_history_frames == 0 {
            return Err(ConfigError::Invalid(
                "prediction.max_history_frames must be at least 1",
            ));
        }
        if self.prediction.error_threshold.is_nan() || self.prediction.error_threshold < 0.0 {
            return Err(ConfigError::Invalid(
                "prediction.error_threshold must be a non-negative number",
            ));
        }
        Ok(())
    }
}
