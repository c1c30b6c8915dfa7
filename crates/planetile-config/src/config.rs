//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Tile cache sizing.
    pub cache: CacheConfig,
    /// Elevation tile layout.
    pub elevation: ElevationConfig,
    /// Residual detail synthesis.
    pub residual: ResidualConfig,
    /// Shape of the body the terrain covers.
    pub body: BodyConfig,
    /// Quad-tree subdivision.
    pub quadtree: QuadtreeConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Tile cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Slots of the elevation cache.
    pub capacity: usize,
    /// Slots of the residual cache.
    pub residual_capacity: usize,
    /// Deferred tiles generated per update tick.
    pub tiles_per_tick: usize,
    /// Request tiles and generate them on the tick instead of on demand.
    pub deferred: bool,
}

/// Texel format of elevation slots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SlotFormat {
    R32Float,
    Rg32Float,
    Rgba32Float,
}

/// Elevation tile configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ElevationConfig {
    /// Slot width in texels, border included.
    pub tile_width: u32,
    /// Slot texel format.
    pub format: SlotFormat,
}

/// Residual producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResidualConfig {
    /// Wire a residual producer into the elevation producer.
    pub enabled: bool,
    /// Deepest level that has residual tiles.
    pub max_level: u32,
    /// Noise seed.
    pub seed: u64,
    /// Number of noise octaves.
    pub octaves: u32,
    /// Frequency multiplier between octaves.
    pub lacunarity: f64,
    /// Amplitude multiplier between octaves.
    pub persistence: f64,
    /// Frequency of the first octave per world unit.
    pub base_frequency: f64,
    /// Amplitude of the first octave.
    pub amplitude: f64,
}

/// Body shape configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BodyConfig {
    /// Height scale of the elevation noise.
    pub amplitude: f64,
    /// Base frequency of the elevation noise.
    pub frequency: f64,
    /// Body radius in world units.
    pub size: f64,
    /// Vertices per edge of the terrain grid mesh.
    pub grid_resolution: u32,
    /// World extent of the level-0 quad. `None` uses twice the body size.
    pub quad_root_size: Option<f64>,
}

/// Quad-tree configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuadtreeConfig {
    /// Deepest subdivision level.
    pub max_level: u32,
    /// A quad splits while the camera is closer than `split_factor * quad size`.
    pub split_factor: f64,
}

/// A log file receiving a subset of log categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileSinkConfig {
    /// File name prefix; the sink writes `<prefix>.log`.
    pub prefix: String,
    /// Category names routed to this file (e.g. "Core", "Terrain").
    pub categories: Vec<String>,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            prefix: "planetile".to_string(),
            categories: Vec::new(),
        }
    }
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Per-category log files.
    pub file_sinks: Vec<FileSinkConfig>,
    /// Log cache statistics every this many ticks (0 disables).
    pub stats_interval: u32,
}

// --- Default implementations ---

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            residual_capacity: 64,
            tiles_per_tick: 8,
            deferred: false,
        }
    }
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            tile_width: 101,
            format: SlotFormat::R32Float,
        }
    }
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_level: 4,
            seed: 0,
            octaves: 6,
            lacunarity: 2.0,
            persistence: 0.5,
            base_frequency: 0.0001,
            amplitude: 250.0,
        }
    }
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            amplitude: 8000.0,
            frequency: 1.0,
            size: 6_360_000.0,
            grid_resolution: 25,
            quad_root_size: None,
        }
    }
}

impl Default for QuadtreeConfig {
    fn default() -> Self {
        Self {
            max_level: 6,
            split_factor: 2.0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            file_sinks: Vec::new(),
            stats_interval: 60,
        }
    }
}

/// Default config directory: `<platform config dir>/planetile`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("planetile"))
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

    /// Reject settings no pipeline can be built from. Tile layout alignment is
    /// checked by the producers themselves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(invalid("cache.capacity", "must be at least 1"));
        }
        if self.residual.enabled && self.cache.residual_capacity == 0 {
            return Err(invalid("cache.residual_capacity", "must be at least 1 with residuals enabled"));
        }
        if self.body.grid_resolution < 2 {
            return Err(invalid("body.grid_resolution", "must be at least 2"));
        }
        if !(self.body.size > 0.0) {
            return Err(invalid("body.size", "must be positive"));
        }
        if let Some(root) = self.body.quad_root_size
            && !(root > 0.0)
        {
            return Err(invalid("body.quad_root_size", "must be positive"));
        }
        if self.quadtree.max_level > 24 {
            return Err(invalid("quadtree.max_level", "must be at most 24"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
