//! Configuration for the planetile pipeline.
//!
//! Settings persist to disk as `config.ron` and can be overridden from the
//! command line. Missing sections and fields fall back to their defaults.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    BodyConfig, CacheConfig, Config, DebugConfig, ElevationConfig, FileSinkConfig, QuadtreeConfig,
    ResidualConfig, SlotFormat, default_config_dir,
};
pub use error::ConfigError;
