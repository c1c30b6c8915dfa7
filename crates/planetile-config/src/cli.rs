//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Planetile command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "planetile", about = "Planet terrain tile pipeline")]
pub struct CliArgs {
    /// Elevation cache capacity in tiles.
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Elevation slot width in texels, border included.
    #[arg(long)]
    pub tile_width: Option<u32>,

    /// Terrain grid mesh resolution.
    #[arg(long)]
    pub grid_resolution: Option<u32>,

    /// Deepest quad-tree level.
    #[arg(long)]
    pub max_level: Option<u32>,

    /// Disable the residual producer.
    #[arg(long)]
    pub no_residual: bool,

    /// Generate tiles on the update tick instead of on demand.
    #[arg(long)]
    pub deferred: bool,

    /// Number of update ticks to run.
    #[arg(long, default_value_t = 120)]
    pub ticks: u32,

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
        if let Some(capacity) = args.capacity {
            self.cache.capacity = capacity;
        }
        if let Some(width) = args.tile_width {
            self.elevation.tile_width = width;
        }
        if let Some(grid) = args.grid_resolution {
            self.body.grid_resolution = grid;
        }
        if let Some(level) = args.max_level {
            self.quadtree.max_level = level;
        }
        if args.no_residual {
            self.residual.enabled = false;
        }
        if args.deferred {
            self.cache.deferred = true;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
