//! Headless driver for the planetile pipeline.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! The camera descends from orbit toward the surface of one terrain face while
//! the quad tree pulls elevation tiles through the cache.
//! Run with `cargo run -p planetile-demo -- --ticks 300 --deferred` to generate
//! tiles on the update budget instead of on demand.

mod pipeline;

use std::path::PathBuf;

use clap::Parser;
use glam::DVec3;
use planetile_config::{CliArgs, Config, default_config_dir};
use planetile_tile::ErrorKind;
use tracing::{debug, error, info, warn};

use pipeline::Pipeline;

fn request_device() -> Option<(wgpu::Device, wgpu::Queue)> {
    pollster::block_on(async {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok()?;
        info!("GPU adapter: {:?}", adapter.get_info().name);
        adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("planetile-device"),
                ..Default::default()
            })
            .await
            .ok()
    })
}

/// Camera position at `tick`: altitude falls geometrically from twice the
/// root quad size to a thousandth of it while the camera drifts across the face.
fn camera_at(tick: u32, ticks: u32, root_size: f64) -> DVec3 {
    let t = f64::from(tick) / f64::from(ticks.saturating_sub(1).max(1));
    let altitude = 2.0 * root_size * 0.0005f64.powf(t);
    DVec3::new((t - 0.5) * 0.5 * root_size, 0.1 * root_size, altitude)
}

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from(".planetile"));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    planetile_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(err) = config.validate() {
        error!("{err}");
        std::process::exit(2);
    }

    let gpu = request_device();
    if gpu.is_none() {
        warn!("No GPU adapter available, running with unbacked tile storages");
    }

    let mut pipeline = match Pipeline::build(&config, gpu.as_ref().map(|(d, q)| (d, q))) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!(kind = ?err.kind(), "Failed to build pipeline: {err}");
            std::process::exit(1);
        }
    };

    let root_size = pipeline.terrain().quad_root_size;
    let stats_interval = config.debug.stats_interval;
    info!(
        ticks = args.ticks,
        root_size,
        capacity = pipeline.elevation_cache().capacity(),
        residual_capacity = ?pipeline.residual_cache().map(|cache| cache.capacity()),
        "Starting descent"
    );

    for tick in 0..args.ticks {
        let camera = camera_at(tick, args.ticks, root_size);
        match pipeline.tick(camera) {
            Ok(report) => debug!(
                tick,
                altitude = camera.z,
                quads = report.quads,
                acquired = report.acquired,
                released = report.released,
                generated = report.generated,
                held = pipeline.sampler().held(),
                "tick"
            ),
            Err(err) if err.kind() == ErrorKind::Capacity => {
                warn!(tick, "{err}; raise cache.capacity or lower quadtree.max_level");
            }
            Err(err) => {
                error!(tick, kind = ?err.kind(), "Tile update failed: {err}");
                break;
            }
        }
        if stats_interval > 0 && tick % stats_interval == 0 {
            pipeline.log_stats();
        }
    }

    match pipeline.shutdown() {
        Ok(evicted) => info!(evicted, "Released all tiles"),
        Err(err) => error!("Shutdown failed: {err}"),
    }
    pipeline.log_stats();

    if let Some(headless) = pipeline.headless() {
        info!(
            dispatched = headless.dispatched(),
            uploaded = headless.uploaded(),
            "Headless jobs"
        );
    }
}
