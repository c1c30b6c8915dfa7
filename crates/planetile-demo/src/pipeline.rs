//! Assembles caches, producers, and the quad tree from a [`Config`].

use std::cell::Cell;
use std::rc::Rc;

use glam::DVec3;
use planetile_config::{Config, SlotFormat};
use planetile_elevation::{
    BodyShape, DispatchError, ElevationCoreProducer, ElevationJob, ResidualParams,
    ResidualProducer, TerrainNode, TerrainQuadTree, TileDispatcher, TileSampler, TileUploader,
    WgpuTileDispatcher,
};
use planetile_tile::{
    GpuRegion, GpuStorageDesc, GpuTileStorage, TileCache, TileError, TileFormat, TileProducer,
};

/// Stands in for the GPU when no adapter is available. Jobs are counted and
/// dropped; slots stay unbacked.
#[derive(Default)]
pub struct HeadlessDispatcher {
    dispatched: Cell<u64>,
    uploaded: Cell<u64>,
}

impl HeadlessDispatcher {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.get()
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.get()
    }
}

impl TileDispatcher for HeadlessDispatcher {
    fn dispatch_elevation(&self, job: &ElevationJob<'_>) -> Result<(), DispatchError> {
        self.dispatched.set(self.dispatched.get() + 1);
        tracing::trace!(tile = %job.key, residual = job.residual.is_some(), "headless dispatch");
        Ok(())
    }
}

impl TileUploader for HeadlessDispatcher {
    fn upload(&self, target: &GpuRegion, texels: &[f32]) -> Result<(), DispatchError> {
        let expected = target.width as usize * target.width as usize * target.format.channels() as usize;
        if texels.len() != expected {
            return Err(DispatchError::SizeMismatch {
                expected,
                found: texels.len(),
            });
        }
        self.uploaded.set(self.uploaded.get() + 1);
        Ok(())
    }
}

/// Outcome of one [`Pipeline::tick`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub quads: usize,
    pub acquired: usize,
    pub released: usize,
    /// Deferred tiles generated this tick.
    pub generated: usize,
}

/// Elevation tiles for one terrain face, kept resident for a moving camera.
pub struct Pipeline {
    terrain: Rc<TerrainNode>,
    elevation_cache: Rc<TileCache>,
    residual_cache: Option<Rc<TileCache>>,
    elevation: Rc<dyn TileProducer>,
    tree: TerrainQuadTree,
    sampler: TileSampler,
    headless: Option<Rc<HeadlessDispatcher>>,
    deferred: bool,
    tiles_per_tick: usize,
}

fn tile_format(format: SlotFormat) -> TileFormat {
    match format {
        SlotFormat::R32Float => TileFormat::R32Float,
        SlotFormat::Rg32Float => TileFormat::Rg32Float,
        SlotFormat::Rgba32Float => TileFormat::Rgba32Float,
    }
}

fn gpu_cache(
    name: &str,
    device: Option<&wgpu::Device>,
    desc: GpuStorageDesc,
) -> Result<Rc<TileCache>, TileError> {
    let storage = match device {
        Some(device) => GpuTileStorage::with_device(device, desc)?,
        None => GpuTileStorage::new(desc)?,
    };
    Ok(Rc::new(TileCache::new(name, vec![Box::new(storage)])?))
}

impl Pipeline {
    /// Build every stage. Without a device the storages stay unbacked and a
    /// [`HeadlessDispatcher`] takes the jobs.
    pub fn build(
        config: &Config,
        gpu: Option<(&wgpu::Device, &wgpu::Queue)>,
    ) -> Result<Self, TileError> {
        let body = BodyShape {
            amplitude: config.body.amplitude,
            frequency: config.body.frequency,
            size: config.body.size,
            grid_resolution: config.body.grid_resolution,
        };
        let mut terrain = TerrainNode::new(body);
        if let Some(root) = config.body.quad_root_size {
            terrain = terrain.with_quad_root_size(root);
        }
        let terrain = Rc::new(terrain);

        let format = tile_format(config.elevation.format);
        let tile_width = config.elevation.tile_width;

        let mut headless = None;
        let (dispatcher, uploader): (Rc<dyn TileDispatcher>, Rc<dyn TileUploader>) = match gpu {
            Some((device, queue)) => {
                let wgpu_dispatcher = Rc::new(WgpuTileDispatcher::new(device, queue, format));
                (wgpu_dispatcher.clone(), wgpu_dispatcher)
            }
            None => {
                let fallback = Rc::new(HeadlessDispatcher::default());
                headless = Some(Rc::clone(&fallback));
                (fallback.clone(), fallback)
            }
        };
        let device = gpu.map(|(device, _)| device);

        let (residual_cache, residual) = if config.residual.enabled {
            let cache = gpu_cache(
                "residual",
                device,
                GpuStorageDesc {
                    label: "residual-tiles".into(),
                    tile_width,
                    format: TileFormat::R32Float,
                    capacity: config.cache.residual_capacity,
                },
            )?;
            let params = ResidualParams {
                seed: config.residual.seed,
                octaves: config.residual.octaves,
                lacunarity: config.residual.lacunarity,
                persistence: config.residual.persistence,
                base_frequency: config.residual.base_frequency,
                amplitude: config.residual.amplitude,
            };
            let producer: Rc<dyn TileProducer> = Rc::new(ResidualProducer::new(
                Rc::clone(&cache),
                Rc::clone(&terrain),
                uploader,
                params,
                config.residual.max_level,
            )?);
            (Some(cache), Some(producer))
        } else {
            (None, None)
        };

        let elevation_cache = gpu_cache(
            "elevation",
            device,
            GpuStorageDesc {
                label: "elevation-tiles".into(),
                tile_width,
                format,
                capacity: config.cache.capacity,
            },
        )?;
        let elevation: Rc<dyn TileProducer> = Rc::new(ElevationCoreProducer::new(
            Rc::clone(&elevation_cache),
            Rc::clone(&terrain),
            dispatcher,
            residual,
        )?);

        let tree = TerrainQuadTree::new(
            Rc::clone(&terrain),
            config.quadtree.max_level,
            config.quadtree.split_factor,
        );
        let sampler = TileSampler::new(Rc::clone(&elevation)).deferred(config.cache.deferred);

        tracing::info!(
            gpu = gpu.is_some(),
            tile_width,
            ?format,
            residual = residual_cache.is_some(),
            deferred = config.cache.deferred,
            "pipeline built"
        );

        Ok(Self {
            terrain,
            elevation_cache,
            residual_cache,
            elevation,
            tree,
            sampler,
            headless,
            deferred: config.cache.deferred,
            tiles_per_tick: config.cache.tiles_per_tick,
        })
    }

    pub fn terrain(&self) -> &TerrainNode {
        &self.terrain
    }

    pub fn elevation_cache(&self) -> &Rc<TileCache> {
        &self.elevation_cache
    }

    pub fn residual_cache(&self) -> Option<&Rc<TileCache>> {
        self.residual_cache.as_ref()
    }

    pub fn headless(&self) -> Option<&HeadlessDispatcher> {
        self.headless.as_deref()
    }

    pub fn sampler(&self) -> &TileSampler {
        &self.sampler
    }

    /// Refit the quad tree to `camera`, bring the sampled tiles in line, and
    /// run the deferred generation budget.
    pub fn tick(&mut self, camera: DVec3) -> Result<TickReport, TileError> {
        self.tree.update(camera);
        let sampled = self.sampler.update(&self.tree)?;
        let generated = if self.deferred {
            self.elevation.update(self.tiles_per_tick)?
        } else {
            0
        };
        Ok(TickReport {
            quads: self.tree.quads().len(),
            acquired: sampled.acquired,
            released: sampled.released,
            generated,
        })
    }

    pub fn log_stats(&self) {
        let caches = std::iter::once(&self.elevation_cache).chain(self.residual_cache.as_ref());
        for cache in caches {
            let stats = cache.stats();
            tracing::info!(
                cache = cache.name(),
                used = stats.used,
                unused = stats.unused,
                pending = stats.pending,
                hits = stats.hits,
                misses = stats.misses,
                evictions = stats.evictions,
                generated = stats.generated,
                "cache stats"
            );
        }
    }

    /// Release every sampled tile and evict everything unused. Elevation tiles
    /// go first so their residual leases are returned before the residual cache
    /// is emptied. Returns the number of evicted tiles.
    pub fn shutdown(&mut self) -> Result<usize, TileError> {
        self.sampler.release_all()?;
        let mut evicted = self.elevation_cache.evict_unused()?;
        if let Some(cache) = &self.residual_cache {
            evicted += cache.evict_unused()?;
        }
        Ok(evicted)
    }
}
