//! The elevation producer: one GPU kernel dispatch per tile, optionally
//! sampling an upstream residual tile.

use std::rc::Rc;

use planetile_tile::{
    GpuRegion, ProducerCore, StorageKind, TileCache, TileError, TileKey, TileLease, TileProducer,
    TileSlot, check_tile_alignment,
};

use crate::dispatch::{ElevationJob, TileDispatcher};
use crate::terrain::{ParamProvider, TerrainNode};
use crate::uniforms::{
    ElevationUniforms, NEUTRAL_RESIDUAL_OSH, TileGeometry, residual_osh, tile_offset,
};

/// Ghost texels around every elevation tile.
pub const ELEVATION_BORDER: u32 = 2;

/// Produces elevation tiles into a GPU-backed cache.
pub struct ElevationCoreProducer {
    core: ProducerCore,
    terrain: Rc<TerrainNode>,
    dispatcher: Rc<dyn TileDispatcher>,
    residual: Option<Rc<dyn TileProducer>>,
    params: Option<Rc<dyn ParamProvider>>,
}

impl ElevationCoreProducer {
    /// Validate the tile layout and wire the producer.
    ///
    /// Fails with `InvalidParameter` when `tile_width - 2 * border - 1` is not a
    /// multiple of `grid_resolution - 1` or the residual tile width differs, and
    /// with `InvalidStorage` when this cache's or the residual's storage 0 is
    /// not GPU-backed.
    pub fn new(
        cache: Rc<TileCache>,
        terrain: Rc<TerrainNode>,
        dispatcher: Rc<dyn TileDispatcher>,
        residual: Option<Rc<dyn TileProducer>>,
    ) -> Result<Self, TileError> {
        let tile_width = cache.tile_size();
        check_tile_alignment(tile_width, ELEVATION_BORDER, terrain.body.grid_resolution)?;
        if tile_width <= 2 * ELEVATION_BORDER + 1 {
            return Err(TileError::InvalidParameter(format!(
                "tile width {tile_width} leaves no texels inside border {ELEVATION_BORDER}"
            )));
        }

        if let Some(residual) = &residual {
            let residual_width = residual.tile_size(0);
            if residual_width != tile_width {
                return Err(TileError::InvalidParameter(format!(
                    "residual tile size {residual_width} must match elevation tile size {tile_width}"
                )));
            }
            if residual.cache().storage_kind(0) != Some(StorageKind::Gpu) {
                return Err(TileError::InvalidStorage(format!(
                    "residual storage of '{}' must be a GPU tile storage",
                    residual.name()
                )));
            }
        }

        if cache.storage_kind(0) != Some(StorageKind::Gpu) {
            return Err(TileError::InvalidStorage(format!(
                "elevation cache '{}' must use a GPU tile storage",
                cache.name()
            )));
        }

        tracing::info!(
            cache = cache.name(),
            tile_width,
            grid = terrain.body.grid_resolution,
            residual = residual.is_some(),
            "elevation producer ready"
        );

        Ok(Self {
            core: ProducerCore::new("elevation", cache),
            terrain,
            dispatcher,
            residual,
            params: None,
        })
    }

    /// Supply extra kernel parameters from `provider` on every tile.
    #[must_use]
    pub fn with_param_provider(mut self, provider: Rc<dyn ParamProvider>) -> Self {
        self.params = Some(provider);
        self
    }

    #[must_use]
    pub fn terrain(&self) -> &TerrainNode {
        &self.terrain
    }

    #[must_use]
    pub fn residual(&self) -> Option<&Rc<dyn TileProducer>> {
        self.residual.as_ref()
    }

    /// Uniforms for tile `(level, x, y)` given the residual slot bound to it.
    pub fn uniforms(&self, level: u32, x: u32, y: u32, tile_width: u32, residual: bool) -> ElevationUniforms {
        let body = &self.terrain.body;
        let geometry = TileGeometry::new(
            tile_width,
            ELEVATION_BORDER,
            level,
            self.terrain.quad_root_size,
            body.grid_resolution,
        );
        let offset = tile_offset(level, x, y, self.terrain.quad_root_size, body.size);
        let osh = if residual {
            residual_osh(tile_width)
        } else {
            NEUTRAL_RESIDUAL_OSH
        };
        let uniforms = ElevationUniforms::new(
            &geometry,
            offset,
            body.amplitude,
            body.frequency,
            self.terrain.face_to_local,
            osh,
        );
        match &self.params {
            Some(provider) => uniforms.with_extra(provider.extra_params()),
            None => uniforms,
        }
    }

    /// The residual slot for `key`, or `None` for a neutral residual.
    fn residual_region(&self, key: TileKey) -> Result<Option<GpuRegion>, TileError> {
        let Some(residual) = &self.residual else {
            return Ok(None);
        };
        if !residual.has_tile(key.level, key.x, key.y) {
            tracing::warn!(
                tile = %key,
                residual = residual.name(),
                "residual producer has no tile here, using a neutral residual"
            );
            return Ok(None);
        }
        let tile = residual
            .find_tile(key.level, key.x, key.y, false, true)?
            .ok_or_else(|| TileError::missing(key, "residual tile lookup failed"))?;
        let region = tile
            .slot(0)
            .and_then(TileSlot::as_gpu)
            .ok_or_else(|| TileError::missing(key, "residual tile has no GPU slot"))?;
        Ok(Some(region.clone()))
    }
}

impl TileProducer for ElevationCoreProducer {
    fn core(&self) -> &ProducerCore {
        &self.core
    }

    fn border(&self) -> u32 {
        ELEVATION_BORDER
    }

    fn acquire_dependencies(&self, level: u32, x: u32, y: u32) -> Result<Vec<TileLease>, TileError> {
        match &self.residual {
            Some(residual) if residual.has_tile(level, x, y) => {
                Ok(vec![TileLease::acquire(residual, level, x, y)?])
            }
            _ => Ok(Vec::new()),
        }
    }

    fn do_create_tile(&self, level: u32, x: u32, y: u32, slots: &[TileSlot]) -> Result<(), TileError> {
        let key = TileKey::new(self.id(), level, x, y);
        let target = slots
            .first()
            .and_then(TileSlot::as_gpu)
            .ok_or_else(|| TileError::InvalidStorage(format!("elevation slot of {key} is not a GPU slot")))?;

        let residual = self.residual_region(key)?;
        let job = ElevationJob {
            key,
            target,
            residual: residual.as_ref(),
            uniforms: self.uniforms(level, x, y, target.width, residual.is_some()),
        };
        self.dispatcher
            .dispatch_elevation(&job)
            .map_err(|err| TileError::generation(key, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TileUploader;
    use crate::dispatch::tests::RecordingDispatcher;
    use crate::residual::{ResidualParams, ResidualProducer};
    use crate::terrain::BodyShape;
    use planetile_tile::{
        CpuTileStorage, ErrorKind, GpuStorageDesc, GpuTileStorage, Tile, TileFormat, TileState,
    };

    fn gpu_cache(name: &str, width: u32, capacity: usize) -> Rc<TileCache> {
        let storage = GpuTileStorage::new(GpuStorageDesc {
            label: name.into(),
            tile_width: width,
            format: TileFormat::R32Float,
            capacity,
        })
        .unwrap();
        Rc::new(TileCache::new(name, vec![Box::new(storage)]).unwrap())
    }

    fn terrain(grid_resolution: u32) -> Rc<TerrainNode> {
        Rc::new(
            TerrainNode::new(BodyShape {
                grid_resolution,
                size: 6000.0,
                ..Default::default()
            })
            .with_quad_root_size(1000.0),
        )
    }

    fn residual(recorder: &Rc<RecordingDispatcher>, width: u32, max_level: u32) -> Rc<dyn TileProducer> {
        Rc::new(
            ResidualProducer::new(
                gpu_cache("residual", width, 8),
                terrain(5),
                Rc::clone(recorder) as Rc<dyn TileUploader>,
                ResidualParams::default(),
                max_level,
            )
            .unwrap(),
        )
    }

    fn elevation(
        recorder: &Rc<RecordingDispatcher>,
        residual: Option<Rc<dyn TileProducer>>,
    ) -> ElevationCoreProducer {
        ElevationCoreProducer::new(
            gpu_cache("elevation", 21, 4),
            terrain(5),
            Rc::clone(recorder) as Rc<dyn TileDispatcher>,
            residual,
        )
        .unwrap()
    }

    /// Reports a tile it can never find.
    struct LosingProducer {
        core: ProducerCore,
    }

    impl TileProducer for LosingProducer {
        fn core(&self) -> &ProducerCore {
            &self.core
        }

        fn find_tile(&self, _: u32, _: u32, _: u32, _: bool, _: bool) -> Result<Option<Rc<Tile>>, TileError> {
            Ok(None)
        }

        fn do_create_tile(&self, _: u32, _: u32, _: u32, _: &[TileSlot]) -> Result<(), TileError> {
            Ok(())
        }
    }

    struct FixedParams;

    impl ParamProvider for FixedParams {
        fn extra_params(&self) -> [f32; 4] {
            [0.25, 0.5, 0.75, 1.0]
        }
    }

    #[test]
    fn test_construction_follows_alignment() {
        let recorder = Rc::new(RecordingDispatcher::default());
        for width in 6..60u32 {
            for grid in [2, 3, 5, 9, 17] {
                let result = ElevationCoreProducer::new(
                    gpu_cache("elevation", width, 2),
                    terrain(grid),
                    Rc::clone(&recorder) as Rc<dyn TileDispatcher>,
                    None,
                );
                let aligned = (width - 5) % (grid - 1) == 0;
                match result {
                    Ok(_) => assert!(aligned, "{width}/{grid} accepted"),
                    Err(err) => {
                        assert!(!aligned, "{width}/{grid} rejected: {err}");
                        assert_eq!(err.kind(), ErrorKind::Configuration);
                    }
                }
            }
        }
    }

    #[test]
    fn test_border_only_tile_is_rejected() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let err = ElevationCoreProducer::new(
            gpu_cache("elevation", 5, 2),
            terrain(5),
            recorder as Rc<dyn TileDispatcher>,
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, TileError::InvalidParameter(_)));
    }

    #[test]
    fn test_cpu_storage_is_rejected() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let cache = Rc::new(
            TileCache::new("cpu", vec![Box::new(CpuTileStorage::new(21, 1, 2).unwrap())]).unwrap(),
        );
        let err = ElevationCoreProducer::new(cache, terrain(5), recorder as Rc<dyn TileDispatcher>, None)
            .err()
            .unwrap();
        assert!(matches!(err, TileError::InvalidStorage(_)));
    }

    #[test]
    fn test_residual_tile_size_must_match() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let residual = residual(&recorder, 25, 2);
        let err = ElevationCoreProducer::new(
            gpu_cache("elevation", 21, 2),
            terrain(5),
            recorder as Rc<dyn TileDispatcher>,
            Some(residual),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TileError::InvalidParameter(_)));
    }

    #[test]
    fn test_residual_storage_must_be_gpu() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let cpu_cache = Rc::new(
            TileCache::new("cpu", vec![Box::new(CpuTileStorage::new(21, 1, 2).unwrap())]).unwrap(),
        );
        let residual: Rc<dyn TileProducer> = Rc::new(LosingProducer {
            core: ProducerCore::new("cpu-residual", cpu_cache),
        });
        let err = ElevationCoreProducer::new(
            gpu_cache("elevation", 21, 2),
            terrain(5),
            recorder as Rc<dyn TileDispatcher>,
            Some(residual),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TileError::InvalidStorage(_)));
    }

    #[test]
    fn test_tile_without_residual_dispatches_once() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let producer = elevation(&recorder, None);

        let tile = producer.get_tile(0, 0, 0).unwrap();
        let again = producer.get_tile(0, 0, 0).unwrap();
        assert!(Rc::ptr_eq(&tile, &again));
        assert!(tile.is_ready());

        let jobs = recorder.jobs.borrow();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.key, tile.key());
        assert_eq!(job.residual_layer, None);
        assert_eq!(job.uniforms.offset, [-500.0, -500.0, 1000.0, 6000.0]);
        assert_eq!(job.uniforms.residual_osh, [0.0, 0.0, 1.0, 0.0]);
        assert_eq!(job.uniforms.tile_wsd[0], 21.0);
        assert_eq!(job.uniforms.tile_wsd[2], 4.0);
    }

    #[test]
    fn test_residual_tile_is_generated_and_bound() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let residual = residual(&recorder, 21, 3);
        let producer = elevation(&recorder, Some(Rc::clone(&residual)));

        let tile = producer.get_tile(2, 1, 3).unwrap();
        assert_eq!(tile.dependency_count(), 1);
        assert_eq!(recorder.uploads.borrow().len(), 1);

        let upstream = residual.find_tile(2, 1, 3, false, false).unwrap().unwrap();
        let jobs = recorder.jobs.borrow();
        assert_eq!(
            jobs[0].residual_layer,
            Some(upstream.slot(0).unwrap().as_gpu().unwrap().layer)
        );
        let w = 21.0f32;
        assert_eq!(jobs[0].uniforms.residual_osh, [0.25 / w, 0.25 / w, 2.0 / w, 1.0]);
        assert_eq!(residual.cache().users(residual.id(), 2, 1, 3), Some(1));
    }

    #[test]
    fn test_missing_residual_level_falls_back_to_neutral() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let residual = residual(&recorder, 21, 1);
        let producer = elevation(&recorder, Some(residual));

        let tile = producer.get_tile(3, 0, 0).unwrap();
        assert!(tile.is_ready());
        assert_eq!(tile.dependency_count(), 0);
        assert!(recorder.uploads.borrow().is_empty());

        let jobs = recorder.jobs.borrow();
        assert_eq!(jobs[0].residual_layer, None);
        assert!(!jobs[0].uniforms.has_residual());
    }

    #[test]
    fn test_lost_residual_tile_is_a_missing_tile() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let residual: Rc<dyn TileProducer> = Rc::new(LosingProducer {
            core: ProducerCore::new("losing", gpu_cache("losing", 21, 4)),
        });
        let producer = elevation(&recorder, Some(residual));

        let err = producer.get_tile(1, 0, 1).unwrap_err();
        assert!(matches!(err, TileError::MissingTile { .. }));
        assert_eq!(err.kind(), ErrorKind::DependencyLookup);
        assert!(recorder.jobs.borrow().is_empty());
        assert!(!producer.cache().contains(producer.id(), 1, 0, 1));
    }

    #[test]
    fn test_evicting_elevation_releases_residual() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let residual = residual(&recorder, 21, 3);
        let producer = elevation(&recorder, Some(Rc::clone(&residual)));

        let tile = producer.get_tile(1, 1, 1).unwrap();
        producer.put_tile(&tile).unwrap();
        assert_eq!(producer.cache().evict_unused().unwrap(), 1);
        assert_eq!(tile.state(), TileState::Evicted);
        assert_eq!(residual.cache().users(residual.id(), 1, 1, 1), Some(0));

        // Regeneration dispatches again and reuses the still-resident residual.
        let again = producer.get_tile(1, 1, 1).unwrap();
        assert!(again.is_ready());
        assert_eq!(recorder.jobs.borrow().len(), 2);
        assert_eq!(recorder.uploads.borrow().len(), 1);
    }

    #[test]
    fn test_param_provider_fills_extra_block() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let producer = elevation(&recorder, None).with_param_provider(Rc::new(FixedParams));
        producer.get_tile(0, 0, 0).unwrap();
        assert_eq!(recorder.jobs.borrow()[0].uniforms.extra, [0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_uniforms_scale_with_level() {
        let recorder = Rc::new(RecordingDispatcher::default());
        let producer = elevation(&recorder, None);
        let coarse = producer.uniforms(0, 0, 0, 21, false);
        let fine = producer.uniforms(2, 3, 1, 21, false);
        assert_eq!(coarse.tile_wsd[1], 1000.0 / 16.0);
        assert_eq!(fine.tile_wsd[1], 250.0 / 16.0);
        assert_eq!(fine.offset, [250.0, -250.0, 250.0, 6000.0]);
    }
}
