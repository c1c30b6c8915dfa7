//! Residual producer: CPU-synthesised detail uploaded into GPU slots.
//!
//! Residual tiles carry fractal Brownian motion over simplex noise, sampled at
//! each texel centre in face space. They exist only down to a maximum level;
//! finer elevation tiles fall back to a neutral residual.

use std::rc::Rc;

use noise::{NoiseFn, Simplex};
use planetile_tile::{ProducerCore, TileCache, TileError, TileKey, TileProducer, TileSlot};

use crate::dispatch::TileUploader;
use crate::terrain::TerrainNode;
use crate::uniforms::{TileGeometry, tile_offset};

/// Border of residual tiles, matching the elevation tiles they feed.
pub const RESIDUAL_BORDER: u32 = 2;

/// Multi-octave noise parameters for residual tiles.
#[derive(Clone, Debug, PartialEq)]
pub struct ResidualParams {
    pub seed: u64,
    pub octaves: u32,
    /// Frequency multiplier between successive octaves.
    pub lacunarity: f64,
    /// Amplitude multiplier between successive octaves.
    pub persistence: f64,
    /// Frequency of the first octave, in cycles per world unit.
    pub base_frequency: f64,
    /// Amplitude of the first octave.
    pub amplitude: f64,
}

impl Default for ResidualParams {
    fn default() -> Self {
        Self {
            seed: 0,
            octaves: 6,
            lacunarity: 2.0,
            persistence: 0.5,
            base_frequency: 0.0001,
            amplitude: 250.0,
        }
    }
}

/// Samples fBm residual heights.
pub struct ResidualSampler {
    noise: Simplex,
    params: ResidualParams,
}

impl ResidualSampler {
    pub fn new(params: ResidualParams) -> Self {
        let noise = Simplex::new(params.seed as u32);
        Self { noise, params }
    }

    /// Residual height at face-space position `(x, y)`.
    pub fn sample(&self, x: f64, y: f64) -> f64 {
        let mut total = 0.0;
        let mut frequency = self.params.base_frequency;
        let mut amplitude = self.params.amplitude;

        for _ in 0..self.params.octaves {
            total += self.noise.get([x * frequency, y * frequency]) * amplitude;
            frequency *= self.params.lacunarity;
            amplitude *= self.params.persistence;
        }

        total
    }

    /// Upper bound of `|sample|`: the geometric sum of octave amplitudes.
    pub fn max_amplitude(&self) -> f64 {
        let mut sum = 0.0;
        let mut amp = self.params.amplitude;
        for _ in 0..self.params.octaves {
            sum += amp;
            amp *= self.params.persistence;
        }
        sum
    }

    pub fn params(&self) -> &ResidualParams {
        &self.params
    }
}

/// Produces residual tiles up to `max_level` into a GPU-backed cache.
pub struct ResidualProducer {
    core: ProducerCore,
    terrain: Rc<TerrainNode>,
    uploader: Rc<dyn TileUploader>,
    sampler: ResidualSampler,
    max_level: u32,
}

impl ResidualProducer {
    /// Fails with `InvalidStorage` if storage 0 of `cache` is not GPU-backed.
    pub fn new(
        cache: Rc<TileCache>,
        terrain: Rc<TerrainNode>,
        uploader: Rc<dyn TileUploader>,
        params: ResidualParams,
        max_level: u32,
    ) -> Result<Self, TileError> {
        let is_gpu = cache.with_storage(0, |s| s.as_gpu().is_some()).unwrap_or(false);
        if !is_gpu {
            return Err(TileError::InvalidStorage(format!(
                "residual cache '{}' must use a GPU tile storage",
                cache.name()
            )));
        }
        let tile_width = cache.tile_size();
        if tile_width <= 2 * RESIDUAL_BORDER + 1 {
            return Err(TileError::InvalidParameter(format!(
                "residual tile width {tile_width} leaves no texels inside border {RESIDUAL_BORDER}"
            )));
        }
        Ok(Self {
            core: ProducerCore::new("residual", cache),
            terrain,
            uploader,
            sampler: ResidualSampler::new(params),
            max_level,
        })
    }

    /// Deepest level this producer has tiles for.
    #[must_use]
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    #[must_use]
    pub fn sampler(&self) -> &ResidualSampler {
        &self.sampler
    }

    /// Texels of tile `(level, x, y)`, row-major, `channels` floats each with the
    /// residual in the first.
    pub fn compute_texels(&self, level: u32, x: u32, y: u32, channels: u32) -> Vec<f32> {
        let width = self.tile_size(level);
        let geometry = TileGeometry::new(
            width,
            RESIDUAL_BORDER,
            level,
            self.terrain.quad_root_size,
            2,
        );
        let offset = tile_offset(level, x, y, self.terrain.quad_root_size, self.terrain.body.size);
        let (sd_x, sd_y) = (geometry.tile_sd.x, geometry.tile_sd.y);
        let w = f64::from(width);

        let mut texels = vec![0.0; (width * width * channels) as usize];
        for j in 0..width {
            let v = (f64::from(j) + 0.5) / w * sd_y - sd_x;
            for i in 0..width {
                let u = (f64::from(i) + 0.5) / w * sd_y - sd_x;
                let height = self
                    .sampler
                    .sample(offset.x + u * offset.z, offset.y + v * offset.z);
                texels[((j * width + i) * channels) as usize] = height as f32;
            }
        }
        texels
    }
}

impl TileProducer for ResidualProducer {
    fn core(&self) -> &ProducerCore {
        &self.core
    }

    fn border(&self) -> u32 {
        RESIDUAL_BORDER
    }

    fn has_tile(&self, level: u32, x: u32, y: u32) -> bool {
        level <= self.max_level && level < 32 && x < (1 << level) && y < (1 << level)
    }

    fn do_create_tile(&self, level: u32, x: u32, y: u32, slots: &[TileSlot]) -> Result<(), TileError> {
        let key = TileKey::new(self.id(), level, x, y);
        let region = slots
            .first()
            .and_then(TileSlot::as_gpu)
            .ok_or_else(|| TileError::InvalidStorage(format!("residual slot of {key} is not a GPU slot")))?;

        let texels = self.compute_texels(level, x, y, region.format.channels());
        self.uploader
            .upload(region, &texels)
            .map_err(|err| TileError::generation(key, err))?;
        tracing::debug!(tile = %key, "uploaded residual tile");
        Ok(())
    }
}
