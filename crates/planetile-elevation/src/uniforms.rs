//! Tile geometry and the uniform block of the elevation kernel.
//!
//! Geometry is computed in `f64`; [`ElevationUniforms`] is the only place it is
//! narrowed to `f32`.

use bytemuck::{Pod, Zeroable};
use glam::{DMat4, DVec2, DVec4, Vec4};

/// Residual offset/scale/height used when no residual tile is bound.
pub const NEUTRAL_RESIDUAL_OSH: Vec4 = Vec4::new(0.0, 0.0, 1.0, 0.0);

/// Residual offset/scale/height for a bound residual tile of width `tile_width`.
#[must_use]
pub fn residual_osh(tile_width: u32) -> Vec4 {
    let w = tile_width as f32;
    Vec4::new(0.25 / w, 0.25 / w, 2.0 / w, 1.0)
}

/// Per-tile scale factors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileGeometry {
    /// Texel width of the slot, border included.
    pub tile_width: u32,
    /// Texel width of the valid area: `tile_width - (1 + 2 * border)`.
    pub tile_size: u32,
    /// `(tile_width, world units per texel, texels per grid cell, 0)`.
    pub tile_wsd: DVec4,
    /// `(border offset, border scale)` mapping slot UVs to quad coordinates.
    pub tile_sd: DVec2,
}

impl TileGeometry {
    /// Geometry of a `tile_width` slot at `level` of a quad tree whose root
    /// spans `root_quad_size`. `tile_width` must exceed `2 * border + 1` and
    /// `grid_resolution` must be at least 2.
    #[must_use]
    pub fn new(tile_width: u32, border: u32, level: u32, root_quad_size: f64, grid_resolution: u32) -> Self {
        let tile_size = tile_width - (1 + 2 * border);
        let width = f64::from(tile_width);
        let size = f64::from(tile_size);
        let tile_wsd = DVec4::new(
            width,
            root_quad_size / level_scale(level) / size,
            size / f64::from(grid_resolution - 1),
            0.0,
        );
        let border = f64::from(border);
        let sd_x = (0.5 + border) / (width - 1.0 - border * 2.0);
        Self {
            tile_width,
            tile_size,
            tile_wsd,
            tile_sd: DVec2::new(sd_x, 1.0 + sd_x * 2.0),
        }
    }
}

/// World-space offset of tile `(level, x, y)`:
/// `(left, bottom, quad size, body size)`.
#[must_use]
pub fn tile_offset(level: u32, x: u32, y: u32, root_quad_size: f64, body_size: f64) -> DVec4 {
    let scale = level_scale(level);
    DVec4::new(
        (f64::from(x) / scale - 0.5) * root_quad_size,
        (f64::from(y) / scale - 0.5) * root_quad_size,
        root_quad_size / scale,
        body_size,
    )
}

fn level_scale(level: u32) -> f64 {
    2f64.powi(level as i32)
}

/// Uniform block of the elevation kernel. Layout matches `ElevationUniforms`
/// in [`ELEVATION_SHADER_SOURCE`](crate::ELEVATION_SHADER_SOURCE).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ElevationUniforms {
    pub local_to_world: [[f32; 4]; 4],
    pub tile_wsd: [f32; 4],
    pub tile_sd: [f32; 2],
    pub amplitude: f32,
    pub frequency: f32,
    pub offset: [f32; 4],
    pub residual_osh: [f32; 4],
    pub extra: [f32; 4],
}

static_assertions::assert_eq_size!(ElevationUniforms, [u8; 144]);

impl ElevationUniforms {
    /// Narrow the tile parameters to GPU precision.
    #[must_use]
    pub fn new(
        geometry: &TileGeometry,
        offset: DVec4,
        amplitude: f64,
        frequency: f64,
        local_to_world: DMat4,
        residual_osh: Vec4,
    ) -> Self {
        Self {
            local_to_world: local_to_world.as_mat4().to_cols_array_2d(),
            tile_wsd: geometry.tile_wsd.as_vec4().to_array(),
            tile_sd: geometry.tile_sd.as_vec2().to_array(),
            amplitude: amplitude as f32,
            frequency: frequency as f32,
            offset: offset.as_vec4().to_array(),
            residual_osh: residual_osh.to_array(),
            extra: [0.0; 4],
        }
    }

    #[must_use]
    pub fn with_extra(mut self, extra: [f32; 4]) -> Self {
        self.extra = extra;
        self
    }

    /// Whether a residual tile contributes to this tile.
    #[must_use]
    pub fn has_residual(&self) -> bool {
        self.residual_osh[3] != 0.0
    }
}
