//! Read-only terrain context queried by producers on every tile creation.

use glam::DMat4;

/// Shape constants of the body a terrain belongs to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BodyShape {
    /// Height scale applied to the generated noise.
    pub amplitude: f64,
    /// Base frequency of the generated noise.
    pub frequency: f64,
    /// Body radius in world units.
    pub size: f64,
    /// Vertices per edge of the terrain grid mesh.
    pub grid_resolution: u32,
}

impl Default for BodyShape {
    fn default() -> Self {
        Self {
            amplitude: 8000.0,
            frequency: 1.0,
            size: 6_360_000.0,
            grid_resolution: 25,
        }
    }
}

/// One terrain face: the body it belongs to, the world extent of its level-0
/// quad, and the transform from face space to body-local space.
#[derive(Clone, Debug, PartialEq)]
pub struct TerrainNode {
    pub body: BodyShape,
    /// World-space edge length of the level-0 quad.
    pub quad_root_size: f64,
    pub face_to_local: DMat4,
}

impl TerrainNode {
    /// A face of `body` with the conventional quad root size of `2 * body.size`.
    pub fn new(body: BodyShape) -> Self {
        Self {
            quad_root_size: 2.0 * body.size,
            body,
            face_to_local: DMat4::IDENTITY,
        }
    }

    #[must_use]
    pub fn with_quad_root_size(mut self, size: f64) -> Self {
        self.quad_root_size = size;
        self
    }

    #[must_use]
    pub fn with_face_to_local(mut self, transform: DMat4) -> Self {
        self.face_to_local = transform;
        self
    }

    /// World-space edge length of a quad at `level`.
    #[must_use]
    pub fn quad_size(&self, level: u32) -> f64 {
        self.quad_root_size / f64::from(1u32 << level.min(31))
    }
}

/// Supplies extra shader parameters (colour or texture control constants) to
/// the elevation kernel.
pub trait ParamProvider {
    fn extra_params(&self) -> [f32; 4];
}
