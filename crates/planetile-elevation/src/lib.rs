//! Elevation tile production: terrain context, the GPU dispatch surface, the
//! elevation and residual producers, and the quad tree that drives them.

mod dispatch;
mod producer;
mod quadtree;
mod residual;
mod terrain;
mod uniforms;

pub use dispatch::{
    DispatchError, ELEVATION_SHADER_SOURCE, ElevationJob, TileDispatcher, TileUploader,
    WgpuTileDispatcher,
};
pub use producer::{ELEVATION_BORDER, ElevationCoreProducer};
pub use quadtree::{SamplerUpdate, TerrainQuad, TerrainQuadTree, TileSampler};
pub use residual::{RESIDUAL_BORDER, ResidualParams, ResidualProducer, ResidualSampler};
pub use terrain::{BodyShape, ParamProvider, TerrainNode};
pub use uniforms::{
    ElevationUniforms, NEUTRAL_RESIDUAL_OSH, TileGeometry, residual_osh, tile_offset,
};
