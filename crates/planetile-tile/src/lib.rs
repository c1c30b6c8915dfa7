//! Tile storages, the LRU tile cache, and the tile producer contract.

mod cache;
mod error;
mod gpu_storage;
mod key;
mod producer;
mod slot;
mod storage;
mod tile;

pub use cache::{CacheStats, TileCache};
pub use error::{ErrorKind, TileError};
pub use gpu_storage::{GpuStorageDesc, GpuTileStorage, MAX_TILE_LAYERS, MAX_TILE_WIDTH};
pub use key::{ProducerId, StorageId, TileKey};
pub use producer::{ProducerCore, TileProducer, check_tile_alignment};
pub use slot::{CpuRegion, GpuRegion, SlotSurface, TileFormat, TileSlot};
pub use storage::{CpuTileStorage, StorageKind, TileStorage};
pub use tile::{Tile, TileLease, TileState};
