//! Identifiers for producers, storages, and quad-tree tiles.

use std::sync::atomic::{AtomicU32, Ordering};

/// Identifies a producer registered with a [`TileCache`](crate::TileCache).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(pub u32);

impl std::fmt::Display for ProducerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "producer#{}", self.0)
    }
}

/// Process-unique identifier of a tile storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u32);

static NEXT_STORAGE_ID: AtomicU32 = AtomicU32::new(1);

impl StorageId {
    /// Allocate a fresh id. Ids are never reused within a process.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for StorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "storage#{}", self.0)
    }
}

/// Uniquely identifies one quad-tree tile of one producer.
///
/// - `level`: quad-tree depth. Level 0 is the root quad covering the whole face.
/// - `x`, `y`: tile coordinates at that level, each in `0..2^level`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    /// Producer that owns the tile.
    pub producer: ProducerId,
    /// Quad-tree level (0 = root).
    pub level: u32,
    /// Horizontal tile coordinate.
    pub x: u32,
    /// Vertical tile coordinate.
    pub y: u32,
}

impl TileKey {
    /// Create a key for the given producer and tile coordinates.
    #[must_use]
    pub const fn new(producer: ProducerId, level: u32, x: u32, y: u32) -> Self {
        Self {
            producer,
            level,
            x,
            y,
        }
    }

    /// Number of tiles along one axis at `level`.
    #[must_use]
    pub fn tiles_per_axis(level: u32) -> u64 {
        1u64 << level.min(63)
    }

    /// Key of the parent tile one level up, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            return None;
        }
        Some(Self::new(self.producer, self.level - 1, self.x / 2, self.y / 2))
    }

    /// The four children one level down, ordered
    /// `[(x, y), (x+1, y), (x, y+1), (x+1, y+1)]` at the child level.
    #[must_use]
    pub fn children(&self) -> [Self; 4] {
        let (cx, cy, l) = (self.x * 2, self.y * 2, self.level + 1);
        [
            Self::new(self.producer, l, cx, cy),
            Self::new(self.producer, l, cx + 1, cy),
            Self::new(self.producer, l, cx, cy + 1),
            Self::new(self.producer, l, cx + 1, cy + 1),
        ]
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}:{}", self.producer, self.level, self.x, self.y)
    }
}
