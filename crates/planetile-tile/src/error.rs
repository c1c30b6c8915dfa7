//! Error types for the tile pipeline.

use crate::key::{StorageId, TileKey};

/// Coarse classification of a [`TileError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid producer or storage setup. Raised at construction; fatal.
    Configuration,
    /// Storage exhausted with nothing evictable. A cache sizing bug.
    Capacity,
    /// An upstream tile that should exist could not be retrieved.
    DependencyLookup,
    /// Misuse of the cache or storage API, or a failed generation backend.
    Internal,
}

/// Errors raised by tile storages, caches, and producers.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    /// A producer configuration invariant does not hold.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A storage is not of the concrete kind a producer requires.
    #[error("invalid storage: {0}")]
    InvalidStorage(String),

    /// A storage could not be built with the requested layout.
    #[error("invalid storage configuration: {0}")]
    InvalidConfiguration(String),

    /// Every slot of a storage is issued and no tile can be evicted.
    #[error("{storage} exhausted: all {capacity} slots are held")]
    CapacityExceeded {
        storage: StorageId,
        capacity: usize,
    },

    /// A dependency tile could not be located.
    #[error("missing tile {key}: {reason}")]
    MissingTile { key: TileKey, reason: String },

    /// A tile was requested while it was being generated further up the stack.
    #[error("tile {0} was requested while it is being generated")]
    DependencyCycle(TileKey),

    /// A slot was released to a storage that did not issue it.
    #[error("slot {index} of {owner} released to {storage}")]
    ForeignSlot {
        owner: StorageId,
        storage: StorageId,
        index: u32,
    },

    /// A slot was released while already free.
    #[error("slot {index} of {storage} is not in use")]
    SlotNotLive { storage: StorageId, index: u32 },

    /// A tile was released more times than it was acquired.
    #[error("tile {0} is not held")]
    NotHeld(TileKey),

    /// The producer's generation backend failed.
    #[error("generation of tile {key} failed")]
    Generation {
        key: TileKey,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TileError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter(_) | Self::InvalidStorage(_) | Self::InvalidConfiguration(_) => {
                ErrorKind::Configuration
            }
            Self::CapacityExceeded { .. } => ErrorKind::Capacity,
            Self::MissingTile { .. } | Self::DependencyCycle(_) => ErrorKind::DependencyLookup,
            Self::ForeignSlot { .. }
            | Self::SlotNotLive { .. }
            | Self::NotHeld(_)
            | Self::Generation { .. } => ErrorKind::Internal,
        }
    }

    /// Shorthand for a [`TileError::MissingTile`].
    pub fn missing(key: TileKey, reason: impl Into<String>) -> Self {
        Self::MissingTile {
            key,
            reason: reason.into(),
        }
    }

    /// Wrap a backend error raised while generating `key`.
    pub fn generation(
        key: TileKey,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Generation {
            key,
            source: Box::new(source),
        }
    }
}
