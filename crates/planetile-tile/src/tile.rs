//! Cached tiles and the leases a tile holds on its upstream dependencies.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::TileError;
use crate::key::TileKey;
use crate::producer::TileProducer;
use crate::slot::TileSlot;

/// Generation state of a tile.
///
/// `Requested → Generating → Ready`, then `Stale` after an invalidation and
/// `Evicted` once its slots went back to the storage. `Evicted` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileState {
    /// Slots allocated, content not generated yet.
    Requested,
    /// The producer is filling the slots.
    Generating,
    /// Content is complete.
    Ready,
    /// Content is outdated and will be regenerated in place on next use.
    Stale,
    /// Slots were returned to the storage.
    Evicted,
}

/// A tile: a key plus one slot per storage of the producing cache.
pub struct Tile {
    key: TileKey,
    slots: Vec<TileSlot>,
    state: Cell<TileState>,
    dependencies: RefCell<Vec<TileLease>>,
}

impl Tile {
    pub(crate) fn new(key: TileKey, slots: Vec<TileSlot>) -> Self {
        Self {
            key,
            slots,
            state: Cell::new(TileState::Requested),
            dependencies: RefCell::new(Vec::new()),
        }
    }

    /// Cache key of this tile.
    #[must_use]
    pub fn key(&self) -> TileKey {
        self.key
    }

    /// Quad-tree level.
    #[must_use]
    pub fn level(&self) -> u32 {
        self.key.level
    }

    /// Column within the level.
    #[must_use]
    pub fn x(&self) -> u32 {
        self.key.x
    }

    /// Row within the level.
    #[must_use]
    pub fn y(&self) -> u32 {
        self.key.y
    }

    /// All slots, in storage order.
    #[must_use]
    pub fn slots(&self) -> &[TileSlot] {
        &self.slots
    }

    /// The slot allocated from storage `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&TileSlot> {
        self.slots.get(index)
    }

    /// Current generation state.
    #[must_use]
    pub fn state(&self) -> TileState {
        self.state.get()
    }

    /// Whether the content is complete.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.get() == TileState::Ready
    }

    /// Number of upstream tiles this tile currently holds.
    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.dependencies.borrow().len()
    }

    pub(crate) fn set_state(&self, state: TileState) {
        self.state.set(state);
    }

    pub(crate) fn add_dependencies(&self, leases: Vec<TileLease>) {
        self.dependencies.borrow_mut().extend(leases);
    }

    /// Release every held lease. Must not be called while the owning cache is borrowed.
    pub(crate) fn release_dependencies(&self) -> Result<(), TileError> {
        let leases = std::mem::take(&mut *self.dependencies.borrow_mut());
        let mut result = Ok(());
        for lease in leases {
            if let Err(err) = lease.release() {
                tracing::warn!(tile = %self.key, error = %err, "failed to release dependency");
                result = Err(err);
            }
        }
        result
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("key", &self.key)
            .field("state", &self.state.get())
            .field("slots", &self.slots.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// A reference held on an upstream producer's tile.
///
/// The lease keeps the upstream tile's reference count above zero, so it cannot
/// be evicted while the dependent tile exists.
pub struct TileLease {
    producer: Weak<dyn TileProducer>,
    tile: Rc<Tile>,
}

impl TileLease {
    /// Wrap a tile acquired from `producer` (via [`TileProducer::get_tile`]).
    pub fn new(producer: &Rc<dyn TileProducer>, tile: Rc<Tile>) -> Self {
        Self {
            producer: Rc::downgrade(producer),
            tile,
        }
    }

    /// Acquire `(level, x, y)` from `producer` and hold it.
    pub fn acquire(
        producer: &Rc<dyn TileProducer>,
        level: u32,
        x: u32,
        y: u32,
    ) -> Result<Self, TileError> {
        let tile = producer.get_tile(level, x, y)?;
        Ok(Self::new(producer, tile))
    }

    /// The held tile.
    #[must_use]
    pub fn tile(&self) -> &Rc<Tile> {
        &self.tile
    }

    /// Give the tile back to its producer. A dropped producer is ignored.
    pub fn release(self) -> Result<(), TileError> {
        match self.producer.upgrade() {
            Some(producer) => producer.put_tile(&self.tile),
            None => Ok(()),
        }
    }
}
