//! Fixed-capacity slot storages.
//!
//! A [`TileStorage`] owns a fixed number of equally sized slots and hands them
//! out from a free list. It never grows: when every slot is issued,
//! [`TileStorage::allocate_slot`] fails and the caller (the
//! [`TileCache`](crate::TileCache)) has to evict a tile first.

use crate::error::TileError;
use crate::gpu_storage::GpuTileStorage;
use crate::key::StorageId;
use crate::slot::{CpuRegion, SlotSurface, TileSlot};

/// Where a storage keeps its slot contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// Host memory buffers.
    Cpu,
    /// Layers of a GPU texture array.
    Gpu,
}

/// A fixed-capacity pool of uniform tile slots.
pub trait TileStorage {
    /// Process-unique id of this storage.
    fn id(&self) -> StorageId;

    /// Backing kind of the slots.
    fn kind(&self) -> StorageKind;

    /// Width of every slot in texels, border included.
    fn tile_size(&self) -> u32;

    /// Total number of slots.
    fn capacity(&self) -> usize;

    /// Number of slots not currently issued.
    fn free_slots(&self) -> usize;

    /// Take a free slot. O(1).
    fn allocate_slot(&mut self) -> Result<TileSlot, TileError>;

    /// Return a slot previously issued by this storage.
    fn release_slot(&mut self, slot: &TileSlot) -> Result<(), TileError>;

    /// Downcast to a GPU storage.
    fn as_gpu(&self) -> Option<&GpuTileStorage> {
        None
    }
}

/// Free-list bookkeeping shared by the concrete storages.
#[derive(Debug)]
pub(crate) struct SlotPool {
    id: StorageId,
    tile_size: u32,
    slots: Vec<TileSlot>,
    free: Vec<u32>,
    live: Vec<bool>,
}

impl SlotPool {
    /// Build a pool over pre-built slots. Slot `i` must have index `i`.
    pub(crate) fn new(id: StorageId, tile_size: u32, slots: Vec<TileSlot>) -> Self {
        let count = slots.len() as u32;
        Self {
            id,
            tile_size,
            live: vec![false; slots.len()],
            // Reversed so that slot 0 is handed out first.
            free: (0..count).rev().collect(),
            slots,
        }
    }

    pub(crate) fn id(&self) -> StorageId {
        self.id
    }

    pub(crate) fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn allocate(&mut self) -> Result<TileSlot, TileError> {
        let index = self.free.pop().ok_or(TileError::CapacityExceeded {
            storage: self.id,
            capacity: self.slots.len(),
        })?;
        self.live[index as usize] = true;
        Ok(self.slots[index as usize].clone())
    }

    pub(crate) fn release(&mut self, slot: &TileSlot) -> Result<(), TileError> {
        if slot.storage() != self.id {
            return Err(TileError::ForeignSlot {
                owner: slot.storage(),
                storage: self.id,
                index: slot.index(),
            });
        }
        let index = slot.index();
        match self.live.get_mut(index as usize) {
            Some(live) if *live => {
                *live = false;
                self.free.push(index);
                Ok(())
            }
            _ => Err(TileError::SlotNotLive {
                storage: self.id,
                index,
            }),
        }
    }
}

/// A storage whose slots are host-memory `f32` buffers.
#[derive(Debug)]
pub struct CpuTileStorage {
    pool: SlotPool,
    channels: u32,
}

impl CpuTileStorage {
    /// Create a storage of `capacity` slots of `tile_size²` texels with
    /// `channels` floats each.
    pub fn new(tile_size: u32, channels: u32, capacity: usize) -> Result<Self, TileError> {
        if tile_size == 0 || channels == 0 || capacity == 0 {
            return Err(TileError::InvalidConfiguration(format!(
                "cpu storage needs non-zero tile size, channels and capacity \
                 (got {tile_size}, {channels}, {capacity})"
            )));
        }
        let id = StorageId::next();
        let slots = (0..capacity as u32)
            .map(|i| {
                TileSlot::new(
                    id,
                    i,
                    tile_size,
                    SlotSurface::Cpu(CpuRegion::new(tile_size, channels)),
                )
            })
            .collect();
        Ok(Self {
            pool: SlotPool::new(id, tile_size, slots),
            channels,
        })
    }

    /// Floats per texel.
    #[must_use]
    pub fn channels(&self) -> u32 {
        self.channels
    }
}

impl TileStorage for CpuTileStorage {
    fn id(&self) -> StorageId {
        self.pool.id()
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Cpu
    }

    fn tile_size(&self) -> u32 {
        self.pool.tile_size()
    }

    fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    fn free_slots(&self) -> usize {
        self.pool.free_slots()
    }

    fn allocate_slot(&mut self) -> Result<TileSlot, TileError> {
        self.pool.allocate()
    }

    fn release_slot(&mut self, slot: &TileSlot) -> Result<(), TileError> {
        self.pool.release(slot)
    }
}
