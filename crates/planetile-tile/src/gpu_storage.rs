//! GPU-resident tile storage backed by a 2D texture array.
//!
//! Every slot of a [`GpuTileStorage`] is one layer of a single
//! `tile_width × tile_width × capacity` texture. Shader dispatches write into a
//! slot through its single-layer view and later dispatches sample it.

use crate::error::TileError;
use crate::key::StorageId;
use crate::slot::{GpuRegion, SlotSurface, TileFormat, TileSlot};
use crate::storage::{SlotPool, StorageKind, TileStorage};

/// Largest tile width accepted (the wgpu default `max_texture_dimension_2d`).
pub const MAX_TILE_WIDTH: u32 = 8192;

/// Largest slot count accepted (the wgpu default `max_texture_array_layers`).
pub const MAX_TILE_LAYERS: usize = 256;

/// Layout of a [`GpuTileStorage`].
#[derive(Clone, Debug, PartialEq)]
pub struct GpuStorageDesc {
    /// Debug label for the texture array.
    pub label: String,
    /// Slot width in texels, border included.
    pub tile_width: u32,
    /// Texel format.
    pub format: TileFormat,
    /// Number of slots (array layers).
    pub capacity: usize,
}

impl GpuStorageDesc {
    fn validate(&self) -> Result<(), TileError> {
        if self.tile_width == 0 || self.tile_width > MAX_TILE_WIDTH {
            return Err(TileError::InvalidConfiguration(format!(
                "tile width {} is not usable for {:?} (must be in 1..={MAX_TILE_WIDTH})",
                self.tile_width, self.format
            )));
        }
        if self.capacity == 0 || self.capacity > MAX_TILE_LAYERS {
            return Err(TileError::InvalidConfiguration(format!(
                "capacity {} outside 1..={MAX_TILE_LAYERS} texture layers",
                self.capacity
            )));
        }
        Ok(())
    }
}

/// A tile storage whose slots are layers of a GPU texture array.
pub struct GpuTileStorage {
    pool: SlotPool,
    desc: GpuStorageDesc,
    texture: Option<wgpu::Texture>,
}

impl GpuTileStorage {
    /// Build the slot pool without allocating GPU memory.
    ///
    /// Slots carry no texture view; dispatch backends that need one reject them.
    pub fn new(desc: GpuStorageDesc) -> Result<Self, TileError> {
        desc.validate()?;
        let id = StorageId::next();
        let slots = (0..desc.capacity as u32)
            .map(|layer| {
                TileSlot::new(
                    id,
                    layer,
                    desc.tile_width,
                    SlotSurface::Gpu(GpuRegion::new(layer, desc.tile_width, desc.format, None)),
                )
            })
            .collect();
        Ok(Self {
            pool: SlotPool::new(id, desc.tile_width, slots),
            desc,
            texture: None,
        })
    }

    /// Allocate the texture array on `device` and build one view per slot.
    pub fn with_device(device: &wgpu::Device, desc: GpuStorageDesc) -> Result<Self, TileError> {
        desc.validate()?;
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.tile_width,
                height: desc.tile_width,
                depth_or_array_layers: desc.capacity as u32,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format.to_wgpu(),
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let id = StorageId::next();
        let slots = (0..desc.capacity as u32)
            .map(|layer| {
                let view = texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("tile-slot-view"),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                });
                TileSlot::new(
                    id,
                    layer,
                    desc.tile_width,
                    SlotSurface::Gpu(GpuRegion::new(
                        layer,
                        desc.tile_width,
                        desc.format,
                        Some((texture.clone(), view)),
                    )),
                )
            })
            .collect();

        tracing::debug!(
            label = %desc.label,
            width = desc.tile_width,
            layers = desc.capacity,
            "allocated tile texture array"
        );

        Ok(Self {
            pool: SlotPool::new(id, desc.tile_width, slots),
            desc,
            texture: Some(texture),
        })
    }

    /// The backing texture array, if GPU memory was allocated.
    #[must_use]
    pub fn texture(&self) -> Option<&wgpu::Texture> {
        self.texture.as_ref()
    }

    /// Texel format of every slot.
    #[must_use]
    pub fn format(&self) -> TileFormat {
        self.desc.format
    }

    /// The layout this storage was built with.
    #[must_use]
    pub fn desc(&self) -> &GpuStorageDesc {
        &self.desc
    }
}

impl TileStorage for GpuTileStorage {
    fn id(&self) -> StorageId {
        self.pool.id()
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Gpu
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

    fn as_gpu(&self) -> Option<&GpuTileStorage> {
        Some(self)
    }
}
