//! Tile slots: the unit of backing storage handed to a tile.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::key::StorageId;

/// Texel layout of GPU tile slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TileFormat {
    /// One 32-bit float channel (heights, residuals).
    R32Float,
    /// Two 32-bit float channels.
    Rg32Float,
    /// Four 32-bit float channels (height + normal, colours).
    Rgba32Float,
}

impl TileFormat {
    /// Number of channels per texel.
    #[must_use]
    pub fn channels(self) -> u32 {
        match self {
            Self::R32Float => 1,
            Self::Rg32Float => 2,
            Self::Rgba32Float => 4,
        }
    }

    /// Size of one texel in bytes.
    #[must_use]
    pub fn bytes_per_texel(self) -> u32 {
        self.channels() * 4
    }

    /// The matching wgpu texture format.
    #[must_use]
    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            Self::R32Float => wgpu::TextureFormat::R32Float,
            Self::Rg32Float => wgpu::TextureFormat::Rg32Float,
            Self::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }
}

/// One layer of a GPU tile texture array.
#[derive(Clone, Debug)]
pub struct GpuRegion {
    /// Array layer in the owning storage's texture.
    pub layer: u32,
    /// Width and height in texels.
    pub width: u32,
    /// Texel format.
    pub format: TileFormat,
    texture: Option<wgpu::Texture>,
    view: Option<wgpu::TextureView>,
}

impl GpuRegion {
    pub(crate) fn new(
        layer: u32,
        width: u32,
        format: TileFormat,
        backing: Option<(wgpu::Texture, wgpu::TextureView)>,
    ) -> Self {
        let (texture, view) = backing.unzip();
        Self {
            layer,
            width,
            format,
            texture,
            view,
        }
    }

    /// The whole texture array this region is a layer of. `None` for unbacked storages.
    #[must_use]
    pub fn texture(&self) -> Option<&wgpu::Texture> {
        self.texture.as_ref()
    }

    /// Single-layer 2D view of this region. `None` for unbacked storages.
    #[must_use]
    pub fn view(&self) -> Option<&wgpu::TextureView> {
        self.view.as_ref()
    }
}

/// A CPU buffer of `width * width * channels` floats, row-major.
#[derive(Clone, Debug)]
pub struct CpuRegion {
    /// Width and height in texels.
    pub width: u32,
    /// Floats per texel.
    pub channels: u32,
    data: Rc<RefCell<Vec<f32>>>,
}

impl CpuRegion {
    pub(crate) fn new(width: u32, channels: u32) -> Self {
        let len = width as usize * width as usize * channels as usize;
        Self {
            width,
            channels,
            data: Rc::new(RefCell::new(vec![0.0; len])),
        }
    }

    /// Borrow the texel data.
    #[must_use]
    pub fn data(&self) -> Ref<'_, Vec<f32>> {
        self.data.borrow()
    }

    /// Overwrite the texel data. `texels` shorter than the region leaves the tail untouched.
    pub fn write(&self, texels: &[f32]) {
        let mut data = self.data.borrow_mut();
        let n = texels.len().min(data.len());
        data[..n].copy_from_slice(&texels[..n]);
    }

    /// Set every float to `value`.
    pub fn fill(&self, value: f32) {
        self.data.borrow_mut().fill(value);
    }
}

/// The backing surface of a slot.
#[derive(Clone, Debug)]
pub enum SlotSurface {
    /// CPU-resident buffer.
    Cpu(CpuRegion),
    /// GPU texture layer.
    Gpu(GpuRegion),
}

/// A unit of storage issued by a [`TileStorage`](crate::TileStorage).
///
/// Slots are cheap handles; the storage tracks which of them are live.
#[derive(Clone, Debug)]
pub struct TileSlot {
    storage: StorageId,
    index: u32,
    tile_size: u32,
    surface: SlotSurface,
}

impl TileSlot {
    pub(crate) fn new(storage: StorageId, index: u32, tile_size: u32, surface: SlotSurface) -> Self {
        Self {
            storage,
            index,
            tile_size,
            surface,
        }
    }

    /// Storage that issued this slot.
    #[must_use]
    pub fn storage(&self) -> StorageId {
        self.storage
    }

    /// Index of this slot inside its storage.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Tile width in texels, border included.
    #[must_use]
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// The backing surface.
    #[must_use]
    pub fn surface(&self) -> &SlotSurface {
        &self.surface
    }

    /// The GPU region, if this slot is GPU-backed.
    #[must_use]
    pub fn as_gpu(&self) -> Option<&GpuRegion> {
        match &self.surface {
            SlotSurface::Gpu(region) => Some(region),
            SlotSurface::Cpu(_) => None,
        }
    }

    /// The CPU region, if this slot is CPU-backed.
    #[must_use]
    pub fn as_cpu(&self) -> Option<&CpuRegion> {
        match &self.surface {
            SlotSurface::Cpu(region) => Some(region),
            SlotSurface::Gpu(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        assert_eq!(TileFormat::R32Float.bytes_per_texel(), 4);
        assert_eq!(TileFormat::Rg32Float.channels(), 2);
        assert_eq!(
            TileFormat::Rgba32Float.to_wgpu(),
            wgpu::TextureFormat::Rgba32Float
        );
    }

    #[test]
    fn test_cpu_region_write_is_shared_between_clones() {
        let region = CpuRegion::new(4, 2);
        assert_eq!(region.data().len(), 32);

        let alias = region.clone();
        alias.write(&[1.0, 2.0, 3.0]);
        assert_eq!(&region.data()[..4], &[1.0, 2.0, 3.0, 0.0]);

        region.fill(0.5);
        assert!(alias.data().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_slot_surface_accessors() {
        let cpu = TileSlot::new(
            StorageId(7),
            3,
            4,
            SlotSurface::Cpu(CpuRegion::new(4, 1)),
        );
        assert!(cpu.as_cpu().is_some());
        assert!(cpu.as_gpu().is_none());

        let gpu = TileSlot::new(
            StorageId(7),
            0,
            4,
            SlotSurface::Gpu(GpuRegion::new(0, 4, TileFormat::R32Float, None)),
        );
        assert!(gpu.as_gpu().is_some_and(|r| r.view().is_none() && r.texture().is_none()));
    }
}
