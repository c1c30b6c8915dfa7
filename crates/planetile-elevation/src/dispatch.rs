//! The GPU dispatch surface producers write tiles through.
//!
//! [`TileDispatcher`] runs the elevation kernel over one slot and
//! [`TileUploader`] copies CPU-computed texels into one. [`WgpuTileDispatcher`]
//! implements both on a wgpu device.

use planetile_tile::{GpuRegion, TileFormat, TileKey};

use crate::uniforms::ElevationUniforms;

/// Errors raised by a dispatch backend.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The target region has no GPU texture behind it.
    #[error("slot layer {layer} is not backed by a GPU texture")]
    Unbacked { layer: u32 },

    /// The region's texel format is not the one the kernel writes.
    #[error("expected {expected:?} texels, slot is {found:?}")]
    FormatMismatch {
        expected: TileFormat,
        found: TileFormat,
    },

    /// The uploaded texel count does not cover the region exactly.
    #[error("expected {expected} floats for the slot, got {found}")]
    SizeMismatch { expected: usize, found: usize },
}

/// One elevation kernel invocation.
#[derive(Debug)]
pub struct ElevationJob<'a> {
    pub key: TileKey,
    /// Destination slot, written over its full `width × width` texels.
    pub target: &'a GpuRegion,
    /// Residual slot sampled by the kernel, if any.
    pub residual: Option<&'a GpuRegion>,
    pub uniforms: ElevationUniforms,
}

/// Runs the elevation kernel.
pub trait TileDispatcher {
    fn dispatch_elevation(&self, job: &ElevationJob<'_>) -> Result<(), DispatchError>;
}

/// Writes host texels into a GPU slot.
pub trait TileUploader {
    /// `texels` holds `width * width * channels` floats, row-major.
    fn upload(&self, target: &GpuRegion, texels: &[f32]) -> Result<(), DispatchError>;
}

/// WGSL storage format name of `format`.
fn wgsl_format(format: TileFormat) -> &'static str {
    match format {
        TileFormat::R32Float => "r32float",
        TileFormat::Rg32Float => "rg32float",
        TileFormat::Rgba32Float => "rgba32float",
    }
}

const WORKGROUP_SIZE: u32 = 8;

/// Elevation kernel. `STORAGE_FORMAT` is substituted with the target format.
pub const ELEVATION_SHADER_SOURCE: &str = r#"
struct ElevationUniforms {
    local_to_world: mat4x4<f32>,
    tile_wsd: vec4<f32>,
    tile_sd: vec2<f32>,
    amplitude: f32,
    frequency: f32,
    offset: vec4<f32>,
    residual_osh: vec4<f32>,
    extra: vec4<f32>,
};

@group(0) @binding(0) var<uniform> u: ElevationUniforms;
@group(0) @binding(1) var residual_tex: texture_2d<f32>;
@group(0) @binding(2) var target_tex: texture_storage_2d<STORAGE_FORMAT, write>;

fn hash3(p: vec3<f32>) -> f32 {
    let q = fract(p * 0.3183099 + vec3<f32>(0.1, 0.2, 0.3));
    let r = q * 17.0;
    return fract(r.x * r.y * r.z * (r.x + r.y + r.z)) * 2.0 - 1.0;
}

fn value_noise(p: vec3<f32>) -> f32 {
    let i = floor(p);
    let f = fract(p);
    let s = f * f * (3.0 - 2.0 * f);
    let n000 = hash3(i);
    let n100 = hash3(i + vec3<f32>(1.0, 0.0, 0.0));
    let n010 = hash3(i + vec3<f32>(0.0, 1.0, 0.0));
    let n110 = hash3(i + vec3<f32>(1.0, 1.0, 0.0));
    let n001 = hash3(i + vec3<f32>(0.0, 0.0, 1.0));
    let n101 = hash3(i + vec3<f32>(1.0, 0.0, 1.0));
    let n011 = hash3(i + vec3<f32>(0.0, 1.0, 1.0));
    let n111 = hash3(i + vec3<f32>(1.0, 1.0, 1.0));
    let x0 = mix(mix(n000, n100, s.x), mix(n010, n110, s.x), s.y);
    let x1 = mix(mix(n001, n101, s.x), mix(n011, n111, s.x), s.y);
    return mix(x0, x1, s.z);
}

fn fbm(p: vec3<f32>) -> f32 {
    var total = 0.0;
    var amplitude = 0.5;
    var q = p;
    for (var octave = 0u; octave < 6u; octave = octave + 1u) {
        total = total + value_noise(q) * amplitude;
        q = q * 2.0;
        amplitude = amplitude * 0.5;
    }
    return total;
}

@compute @workgroup_size(8, 8, 1)
fn cs_main(@builtin(global_invocation_id) id: vec3<u32>) {
    let width = u32(u.tile_wsd.x);
    if (id.x >= width || id.y >= width) {
        return;
    }

    // Slot UV to quad coordinates: the border maps outside [0, 1].
    let uv = (vec2<f32>(id.xy) + 0.5) / u.tile_wsd.x;
    let st = uv * u.tile_sd.y - u.tile_sd.x;
    let face = u.offset.xy + st * u.offset.z;
    let local = u.local_to_world * vec4<f32>(face, u.offset.w, 1.0);
    let dir = normalize(local.xyz);

    var height = fbm(dir * u.frequency * 8.0) * u.amplitude;

    if (u.residual_osh.w != 0.0) {
        let dims = vec2<i32>(textureDimensions(residual_tex));
        let texel = vec2<i32>((uv + u.residual_osh.xy) * vec2<f32>(dims));
        let coords = clamp(texel, vec2<i32>(0), dims - vec2<i32>(1));
        height = height + textureLoad(residual_tex, coords, 0).x * u.residual_osh.w;
    }

    textureStore(target_tex, vec2<i32>(id.xy), vec4<f32>(height, u.extra.x, u.extra.y, 1.0));
}
"#;

/// [`TileDispatcher`] and [`TileUploader`] on a wgpu device.
///
/// Each dispatch rewrites a single uniform buffer and is submitted on its own,
/// so dispatches execute in call order.
pub struct WgpuTileDispatcher {
    device: wgpu::Device,
    queue: wgpu::Queue,
    format: TileFormat,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    uniform_buffer: wgpu::Buffer,
    neutral_residual: wgpu::TextureView,
}

impl WgpuTileDispatcher {
    /// Build the elevation pipeline writing `format` slots.
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, format: TileFormat) -> Self {
        let source = ELEVATION_SHADER_SOURCE.replace("STORAGE_FORMAT", wgsl_format(format));
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("elevation-shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("elevation-bind-group-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: format.to_wgpu(),
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("elevation-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("elevation-pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("cs_main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("elevation-uniforms"),
            size: std::mem::size_of::<ElevationUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // Bound when a tile has no residual; never read since `residual_osh.w` is zero.
        let neutral = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("elevation-neutral-residual"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let neutral_residual = neutral.create_view(&wgpu::TextureViewDescriptor::default());

        tracing::debug!(?format, "created elevation pipeline");

        Self {
            device: device.clone(),
            queue: queue.clone(),
            format,
            bind_group_layout,
            pipeline,
            uniform_buffer,
            neutral_residual,
        }
    }

    /// Format of the slots this dispatcher writes.
    #[must_use]
    pub fn format(&self) -> TileFormat {
        self.format
    }
}

impl TileDispatcher for WgpuTileDispatcher {
    fn dispatch_elevation(&self, job: &ElevationJob<'_>) -> Result<(), DispatchError> {
        if job.target.format != self.format {
            return Err(DispatchError::FormatMismatch {
                expected: self.format,
                found: job.target.format,
            });
        }
        let target = job.target.view().ok_or(DispatchError::Unbacked {
            layer: job.target.layer,
        })?;
        let residual = match job.residual {
            Some(region) => region.view().ok_or(DispatchError::Unbacked {
                layer: region.layer,
            })?,
            None => &self.neutral_residual,
        };

        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&job.uniforms));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("elevation-bind-group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(residual),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(target),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("elevation-encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("elevation-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let groups = job.target.width.div_ceil(WORKGROUP_SIZE);
            pass.dispatch_workgroups(groups, groups, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        tracing::trace!(tile = %job.key, layer = job.target.layer, "dispatched elevation kernel");
        Ok(())
    }
}

impl TileUploader for WgpuTileDispatcher {
    fn upload(&self, target: &GpuRegion, texels: &[f32]) -> Result<(), DispatchError> {
        let texture = target.texture().ok_or(DispatchError::Unbacked {
            layer: target.layer,
        })?;
        let expected = target.width as usize * target.width as usize * target.format.channels() as usize;
        if texels.len() != expected {
            return Err(DispatchError::SizeMismatch {
                expected,
                found: texels.len(),
            });
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: target.layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(target.width * target.format.bytes_per_texel()),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: target.width,
                height: target.width,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use glam::DMat4;
    use planetile_tile::{GpuStorageDesc, GpuTileStorage, ProducerId, TileStorage};
    use std::cell::RefCell;

    use crate::uniforms::{NEUTRAL_RESIDUAL_OSH, TileGeometry, tile_offset};

    /// What a [`RecordingDispatcher`] saw of one job.
    #[derive(Clone, Debug)]
    pub(crate) struct RecordedJob {
        pub key: TileKey,
        pub target_layer: u32,
        pub residual_layer: Option<u32>,
        pub uniforms: ElevationUniforms,
    }

    /// Records jobs and uploads instead of touching a GPU.
    #[derive(Default)]
    pub(crate) struct RecordingDispatcher {
        pub jobs: RefCell<Vec<RecordedJob>>,
        pub uploads: RefCell<Vec<(u32, Vec<f32>)>>,
    }

    impl TileDispatcher for RecordingDispatcher {
        fn dispatch_elevation(&self, job: &ElevationJob<'_>) -> Result<(), DispatchError> {
            self.jobs.borrow_mut().push(RecordedJob {
                key: job.key,
                target_layer: job.target.layer,
                residual_layer: job.residual.map(|r| r.layer),
                uniforms: job.uniforms,
            });
            Ok(())
        }
    }

    impl TileUploader for RecordingDispatcher {
        fn upload(&self, target: &GpuRegion, texels: &[f32]) -> Result<(), DispatchError> {
            self.uploads.borrow_mut().push((target.layer, texels.to_vec()));
            Ok(())
        }
    }

    pub(crate) fn test_device() -> Option<(wgpu::Device, wgpu::Queue)> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::default(),
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok()?;
            adapter
                .request_device(&wgpu::DeviceDescriptor::default())
                .await
                .ok()
        })
    }

    fn storage_desc(width: u32, format: TileFormat) -> GpuStorageDesc {
        GpuStorageDesc {
            label: "dispatch-test".into(),
            tile_width: width,
            format,
            capacity: 2,
        }
    }

    fn uniforms(width: u32) -> ElevationUniforms {
        let geometry = TileGeometry::new(width, 2, 0, 1000.0, 5);
        let offset = tile_offset(0, 0, 0, 1000.0, 500.0);
        ElevationUniforms::new(&geometry, offset, 10.0, 1.0, DMat4::IDENTITY, NEUTRAL_RESIDUAL_OSH)
    }

    #[test]
    fn test_wgsl_format_names() {
        assert_eq!(wgsl_format(TileFormat::R32Float), "r32float");
        assert_eq!(wgsl_format(TileFormat::Rgba32Float), "rgba32float");
        assert!(ELEVATION_SHADER_SOURCE.contains("STORAGE_FORMAT"));
    }

    #[test]
    fn test_dispatch_into_device_slot() {
        let Some((device, queue)) = test_device() else {
            return;
        };
        let dispatcher = WgpuTileDispatcher::new(&device, &queue, TileFormat::R32Float);
        let mut storage =
            GpuTileStorage::with_device(&device, storage_desc(13, TileFormat::R32Float)).unwrap();
        let target = storage.allocate_slot().unwrap();
        let residual = storage.allocate_slot().unwrap();

        dispatcher
            .upload(residual.as_gpu().unwrap(), &vec![0.5; 13 * 13])
            .unwrap();
        let job = ElevationJob {
            key: TileKey::new(ProducerId(0), 0, 0, 0),
            target: target.as_gpu().unwrap(),
            residual: None,
            uniforms: uniforms(13),
        };
        dispatcher.dispatch_elevation(&job).unwrap();
    }

    #[test]
    fn test_unbacked_slot_is_rejected() {
        let Some((device, queue)) = test_device() else {
            return;
        };
        let dispatcher = WgpuTileDispatcher::new(&device, &queue, TileFormat::R32Float);
        let mut storage = GpuTileStorage::new(storage_desc(13, TileFormat::R32Float)).unwrap();
        let slot = storage.allocate_slot().unwrap();
        let region = slot.as_gpu().unwrap();

        let job = ElevationJob {
            key: TileKey::new(ProducerId(0), 0, 0, 0),
            target: region,
            residual: None,
            uniforms: uniforms(13),
        };
        assert!(matches!(
            dispatcher.dispatch_elevation(&job),
            Err(DispatchError::Unbacked { layer: 0 })
        ));
        assert!(matches!(
            dispatcher.upload(region, &[0.0; 4]),
            Err(DispatchError::Unbacked { .. })
        ));
    }

    #[test]
    fn test_format_and_size_are_checked() {
        let Some((device, queue)) = test_device() else {
            return;
        };
        let dispatcher = WgpuTileDispatcher::new(&device, &queue, TileFormat::R32Float);
        let mut storage =
            GpuTileStorage::with_device(&device, storage_desc(13, TileFormat::Rgba32Float)).unwrap();
        let slot = storage.allocate_slot().unwrap();
        let region = slot.as_gpu().unwrap();

        let job = ElevationJob {
            key: TileKey::new(ProducerId(0), 0, 0, 0),
            target: region,
            residual: None,
            uniforms: uniforms(13),
        };
        assert!(matches!(
            dispatcher.dispatch_elevation(&job),
            Err(DispatchError::FormatMismatch { .. })
        ));
        assert!(matches!(
            dispatcher.upload(region, &[0.0; 13 * 13]),
            Err(DispatchError::SizeMismatch {
                expected: 676,
                found: 169
            })
        ));
    }
}
