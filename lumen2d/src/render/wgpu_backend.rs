//! [`LightingBackend`] on top of wgpu.
//!
//! Every command becomes its own render pass on a single per-frame
//! encoder, so the GPU executes them in submission order. Per-pass
//! uniforms and light quads are appended to ring buffers that are rewound
//! at the start of each frame.

use std::num::NonZeroU64;

use anyhow::{anyhow, Result};
use bytemuck::{Pod, Zeroable};
use glam::Affine2;
use image::RgbaImage;
use wgpu::util::DeviceExt;
use wgpu::{
    vertex_attr_array, AddressMode, BindGroup, BindGroupDescriptor, BindGroupEntry,
    BindGroupLayout, BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingResource,
    BindingType, BlendComponent, BlendFactor, BlendOperation, BlendState, Buffer, BufferUsages,
    ColorTargetState, ColorWrites, CommandEncoder, CompareFunction, DepthBiasState,
    DepthStencilState, DeviceDescriptor, Extent3d, FilterMode, FragmentState, IndexFormat,
    LoadOp, MultisampleState, Operations, Origin3d, PipelineLayout, PipelineLayoutDescriptor,
    PrimitiveState, PrimitiveTopology, RenderPass, RenderPassColorAttachment,
    RenderPassDepthStencilAttachment, RenderPassDescriptor, RenderPipeline,
    RenderPipelineDescriptor, RequestAdapterOptions, Sampler, SamplerBindingType,
    SamplerDescriptor, ShaderModule, ShaderModuleDescriptor, ShaderSource, StencilFaceState,
    StencilOperation, StencilState, TexelCopyBufferLayout, TexelCopyTextureInfo, Texture,
    TextureAspect, TextureDescriptor, TextureDimension, TextureFormat, TextureSampleType,
    TextureUsages, TextureView, TextureViewDescriptor, TextureViewDimension, VertexBufferLayout,
    TextureFormatFeatureFlags, VertexState, VertexStepMode,
};

use crate::render::backend::{
    BackendCapabilities, BlurPass, BlurTarget, BufferCapacities, DepthClear, DepthDraw,
    DepthDrawState, DepthTarget, FovBlit, LightPass, LightingBackend, MaskDraw, ScissorRect,
    ShadowCasterDraw, ShadowMode, TargetSizes,
};
use crate::render::depth::DepthInstance;
use crate::render::light::LightVertex;
use crate::render::occlusion::{
    mask_indices, MaskVertex, OcclusionGeometry, SegmentVertex, MASK_INDICES_PER_OCCLUDER,
};

const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;
const STENCIL_FORMAT: TextureFormat = TextureFormat::Depth24PlusStencil8;
const MASK_ATLAS_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
/// Format of the framebuffer the FOV compositor draws into.
pub const FRAMEBUFFER_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

/// Passes per frame that can carry their own uniforms.
const UNIFORM_SLOTS: u64 = 64;
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];

const STENCIL_OUTSIDE_FOV: u32 = 0xFF;
const STENCIL_WALL: u32 = 0xFE;

/// Colour formats of the light and depth targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TargetFormats {
    light: TextureFormat,
    depth_color: TextureFormat,
    /// Depth moments are packed two 8-bit channels each, as fractions of
    /// the maximum depth distance.
    packed_depth: bool,
}

impl TargetFormats {
    const FLOAT: Self = Self {
        light: TextureFormat::Rgba16Float,
        depth_color: TextureFormat::Rg32Float,
        packed_depth: false,
    };

    const UNORM: Self = Self {
        light: TextureFormat::Rgba8Unorm,
        depth_color: TextureFormat::Rgba8Unorm,
        packed_depth: true,
    };

    fn select(float_light: bool, float_depth: bool) -> Self {
        if float_light && float_depth {
            Self::FLOAT
        } else {
            log::warn!(
                "Float render targets unsupported (light: {}, depth: {}), using 8-bit targets",
                float_light,
                float_depth
            );
            Self::UNORM
        }
    }

    fn for_adapter(adapter: &wgpu::Adapter) -> Self {
        let supports = |format: TextureFormat, flags: TextureFormatFeatureFlags| {
            let features = adapter.get_texture_format_features(format);
            features
                .allowed_usages
                .contains(TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING)
                && features.flags.contains(flags)
        };
        let blended = TextureFormatFeatureFlags::FILTERABLE | TextureFormatFeatureFlags::BLENDABLE;
        Self::select(
            supports(Self::FLOAT.light, blended),
            supports(Self::FLOAT.depth_color, TextureFormatFeatureFlags::empty()),
        )
    }

    fn is_float(&self) -> bool {
        !self.packed_depth
    }

    /// Uniform flag telling shaders how depth moments are stored.
    fn depth_flag(&self) -> f32 {
        if self.packed_depth {
            1.0
        } else {
            0.0
        }
    }
}

/// Uniforms shared by every pass. Each shader reads the fields it needs.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct PassUniforms {
    /// Linear part of an affine transform: x axis, then y axis.
    affine: [f32; 4],
    /// Translation in xy, target size in zw.
    translation: [f32; 4],
    color: [f32; 4],
    params: [f32; 4],
}

impl PassUniforms {
    fn from_affine(matrix: &Affine2) -> Self {
        let x = matrix.matrix2.x_axis;
        let y = matrix.matrix2.y_axis;
        Self {
            affine: [x.x, x.y, y.x, y.y],
            translation: [matrix.translation.x, matrix.translation.y, 0.0, 0.0],
            ..Self::default()
        }
    }

    fn with_target_size(mut self, size: (u32, u32)) -> Self {
        self.translation[2] = size.0 as f32;
        self.translation[3] = size.1 as f32;
        self
    }
}

struct RenderTarget {
    texture: Texture,
    view: TextureView,
    size: (u32, u32),
}

fn create_target(
    device: &wgpu::Device,
    label: &str,
    size: (u32, u32),
    format: TextureFormat,
    usage: TextureUsages,
) -> RenderTarget {
    let texture = device.create_texture(&TextureDescriptor {
        label: Some(label),
        size: Extent3d {
            width: size.0.max(1),
            height: size.1.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&TextureViewDescriptor::default());
    RenderTarget {
        texture,
        view,
        size,
    }
}

/// A polar depth map: moments in colour, distance in depth.
struct DepthMap {
    color: RenderTarget,
    depth: RenderTarget,
}

impl DepthMap {
    fn new(device: &wgpu::Device, label: &str, size: (u32, u32), format: TextureFormat) -> Self {
        Self {
            color: create_target(
                device,
                label,
                size,
                format,
                TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
            ),
            depth: create_target(
                device,
                label,
                size,
                DEPTH_FORMAT,
                TextureUsages::RENDER_ATTACHMENT,
            ),
        }
    }
}

struct Targets {
    shadow_atlas: DepthMap,
    fov_map: DepthMap,
    light: RenderTarget,
    light_stencil: RenderTarget,
    light_blur: RenderTarget,
    wall_bleed1: RenderTarget,
    wall_bleed2: RenderTarget,
    framebuffer: RenderTarget,
    framebuffer_stencil: RenderTarget,
    fov_bind_group: BindGroup,
    /// Sampling bind groups indexed by [`blur_index`].
    blur_bind_groups: [BindGroup; 4],
}

fn blur_index(target: BlurTarget) -> usize {
    match target {
        BlurTarget::Light => 0,
        BlurTarget::LightBlur => 1,
        BlurTarget::WallBleed1 => 2,
        BlurTarget::WallBleed2 => 3,
    }
}

impl Targets {
    fn view(&self, target: BlurTarget) -> &TextureView {
        match target {
            BlurTarget::Light => &self.light.view,
            BlurTarget::LightBlur => &self.light_blur.view,
            BlurTarget::WallBleed1 => &self.wall_bleed1.view,
            BlurTarget::WallBleed2 => &self.wall_bleed2.view,
        }
    }

    fn depth_map(&self, target: DepthTarget) -> &DepthMap {
        match target {
            DepthTarget::ShadowAtlas => &self.shadow_atlas,
            DepthTarget::FovMap => &self.fov_map,
        }
    }
}

/// Scratch buffers sized by [`BufferCapacities`].
struct GeometryBuffers {
    capacities: BufferCapacities,
    light_segments: Buffer,
    fov_segments: Buffer,
    mask_vertices: Buffer,
    mask_indices: Buffer,
    light_instances: Buffer,
    fov_instances: Buffer,
    /// Ring of light quad vertices for batches and shadow casters.
    light_vertices: Buffer,
    light_indices: Buffer,
    quad_indices: Buffer,
}

impl GeometryBuffers {
    fn new(device: &wgpu::Device, capacities: BufferCapacities) -> Self {
        let segments = (capacities.max_occluders * 4 * 2).max(1) as u64;
        let segment_buffer = |label: &str| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: segments * std::mem::size_of::<SegmentVertex>() as u64,
                usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let light_segments = segment_buffer("light-segment-buffer");
        let fov_segments = segment_buffer("fov-segment-buffer");

        let mask_vertices = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("occluder-mask-buffer"),
            size: (capacities.max_occluders * 4).max(1) as u64
                * std::mem::size_of::<MaskVertex>() as u64,
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mask_indices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("occluder-mask-index-buffer"),
            contents: bytemuck::cast_slice(&mask_indices(capacities.max_occluders.max(1))),
            usage: BufferUsages::INDEX,
        });

        let instance_buffer = |label: &str, count: usize| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: count.max(1) as u64 * std::mem::size_of::<DepthInstance>() as u64,
                usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let light_instances = instance_buffer("light-instance-buffer", capacities.max_shadow_lights);
        let fov_instances = instance_buffer("fov-instance-buffer", 2);

        let quads = capacities.max_lights.max(1) as u64;
        let light_vertices = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("light-vertex-ring"),
            size: quads * 4 * std::mem::size_of::<LightVertex>() as u64,
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let light_indices = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("light-index-ring"),
            size: quads * (QUAD_INDICES.len() * std::mem::size_of::<u16>()) as u64,
            usage: BufferUsages::INDEX | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let quad_indices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("light-quad-index-buffer"),
            contents: bytemuck::cast_slice(&QUAD_INDICES),
            usage: BufferUsages::INDEX,
        });

        Self {
            capacities,
            light_segments,
            fov_segments,
            mask_vertices,
            mask_indices,
            light_instances,
            fov_instances,
            light_vertices,
            light_indices,
            quad_indices,
        }
    }
}

struct Pipelines {
    light_layout: BindGroupLayout,
    fov_layout: BindGroupLayout,
    blur_layout: BindGroupLayout,
    depth: RenderPipeline,
    light_batch: RenderPipeline,
    soft_shadow: RenderPipeline,
    soft_clamp: RenderPipeline,
    soft_light: RenderPipeline,
    alpha_clear: RenderPipeline,
    hard_shadow: RenderPipeline,
    hard_light: RenderPipeline,
    lighting_fov: RenderPipeline,
    occluder_mask: RenderPipeline,
    blur: RenderPipeline,
    merge: RenderPipeline,
    final_fov: RenderPipeline,
}

/// Recording state of the frame in progress.
struct FrameState {
    encoder: CommandEncoder,
    uniform_cursor: u64,
    /// Light vertex ring position, in vertices.
    vertex_cursor: u64,
    /// Light index ring position, in indices.
    index_cursor: u64,
    /// Uniform offset of the current light pass.
    light_pass: Option<u32>,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    formats: TargetFormats,
    pipelines: Pipelines,
    uniform_buffer: Buffer,
    uniform_bind_group: BindGroup,
    uniform_stride: u64,
    linear_sampler: Sampler,
    mask_atlas: Option<RenderTarget>,
    light_bind_group: Option<BindGroup>,
    targets: Option<Targets>,
    buffers: GeometryBuffers,
    frame: Option<FrameState>,
    depth_state: DepthDrawState,
}

impl WgpuBackend {
    /// Creates a backend on an existing device. Target formats are picked
    /// from what `adapter` can render to.
    pub fn new(adapter: &wgpu::Adapter, device: wgpu::Device, queue: wgpu::Queue) -> Result<Self> {
        Self::with_formats(TargetFormats::for_adapter(adapter), device, queue)
    }

    fn with_formats(formats: TargetFormats, device: wgpu::Device, queue: wgpu::Queue) -> Result<Self> {
        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let uniform_alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let uniform_size = std::mem::size_of::<PassUniforms>() as u64;
        let uniform_stride = (uniform_size + uniform_alignment - 1) & !(uniform_alignment - 1);

        let uniform_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("pass-uniform-layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(uniform_size),
                },
                count: None,
            }],
        });
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pass-uniform-ring"),
            size: uniform_stride * UNIFORM_SLOTS,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let uniform_bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("pass-uniform-bind-group"),
            layout: &uniform_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &uniform_buffer,
                    offset: 0,
                    size: NonZeroU64::new(uniform_size),
                }),
            }],
        });

        let linear_sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("light-linear-sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        let pipelines = create_pipelines(&device, &uniform_layout, formats);
        let buffers = GeometryBuffers::new(
            &device,
            BufferCapacities {
                max_occluders: 1,
                max_lights: 1,
                max_shadow_lights: 1,
            },
        );
        if let Some(error) = pollster::block_on(scope.pop()) {
            return Err(anyhow!("Failed to create lighting pipelines: {}", error));
        }

        Ok(Self {
            device,
            queue,
            formats,
            pipelines,
            uniform_buffer,
            uniform_bind_group,
            uniform_stride,
            linear_sampler,
            mask_atlas: None,
            light_bind_group: None,
            targets: None,
            buffers,
            frame: None,
            depth_state: DepthDrawState::Finalized,
        })
    }

    /// Creates a backend on the first available adapter, without a surface.
    pub fn headless() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| anyhow!("No suitable GPU adapter: {}", e))?;
        log::info!("Using adapter {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(&DeviceDescriptor {
            label: Some("lumen2d-device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: Default::default(),
            memory_hints: Default::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| anyhow!("Failed to create device: {}", e))?;

        Self::new(&adapter, device, queue)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The framebuffer the FOV compositor darkens. The host draws the world
    /// into it before the frame and presents it afterwards.
    pub fn framebuffer_view(&self) -> Option<&TextureView> {
        self.targets.as_ref().map(|t| &t.framebuffer.view)
    }

    /// The composed light map, for the host to multiply over the world.
    pub fn light_map_view(&self) -> Option<&TextureView> {
        self.targets.as_ref().map(|t| &t.light.view)
    }

    fn push_uniforms(&mut self, uniforms: &PassUniforms) -> Result<u32> {
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let offset = frame.uniform_cursor;
        if offset + self.uniform_stride > self.uniform_buffer.size() {
            return Err(anyhow!(
                "Too many lighting passes in one frame (max: {})",
                UNIFORM_SLOTS
            ));
        }
        self.queue
            .write_buffer(&self.uniform_buffer, offset, bytemuck::bytes_of(uniforms));
        frame.uniform_cursor += self.uniform_stride;
        Ok(offset as u32)
    }

    /// Appends light vertices and indices to the rings. Returns the first
    /// vertex and first index written.
    fn push_light_geometry(&mut self, vertices: &[LightVertex], indices: &[u16]) -> Result<(u64, u64)> {
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let vertex_size = std::mem::size_of::<LightVertex>() as u64;
        let index_size = std::mem::size_of::<u16>() as u64;

        let first_vertex = frame.vertex_cursor;
        let first_index = frame.index_cursor;
        let vertex_end = (first_vertex + vertices.len() as u64) * vertex_size;
        let index_end = (first_index + indices.len() as u64) * index_size;
        if vertex_end > self.buffers.light_vertices.size()
            || index_end > self.buffers.light_indices.size()
        {
            return Err(anyhow!(
                "Too many light quads in one frame (max: {})",
                self.buffers.capacities.max_lights
            ));
        }
        if indices.len() % 2 != 0 {
            return Err(anyhow!("Light index count must be even, got {}", indices.len()));
        }

        self.queue.write_buffer(
            &self.buffers.light_vertices,
            first_vertex * vertex_size,
            bytemuck::cast_slice(vertices),
        );
        if !indices.is_empty() {
            self.queue.write_buffer(
                &self.buffers.light_indices,
                first_index * index_size,
                bytemuck::cast_slice(indices),
            );
        }
        frame.vertex_cursor += vertices.len() as u64;
        frame.index_cursor += indices.len() as u64;
        Ok((first_vertex, first_index))
    }

    fn rebuild_light_bind_group(&mut self) {
        let (Some(atlas), Some(targets)) = (&self.mask_atlas, &self.targets) else {
            self.light_bind_group = None;
            return;
        };
        self.light_bind_group = Some(self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("light-bind-group"),
            layout: &self.pipelines.light_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&atlas.view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Sampler(&self.linear_sampler),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: BindingResource::TextureView(&targets.shadow_atlas.color.view),
                },
            ],
        }));
    }

    fn create_targets(&self, sizes: &TargetSizes) -> Targets {
        let device = &self.device;
        let sampled = TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING;
        let light_format = self.formats.light;
        let light = |label: &str, size| create_target(device, label, size, light_format, sampled);
        let stencil = |label: &str, size| {
            create_target(device, label, size, STENCIL_FORMAT, TextureUsages::RENDER_ATTACHMENT)
        };

        let depth_format = self.formats.depth_color;
        let shadow_atlas = DepthMap::new(device, "shadow-atlas", sizes.shadow_atlas, depth_format);
        let fov_map = DepthMap::new(device, "fov-map", sizes.fov_map, depth_format);
        let light_target = light("light-target", sizes.light_map);
        let light_blur = light("light-blur-target", sizes.light_map);
        let wall_bleed1 = light("wall-bleed-target-1", sizes.wall_bleed);
        let wall_bleed2 = light("wall-bleed-target-2", sizes.wall_bleed);

        let fov_bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("fov-bind-group"),
            layout: &self.pipelines.fov_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: BindingResource::TextureView(&fov_map.color.view),
            }],
        });
        let blur_bind_group = |label: &str, view: &TextureView| {
            device.create_bind_group(&BindGroupDescriptor {
                label: Some(label),
                layout: &self.pipelines.blur_layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: BindingResource::TextureView(view),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: BindingResource::Sampler(&self.linear_sampler),
                    },
                ],
            })
        };
        let blur_bind_groups = [
            blur_bind_group("blur-source-light", &light_target.view),
            blur_bind_group("blur-source-light-blur", &light_blur.view),
            blur_bind_group("blur-source-wall-bleed-1", &wall_bleed1.view),
            blur_bind_group("blur-source-wall-bleed-2", &wall_bleed2.view),
        ];

        Targets {
            shadow_atlas,
            fov_map,
            light_stencil: stencil("light-stencil", sizes.light_map),
            light: light_target,
            light_blur,
            wall_bleed1,
            wall_bleed2,
            framebuffer: create_target(
                device,
                "lighting-framebuffer",
                sizes.framebuffer,
                FRAMEBUFFER_FORMAT,
                sampled | TextureUsages::COPY_SRC,
            ),
            framebuffer_stencil: stencil("framebuffer-stencil", sizes.framebuffer),
            fov_bind_group,
            blur_bind_groups,
        }
    }

    /// Uniform offset of the light pass in progress.
    fn light_pass_uniforms(&self) -> Result<u32> {
        self.frame
            .as_ref()
            .and_then(|f| f.light_pass)
            .ok_or_else(|| anyhow!("No light pass in progress"))
    }
}

fn color_attachment(view: &TextureView, load: LoadOp<wgpu::Color>) -> RenderPassColorAttachment<'_> {
    RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: Operations {
            load,
            store: wgpu::StoreOp::Store,
        },
        depth_slice: None,
    }
}

fn stencil_attachment(view: &TextureView, load: LoadOp<u32>) -> RenderPassDepthStencilAttachment<'_> {
    RenderPassDepthStencilAttachment {
        view,
        depth_ops: None,
        stencil_ops: Some(Operations {
            load,
            store: wgpu::StoreOp::Store,
        }),
    }
}

fn begin_pass<'a>(
    encoder: &'a mut CommandEncoder,
    label: &str,
    color: RenderPassColorAttachment<'_>,
    depth_stencil: Option<RenderPassDepthStencilAttachment<'_>>,
) -> RenderPass<'a> {
    encoder.begin_render_pass(&RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(color)],
        depth_stencil_attachment: depth_stencil,
        multiview_mask: None,
        occlusion_query_set: None,
        timestamp_writes: None,
    })
}

/// Clamps a scissor box to a target. `None` when nothing is left.
fn clamp_scissor(scissor: &ScissorRect, size: (u32, u32)) -> Option<(u32, u32, u32, u32)> {
    if scissor.x >= size.0 || scissor.y >= size.1 {
        return None;
    }
    let width = scissor.width.min(size.0 - scissor.x);
    let height = scissor.height.min(size.1 - scissor.y);
    (width > 0 && height > 0).then_some((scissor.x, scissor.y, width, height))
}

impl LightingBackend for WgpuBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            max_texture_size: self.device.limits().max_texture_dimension_2d,
            float_render_targets: self.formats.is_float(),
        }
    }

    fn resize_targets(&mut self, sizes: &TargetSizes) -> Result<()> {
        let max = self.device.limits().max_texture_dimension_2d;
        for (name, (width, height)) in [
            ("framebuffer", sizes.framebuffer),
            ("light map", sizes.light_map),
            ("shadow atlas", sizes.shadow_atlas),
        ] {
            if width > max || height > max {
                return Err(anyhow!(
                    "{} of {}x{} exceeds the maximum texture size of {}",
                    name,
                    width,
                    height,
                    max
                ));
            }
        }

        log::info!("Creating light targets {:?}", sizes);
        let scope = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let targets = self.create_targets(sizes);
        if let Some(error) = pollster::block_on(scope.pop()) {
            return Err(anyhow!("Failed to create light targets: {}", error));
        }
        self.targets = Some(targets);
        self.rebuild_light_bind_group();
        Ok(())
    }

    fn resize_buffers(&mut self, capacities: &BufferCapacities) -> Result<()> {
        log::info!("Creating light buffers {:?}", capacities);
        self.buffers = GeometryBuffers::new(&self.device, *capacities);
        Ok(())
    }

    fn upload_mask_atlas(&mut self, atlas: &RgbaImage) -> Result<()> {
        let (width, height) = atlas.dimensions();
        let target = create_target(
            &self.device,
            "light-mask-atlas",
            (width, height),
            MASK_ATLAS_FORMAT,
            TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
        );
        self.queue.write_texture(
            TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            atlas.as_raw(),
            TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.mask_atlas = Some(target);
        self.rebuild_light_bind_group();
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<()> {
        if self.frame.is_some() {
            log::warn!("Frame started before the previous one ended, discarding it");
        }
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lighting-frame-encoder"),
            });
        self.frame = Some(FrameState {
            encoder,
            uniform_cursor: 0,
            vertex_cursor: 0,
            index_cursor: 0,
            light_pass: None,
        });
        Ok(())
    }

    fn upload_occlusion(
        &mut self,
        geometry: &OcclusionGeometry,
        light_instances: &[DepthInstance],
        fov_instances: &[DepthInstance; 2],
    ) -> Result<()> {
        let buffers = &self.buffers;
        if geometry.occluder_count() > buffers.capacities.max_occluders {
            return Err(anyhow!(
                "{} occluders uploaded into buffers sized for {}",
                geometry.occluder_count(),
                buffers.capacities.max_occluders
            ));
        }
        if light_instances.len() > buffers.capacities.max_shadow_lights.max(1) {
            return Err(anyhow!(
                "{} shadow casters uploaded into buffers sized for {}",
                light_instances.len(),
                buffers.capacities.max_shadow_lights
            ));
        }

        let writes: [(&Buffer, &[u8]); 5] = [
            (&buffers.light_segments, bytemuck::cast_slice(geometry.light_vertices())),
            (&buffers.fov_segments, bytemuck::cast_slice(geometry.fov_vertices())),
            (&buffers.mask_vertices, bytemuck::cast_slice(geometry.mask_vertices())),
            (&buffers.light_instances, bytemuck::cast_slice(light_instances)),
            (&buffers.fov_instances, bytemuck::cast_slice(fov_instances.as_slice())),
        ];
        for (buffer, bytes) in writes {
            if !bytes.is_empty() {
                self.queue.write_buffer(buffer, 0, bytes);
            }
        }
        Ok(())
    }

    fn set_depth_state(&mut self, state: DepthDrawState) -> Result<()> {
        // Depth passes carry their own pipeline state.
        if self.depth_state == state {
            log::trace!("Depth state {:?} set twice", state);
        }
        self.depth_state = state;
        Ok(())
    }

    fn clear_depth_target(&mut self, target: DepthTarget, clear: &DepthClear) -> Result<()> {
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?;
        let map = targets.depth_map(target);

        let [r, g, b, a] = clear.color;
        let pass = begin_pass(
            &mut frame.encoder,
            "depth-clear",
            color_attachment(
                &map.color.view,
                LoadOp::Clear(wgpu::Color {
                    r: f64::from(r),
                    g: f64::from(g),
                    b: f64::from(b),
                    a: f64::from(a),
                }),
            ),
            Some(RenderPassDepthStencilAttachment {
                view: &map.depth.view,
                depth_ops: Some(Operations {
                    load: LoadOp::Clear(clear.depth),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
        );
        drop(pass);
        Ok(())
    }

    fn draw_occlusion_depth(&mut self, draw: &DepthDraw) -> Result<()> {
        let size = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?
            .depth_map(draw.target)
            .color
            .size;
        let mut uniforms = PassUniforms::default().with_target_size(size);
        uniforms.params[0] = draw.overlap_side;
        uniforms.params[1] = self.formats.depth_flag();
        let offset = self.push_uniforms(&uniforms)?;

        let (segments, instances) = match draw.target {
            DepthTarget::ShadowAtlas => (&self.buffers.light_segments, &self.buffers.light_instances),
            DepthTarget::FovMap => (&self.buffers.fov_segments, &self.buffers.fov_instances),
        };
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let map = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?
            .depth_map(draw.target);

        let mut pass = begin_pass(
            &mut frame.encoder,
            "occlusion-depth",
            color_attachment(&map.color.view, LoadOp::Load),
            Some(RenderPassDepthStencilAttachment {
                view: &map.depth.view,
                depth_ops: Some(Operations {
                    load: LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
        );
        pass.set_pipeline(&self.pipelines.depth);
        pass.set_bind_group(0, &self.uniform_bind_group, &[offset]);
        pass.set_vertex_buffer(0, segments.slice(..));
        pass.set_vertex_buffer(1, instances.slice(..));
        pass.draw(0..draw.vertex_count, 0..draw.instance_count);
        Ok(())
    }

    fn begin_light_pass(&mut self, light_pass: &LightPass) -> Result<()> {
        let mut uniforms = PassUniforms::default().with_target_size(light_pass.target_size);
        uniforms.params[0] = self.formats.depth_flag();
        let offset = self.push_uniforms(&uniforms)?;

        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?;
        frame.light_pass = Some(offset);

        let pass = begin_pass(
            &mut frame.encoder,
            "light-clear",
            color_attachment(&targets.light.view, LoadOp::Clear(light_pass.ambient.to_wgpu())),
            Some(stencil_attachment(&targets.light_stencil.view, LoadOp::Clear(0))),
        );
        drop(pass);
        Ok(())
    }

    fn draw_lighting_fov(&mut self, blit: &FovBlit) -> Result<()> {
        let mut uniforms = PassUniforms::from_affine(&blit.clip_to_diff);
        uniforms.color = blit.occlude_color.to_array();
        uniforms.params[0] = self.formats.depth_flag();
        let offset = self.push_uniforms(&uniforms)?;

        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?;

        let mut pass = begin_pass(
            &mut frame.encoder,
            "lighting-fov",
            color_attachment(&targets.light.view, LoadOp::Load),
            Some(stencil_attachment(&targets.light_stencil.view, LoadOp::Load)),
        );
        pass.set_pipeline(&self.pipelines.lighting_fov);
        pass.set_stencil_reference(STENCIL_OUTSIDE_FOV);
        pass.set_bind_group(0, &self.uniform_bind_group, &[offset]);
        pass.set_bind_group(1, &targets.fov_bind_group, &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }

    fn draw_occluder_mask(&mut self, mask: &MaskDraw) -> Result<()> {
        let offset = self.push_uniforms(&PassUniforms::from_affine(&mask.eye_to_clip))?;
        let index_count = mask
            .occluder_count
            .min(self.buffers.capacities.max_occluders as u32)
            * MASK_INDICES_PER_OCCLUDER as u32;

        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?;

        let mut pass = begin_pass(
            &mut frame.encoder,
            "occluder-mask",
            color_attachment(&targets.light.view, LoadOp::Load),
            Some(stencil_attachment(&targets.light_stencil.view, LoadOp::Load)),
        );
        pass.set_pipeline(&self.pipelines.occluder_mask);
        pass.set_stencil_reference(STENCIL_WALL);
        pass.set_bind_group(0, &self.uniform_bind_group, &[offset]);
        pass.set_vertex_buffer(0, self.buffers.mask_vertices.slice(..));
        pass.set_index_buffer(self.buffers.mask_indices.slice(..), IndexFormat::Uint16);
        pass.draw_indexed(0..index_count, 0, 0..1);
        Ok(())
    }

    fn draw_light_batch(&mut self, vertices: &[LightVertex], indices: &[u16]) -> Result<()> {
        if vertices.is_empty() || indices.is_empty() {
            return Ok(());
        }
        let uniforms = self.light_pass_uniforms()?;
        let (first_vertex, first_index) = self.push_light_geometry(vertices, indices)?;

        let light_bind_group = self
            .light_bind_group
            .as_ref()
            .ok_or_else(|| anyhow!("Light mask atlas not uploaded"))?;
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?;

        let mut pass = begin_pass(
            &mut frame.encoder,
            "light-batch",
            color_attachment(&targets.light.view, LoadOp::Load),
            Some(stencil_attachment(&targets.light_stencil.view, LoadOp::Load)),
        );
        pass.set_pipeline(&self.pipelines.light_batch);
        pass.set_stencil_reference(0);
        pass.set_bind_group(0, &self.uniform_bind_group, &[uniforms]);
        pass.set_bind_group(1, light_bind_group, &[]);
        pass.set_vertex_buffer(0, self.buffers.light_vertices.slice(..));
        pass.set_index_buffer(self.buffers.light_indices.slice(..), IndexFormat::Uint16);
        let index_range = first_index as u32..(first_index as usize + indices.len()) as u32;
        pass.draw_indexed(index_range, first_vertex as i32, 0..1);
        Ok(())
    }

    fn draw_shadow_caster(&mut self, draw: &ShadowCasterDraw) -> Result<()> {
        let uniforms = self.light_pass_uniforms()?;
        let (first_vertex, _) = self.push_light_geometry(&draw.quad, &[])?;

        let light_bind_group = self
            .light_bind_group
            .as_ref()
            .ok_or_else(|| anyhow!("Light mask atlas not uploaded"))?;
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?;
        let Some((x, y, width, height)) = clamp_scissor(&draw.scissor, targets.light.size) else {
            return Ok(());
        };

        let mut pass = begin_pass(
            &mut frame.encoder,
            "shadow-caster",
            color_attachment(&targets.light.view, LoadOp::Load),
            Some(stencil_attachment(&targets.light_stencil.view, LoadOp::Load)),
        );
        pass.set_scissor_rect(x, y, width, height);
        pass.set_bind_group(0, &self.uniform_bind_group, &[uniforms]);
        pass.set_bind_group(1, light_bind_group, &[]);
        pass.set_vertex_buffer(0, self.buffers.light_vertices.slice(..));
        pass.set_index_buffer(self.buffers.quad_indices.slice(..), IndexFormat::Uint16);

        let quad = 0..QUAD_INDICES.len() as u32;
        let base_vertex = first_vertex as i32;
        match draw.mode {
            ShadowMode::Soft { clamp_alpha } => {
                pass.set_stencil_reference(0);
                pass.set_pipeline(&self.pipelines.soft_shadow);
                pass.draw_indexed(quad.clone(), base_vertex, 0..1);
                if clamp_alpha {
                    pass.set_pipeline(&self.pipelines.soft_clamp);
                    pass.draw_indexed(quad.clone(), base_vertex, 0..1);
                }
                pass.set_pipeline(&self.pipelines.soft_light);
                pass.draw_indexed(quad.clone(), base_vertex, 0..1);
                pass.set_pipeline(&self.pipelines.alpha_clear);
                pass.draw_indexed(quad, base_vertex, 0..1);
            }
            ShadowMode::Hard { stencil_ref } => {
                pass.set_stencil_reference(u32::from(stencil_ref));
                pass.set_pipeline(&self.pipelines.hard_shadow);
                pass.draw_indexed(quad.clone(), base_vertex, 0..1);
                pass.set_pipeline(&self.pipelines.hard_light);
                pass.draw_indexed(quad, base_vertex, 0..1);
            }
        }
        Ok(())
    }

    fn end_light_pass(&mut self) -> Result<()> {
        if let Some(frame) = self.frame.as_mut() {
            frame.light_pass = None;
        }
        Ok(())
    }

    fn blur(&mut self, blur: &BlurPass) -> Result<()> {
        let mut uniforms = PassUniforms::default();
        uniforms.params = [blur.direction.x, blur.direction.y, blur.radius, 0.0];
        let offset = self.push_uniforms(&uniforms)?;

        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?;

        let mut pass = begin_pass(
            &mut frame.encoder,
            "light-blur",
            color_attachment(targets.view(blur.destination), LoadOp::Load),
            None,
        );
        pass.set_pipeline(&self.pipelines.blur);
        pass.set_bind_group(0, &self.uniform_bind_group, &[offset]);
        pass.set_bind_group(1, &targets.blur_bind_groups[blur_index(blur.source)], &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }

    fn merge_wall_bleed(&mut self) -> Result<()> {
        let offset = self.push_uniforms(&PassUniforms::default())?;

        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?;

        let mut pass = begin_pass(
            &mut frame.encoder,
            "wall-bleed-merge",
            color_attachment(&targets.light.view, LoadOp::Load),
            Some(stencil_attachment(&targets.light_stencil.view, LoadOp::Load)),
        );
        pass.set_pipeline(&self.pipelines.merge);
        pass.set_stencil_reference(STENCIL_WALL);
        pass.set_bind_group(0, &self.uniform_bind_group, &[offset]);
        pass.set_bind_group(
            1,
            &targets.blur_bind_groups[blur_index(BlurTarget::WallBleed2)],
            &[],
        );
        pass.draw(0..3, 0..1);
        Ok(())
    }

    fn apply_fov(&mut self, blit: &FovBlit) -> Result<()> {
        let mut uniforms = PassUniforms::from_affine(&blit.clip_to_diff);
        uniforms.color = blit.occlude_color.to_array();
        uniforms.params[0] = self.formats.depth_flag();
        let offset = self.push_uniforms(&uniforms)?;

        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| anyhow!("No frame in progress"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow!("Light targets not created"))?;

        let mut pass = begin_pass(
            &mut frame.encoder,
            "fov-composite",
            color_attachment(&targets.framebuffer.view, LoadOp::Load),
            Some(stencil_attachment(&targets.framebuffer_stencil.view, LoadOp::Clear(0))),
        );
        pass.set_pipeline(&self.pipelines.final_fov);
        pass.set_stencil_reference(1);
        pass.set_bind_group(0, &self.uniform_bind_group, &[offset]);
        pass.set_bind_group(1, &targets.fov_bind_group, &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }

    fn end_frame(&mut self) -> Result<()> {
        let frame = self
            .frame
            .take()
            .ok_or_else(|| anyhow!("Frame already ended"))?;
        self.queue.submit(Some(frame.encoder.finish()));
        Ok(())
    }
}

fn stencil_state(compare: CompareFunction, pass_op: StencilOperation) -> DepthStencilState {
    let face = StencilFaceState {
        compare,
        fail_op: StencilOperation::Keep,
        depth_fail_op: StencilOperation::Keep,
        pass_op,
    };
    DepthStencilState {
        format: STENCIL_FORMAT,
        depth_write_enabled: false,
        depth_compare: CompareFunction::Always,
        stencil: StencilState {
            front: face,
            back: face,
            read_mask: 0xFF,
            write_mask: 0xFF,
        },
        bias: DepthBiasState::default(),
    }
}

fn additive(operation: BlendOperation) -> BlendComponent {
    BlendComponent {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::One,
        operation,
    }
}

/// One way of drawing into a colour target.
struct PassSetup<'a> {
    label: &'a str,
    shader: &'a ShaderModule,
    layout: &'a PipelineLayout,
    fragment: &'a str,
    format: TextureFormat,
    blend: Option<BlendState>,
    write_mask: ColorWrites,
    depth_stencil: Option<DepthStencilState>,
}

fn create_pipeline(
    device: &wgpu::Device,
    setup: PassSetup<'_>,
    buffers: &[VertexBufferLayout<'_>],
    topology: PrimitiveTopology,
) -> RenderPipeline {
    device.create_render_pipeline(&RenderPipelineDescriptor {
        label: Some(setup.label),
        layout: Some(setup.layout),
        vertex: VertexState {
            module: setup.shader,
            entry_point: Some("vs_main"),
            buffers,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(FragmentState {
            module: setup.shader,
            entry_point: Some(setup.fragment),
            targets: &[Some(ColorTargetState {
                format: setup.format,
                blend: setup.blend,
                write_mask: setup.write_mask,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: PrimitiveState {
            topology,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        },
        depth_stencil: setup.depth_stencil,
        multisample: MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

fn texture_entry(binding: u32, filterable: bool) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: BindingType::Texture {
            sample_type: TextureSampleType::Float { filterable },
            view_dimension: TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: BindingType::Sampler(SamplerBindingType::Filtering),
        count: None,
    }
}

fn create_pipelines(
    device: &wgpu::Device,
    uniform_layout: &BindGroupLayout,
    formats: TargetFormats,
) -> Pipelines {
    let shader = |label: &str, source: &'static str| {
        device.create_shader_module(ShaderModuleDescriptor {
            label: Some(label),
            source: ShaderSource::Wgsl(source.into()),
        })
    };
    let depth_shader = shader("depth-shader", include_str!("shaders/depth.wgsl"));
    let light_shader = shader("light-shader", include_str!("shaders/light.wgsl"));
    let mask_shader = shader("mask-shader", include_str!("shaders/mask.wgsl"));
    let fov_shader = shader("fov-shader", include_str!("shaders/fov.wgsl"));
    let blur_shader = shader("blur-shader", include_str!("shaders/blur.wgsl"));

    let light_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("light-bind-group-layout"),
        entries: &[texture_entry(0, true), sampler_entry(1), texture_entry(2, false)],
    });
    let fov_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("fov-bind-group-layout"),
        entries: &[texture_entry(0, false)],
    });
    let blur_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("blur-bind-group-layout"),
        entries: &[texture_entry(0, true), sampler_entry(1)],
    });

    let pipeline_layout = |label: &str, layouts: &[&BindGroupLayout]| {
        device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: layouts,
            immediate_size: 0,
        })
    };
    let depth_layout = pipeline_layout("depth-pipeline-layout", &[uniform_layout]);
    let light_pipeline_layout =
        pipeline_layout("light-pipeline-layout", &[uniform_layout, &light_layout]);
    let mask_layout = pipeline_layout("mask-pipeline-layout", &[uniform_layout]);
    let fov_pipeline_layout = pipeline_layout("fov-pipeline-layout", &[uniform_layout, &fov_layout]);
    let blur_pipeline_layout =
        pipeline_layout("blur-pipeline-layout", &[uniform_layout, &blur_layout]);

    let segment_buffers = [
        VertexBufferLayout {
            array_stride: std::mem::size_of::<SegmentVertex>() as wgpu::BufferAddress,
            step_mode: VertexStepMode::Vertex,
            attributes: &vertex_attr_array![0 => Float32x4],
        },
        VertexBufferLayout {
            array_stride: std::mem::size_of::<DepthInstance>() as wgpu::BufferAddress,
            step_mode: VertexStepMode::Instance,
            attributes: &vertex_attr_array![1 => Float32x2, 2 => Float32, 3 => Float32],
        },
    ];
    let light_buffers = [VertexBufferLayout {
        array_stride: std::mem::size_of::<LightVertex>() as wgpu::BufferAddress,
        step_mode: VertexStepMode::Vertex,
        attributes: &vertex_attr_array![
            0 => Float32x2,
            1 => Float32x2,
            2 => Float32x2,
            3 => Float32x4,
            4 => Float32x4,
            5 => Float32x4,
            6 => Float32x2
        ],
    }];
    let mask_buffers = [VertexBufferLayout {
        array_stride: std::mem::size_of::<MaskVertex>() as wgpu::BufferAddress,
        step_mode: VertexStepMode::Vertex,
        attributes: &vertex_attr_array![0 => Float32x2],
    }];

    let depth = create_pipeline(
        device,
        PassSetup {
            label: "depth-pipeline",
            shader: &depth_shader,
            layout: &depth_layout,
            fragment: "fs_main",
            format: formats.depth_color,
            blend: None,
            write_mask: ColorWrites::ALL,
            depth_stencil: Some(DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
                stencil: StencilState::default(),
                bias: DepthBiasState::default(),
            }),
        },
        &segment_buffers,
        PrimitiveTopology::LineList,
    );

    let light = |label, fragment, blend, write_mask, depth_stencil| {
        create_pipeline(
            device,
            PassSetup {
                label,
                shader: &light_shader,
                layout: &light_pipeline_layout,
                fragment,
                format: formats.light,
                blend,
                write_mask,
                depth_stencil: Some(depth_stencil),
            },
            &light_buffers,
            PrimitiveTopology::TriangleList,
        )
    };
    let lit_area = stencil_state(CompareFunction::Equal, StencilOperation::Keep);
    let additive_rgb = Some(BlendState {
        color: additive(BlendOperation::Add),
        alpha: additive(BlendOperation::Add),
    });

    let light_batch = light("light-batch-pipeline", "fs_light", additive_rgb, ColorWrites::COLOR, lit_area.clone());
    let soft_shadow = light(
        "soft-shadow-pipeline",
        "fs_shadow_soft",
        Some(BlendState {
            color: additive(BlendOperation::Add),
            alpha: additive(BlendOperation::Add),
        }),
        ColorWrites::ALPHA,
        lit_area.clone(),
    );
    let soft_clamp = light(
        "soft-clamp-pipeline",
        "fs_alpha_one",
        Some(BlendState {
            color: additive(BlendOperation::Add),
            alpha: additive(BlendOperation::Min),
        }),
        ColorWrites::ALPHA,
        lit_area.clone(),
    );
    let soft_light = light(
        "soft-light-pipeline",
        "fs_light",
        Some(BlendState {
            color: BlendComponent {
                src_factor: BlendFactor::OneMinusDstAlpha,
                dst_factor: BlendFactor::One,
                operation: BlendOperation::Add,
            },
            alpha: additive(BlendOperation::Add),
        }),
        ColorWrites::COLOR,
        lit_area.clone(),
    );
    let alpha_clear = light(
        "alpha-clear-pipeline",
        "fs_alpha_zero",
        None,
        ColorWrites::ALPHA,
        stencil_state(CompareFunction::Always, StencilOperation::Keep),
    );
    let hard_shadow = light(
        "hard-shadow-pipeline",
        "fs_shadow_hard",
        None,
        ColorWrites::empty(),
        stencil_state(CompareFunction::Greater, StencilOperation::Replace),
    );
    let hard_light = light(
        "hard-light-pipeline",
        "fs_light",
        additive_rgb,
        ColorWrites::COLOR,
        stencil_state(CompareFunction::Greater, StencilOperation::Keep),
    );

    let lighting_fov = create_pipeline(
        device,
        PassSetup {
            label: "lighting-fov-pipeline",
            shader: &fov_shader,
            layout: &fov_pipeline_layout,
            fragment: "fs_main",
            format: formats.light,
            blend: None,
            write_mask: ColorWrites::empty(),
            depth_stencil: Some(stencil_state(CompareFunction::Always, StencilOperation::Replace)),
        },
        &[],
        PrimitiveTopology::TriangleList,
    );
    let occluder_mask = create_pipeline(
        device,
        PassSetup {
            label: "occluder-mask-pipeline",
            shader: &mask_shader,
            layout: &mask_layout,
            fragment: "fs_main",
            format: formats.light,
            blend: None,
            write_mask: ColorWrites::empty(),
            depth_stencil: Some(stencil_state(
                CompareFunction::GreaterEqual,
                StencilOperation::Replace,
            )),
        },
        &mask_buffers,
        PrimitiveTopology::TriangleList,
    );
    let blur = create_pipeline(
        device,
        PassSetup {
            label: "blur-pipeline",
            shader: &blur_shader,
            layout: &blur_pipeline_layout,
            fragment: "fs_blur",
            format: formats.light,
            blend: None,
            write_mask: ColorWrites::ALL,
            depth_stencil: None,
        },
        &[],
        PrimitiveTopology::TriangleList,
    );
    let merge = create_pipeline(
        device,
        PassSetup {
            label: "wall-bleed-merge-pipeline",
            shader: &blur_shader,
            layout: &blur_pipeline_layout,
            fragment: "fs_merge",
            format: formats.light,
            blend: None,
            write_mask: ColorWrites::COLOR,
            depth_stencil: Some(stencil_state(CompareFunction::Equal, StencilOperation::Keep)),
        },
        &[],
        PrimitiveTopology::TriangleList,
    );
    let final_fov = create_pipeline(
        device,
        PassSetup {
            label: "fov-composite-pipeline",
            shader: &fov_shader,
            layout: &fov_pipeline_layout,
            fragment: "fs_main",
            format: FRAMEBUFFER_FORMAT,
            blend: None,
            write_mask: ColorWrites::ALL,
            depth_stencil: Some(stencil_state(CompareFunction::Always, StencilOperation::Replace)),
        },
        &[],
        PrimitiveTopology::TriangleList,
    );

    Pipelines {
        light_layout,
        fov_layout,
        blur_layout,
        depth,
        light_batch,
        soft_shadow,
        soft_clamp,
        soft_light,
        alpha_clear,
        hard_shadow,
        hard_light,
        lighting_fov,
        occluder_mask,
        blur,
        merge,
        final_fov,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Eye, Viewport};
    use crate::color::Color;
    use crate::config::LightingConfig;
    use crate::light::LightComponent;
    use crate::math::{Transform2D, Vec2};
    use crate::occluder::OccluderComponent;
    use crate::renderer::{LightingRenderer, MapLighting};
    use crate::spatial::{MapId, SpatialWorld};

    #[test]
    fn test_pass_uniforms_fit_one_slot() {
        assert_eq!(std::mem::size_of::<PassUniforms>(), 64);
        let uniforms = PassUniforms::from_affine(&Affine2::from_scale(glam::Vec2::new(2.0, 3.0)))
            .with_target_size((640, 480));
        assert_eq!(uniforms.affine, [2.0, 0.0, 0.0, 3.0]);
        assert_eq!(uniforms.translation, [0.0, 0.0, 640.0, 480.0]);
    }

    #[test]
    fn test_missing_float_support_selects_packed_targets() {
        assert_eq!(TargetFormats::select(true, true), TargetFormats::FLOAT);
        assert!(TargetFormats::FLOAT.is_float());
        assert_eq!(TargetFormats::FLOAT.depth_flag(), 0.0);

        for (light, depth) in [(true, false), (false, true), (false, false)] {
            let formats = TargetFormats::select(light, depth);
            assert_eq!(formats, TargetFormats::UNORM);
            assert!(!formats.is_float());
            assert_eq!(formats.depth_flag(), 1.0);
        }
    }

    #[test]
    fn test_scissor_is_clamped_to_target() {
        let scissor = ScissorRect {
            x: 300,
            y: 10,
            width: 100,
            height: 20,
        };
        assert_eq!(clamp_scissor(&scissor, (320, 240)), Some((300, 10, 20, 20)));
        assert_eq!(clamp_scissor(&scissor, (300, 240)), None);
    }

    #[test]
    fn test_renders_headless_frames() {
        let Ok(backend) = WgpuBackend::headless() else {
            return;
        };

        let map = MapId(1);
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(map, Transform2D::identity());
        world.spawn_light(
            tree,
            Transform2D::from_position(Vec2::new(-2.0, 0.0)),
            LightComponent::new(6.0, Color::WHITE),
        );
        world.spawn_light(
            tree,
            Transform2D::from_position(Vec2::new(3.0, 1.0)),
            LightComponent::new(4.0, Color::rgb(1.0, 0.5, 0.2)).with_shadows(false),
        );
        world.spawn_occluder(
            tree,
            Transform2D::from_position(Vec2::new(0.0, 0.0)),
            OccluderComponent::tile(),
        );

        let mut renderer = LightingRenderer::new(backend, LightingConfig::default()).unwrap();
        let eye = Eye::new(Vec2::ZERO, map);
        let viewport = Viewport::new(320, 240);
        for _ in 0..2 {
            let stats = renderer
                .render_frame(&world, &eye, &viewport, &MapLighting::default())
                .unwrap();
            assert_eq!(stats.total_lights, 2);
            assert_eq!(stats.shadow_lights, 1);
        }
        assert!(renderer.backend().framebuffer_view().is_some());
    }

    #[test]
    fn test_renders_headless_frames_on_packed_targets() {
        let Ok(backend) = WgpuBackend::headless() else {
            return;
        };
        let WgpuBackend { device, queue, .. } = backend;
        let backend = WgpuBackend::with_formats(TargetFormats::UNORM, device, queue).unwrap();
        assert!(!backend.capabilities().float_render_targets);

        let map = MapId(1);
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(map, Transform2D::identity());
        world.spawn_light(
            tree,
            Transform2D::from_position(Vec2::new(-2.0, 0.0)),
            LightComponent::new(6.0, Color::WHITE),
        );
        world.spawn_occluder(tree, Transform2D::identity(), OccluderComponent::tile());

        let mut renderer = LightingRenderer::new(backend, LightingConfig::default()).unwrap();
        let stats = renderer
            .render_frame(&world, &Eye::new(Vec2::ZERO, map), &Viewport::new(320, 240), &MapLighting::default())
            .unwrap();
        assert_eq!(stats.shadow_lights, 1);
    }
}
