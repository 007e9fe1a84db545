//! GPU execution of frame plans.
//!
//! Everything device-facing lives here: adapter/device bring-up, the
//! layer-quad and filter pipelines, stencil clip state, and the
//! [`WgpuAllocator`] that backs the texture cache's buffers with real
//! textures. The rest of the renderer never touches wgpu.

use std::collections::HashMap;
use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use filters::{FilterAction, FilterProgram, PassSource};
use geometry::{IntPoint, IntRect, IntSize, Matrix4};
use static_assertions::const_assert_eq;
use texture_cache::{BackingPolicy, BufferAllocator, GpuBufferId, TextureCache, TextureKey};

use crate::plan::{DrawOp, FramePlan};

const UNIFORM_STRIDE: u64 = 256;

#[derive(Debug)]
pub enum GpuInitError {
    /// No usable adapter; hardware compositing is unavailable and every
    /// frame operation must become a no-op rather than a crash.
    AdapterUnavailable(String),
    DeviceUnavailable(String),
}

impl std::fmt::Display for GpuInitError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuInitError::AdapterUnavailable(message) => {
                write!(formatter, "no compositing adapter: {message}")
            }
            GpuInitError::DeviceUnavailable(message) => {
                write!(formatter, "compositing device unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for GpuInitError {}

#[derive(Debug)]
pub enum RenderError {
    /// GPU reset / device loss. Fatal for the render path; the owner must
    /// tear compositing down rather than keep drawing garbage.
    ContextLost,
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::ContextLost => formatter.write_str("GPU context lost"),
        }
    }
}

impl std::error::Error for RenderError {}

/// Backs [`GpuBufferId`]s with wgpu textures. Shared between the texture
/// cache (allocation, deferred destruction) and plan execution (views).
pub struct WgpuAllocator {
    device: wgpu::Device,
    queue: wgpu::Queue,
    textures: HashMap<GpuBufferId, wgpu::Texture>,
    next_id: u64,
}

impl WgpuAllocator {
    fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            textures: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn view(&self, buffer: GpuBufferId) -> Option<wgpu::TextureView> {
        self.textures
            .get(&buffer)
            .map(|texture| texture.create_view(&wgpu::TextureViewDescriptor::default()))
    }

    fn texture(&self, buffer: GpuBufferId) -> Option<&wgpu::Texture> {
        self.textures.get(&buffer)
    }
}

impl BufferAllocator for WgpuAllocator {
    fn allocate(&mut self, size: IntSize, _policy: BackingPolicy) -> Option<GpuBufferId> {
        if size.is_empty() {
            return None;
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("compositor.layer_texture"),
            size: wgpu::Extent3d {
                width: size.width,
                height: size.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let id = GpuBufferId(self.next_id);
        self.next_id += 1;
        self.textures.insert(id, texture);
        Some(id)
    }

    fn destroy(&mut self, buffer: GpuBufferId) {
        if let Some(texture) = self.textures.remove(&buffer) {
            texture.destroy();
        }
    }

    fn upload(&mut self, buffer: GpuBufferId, pixels: &[u8], pixels_size: IntSize, origin: IntPoint) {
        let Some(texture) = self.textures.get(&buffer) else {
            log::warn!("upload to unknown buffer {buffer:?} dropped");
            return;
        };
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: origin.x as u32,
                    y: origin.y as u32,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(pixels_size.width * 4),
                rows_per_image: Some(pixels_size.height),
            },
            wgpu::Extent3d {
                width: pixels_size.width,
                height: pixels_size.height,
                depth_or_array_layers: 1,
            },
        );
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct QuadUniform {
    transform: [f32; 16],
    rect: [f32; 4],
    /// x: opacity or filter amount, y: shader mode, z/w: offset.
    params: [f32; 4],
    color: [f32; 4],
}

const_assert_eq!(std::mem::size_of::<QuadUniform>(), 112);

const MODE_TEXTURED: f32 = 0.0;
const MODE_FLAT_COLOR: f32 = 1.0;
const MODE_HOLE_PUNCH: f32 = 2.0;

/// The device-owning half of the renderer, living on the compositing
/// thread. Executes frame plans; reports itself non-functional instead of
/// panicking when the GPU goes away.
pub struct GpuRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    quad_scene_pipeline: wgpu::RenderPipeline,
    quad_surface_pipeline: wgpu::RenderPipeline,
    hole_punch_pipeline: wgpu::RenderPipeline,
    stencil_raise_pipeline: wgpu::RenderPipeline,
    stencil_lower_pipeline: wgpu::RenderPipeline,
    quad_bind_group_layout: wgpu::BindGroupLayout,
    filter_pipeline: Option<wgpu::RenderPipeline>,
    sampler: wgpu::Sampler,
    white_texture_view: wgpu::TextureView,
    uniform_buffer: wgpu::Buffer,
    uniform_capacity: usize,
    /// Triangulated clip polygons for the frame's stencil scopes, in
    /// screen space.
    stencil_vertex_buffer: wgpu::Buffer,
    stencil_vertex_capacity: usize,
    stencil_texture: Option<(wgpu::Texture, wgpu::TextureView, IntSize)>,
    device_lost_receiver: mpsc::Receiver<String>,
    functional: bool,
}

impl GpuRenderer {
    /// Bring up the device and build all pipelines. Failure means
    /// hardware compositing is unavailable; the caller falls back to
    /// doing nothing, not to crashing.
    pub fn new() -> Result<(Self, WgpuAllocator), GpuInitError> {
        let (device, queue) = pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .map_err(|error| GpuInitError::AdapterUnavailable(error.to_string()))?;
            adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("compositor.device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    experimental_features: wgpu::ExperimentalFeatures::disabled(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    trace: wgpu::Trace::Off,
                })
                .await
                .map_err(|error| GpuInitError::DeviceUnavailable(error.to_string()))
        })?;

        let (device_lost_sender, device_lost_receiver) = mpsc::channel();
        device.set_device_lost_callback(move |reason, message| {
            let _ = device_lost_sender.send(format!("{reason:?}: {message}"));
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("compositor.sampler.linear"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            ..Default::default()
        });

        let white_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("compositor.white"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &white_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[255, 255, 255, 255],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        let white_texture_view =
            white_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let quad_bind_group_layout = Self::create_quad_bind_group_layout(&device);
        let quad_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("compositor.layer_quad"),
            source: wgpu::ShaderSource::Wgsl(include_str!("layer_quad.wgsl").into()),
        });
        let quad_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("compositor.quad_layout"),
            bind_group_layouts: &[&quad_bind_group_layout],
            immediate_size: 0,
        });

        let quad_scene_pipeline = Self::create_quad_pipeline(
            &device,
            &quad_pipeline_layout,
            &quad_shader,
            wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING,
            Some(Self::stencil_state(
                wgpu::CompareFunction::Equal,
                wgpu::StencilOperation::Keep,
            )),
            true,
            "compositor.pipeline.scene",
        );
        let quad_surface_pipeline = Self::create_quad_pipeline(
            &device,
            &quad_pipeline_layout,
            &quad_shader,
            wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING,
            None,
            true,
            "compositor.pipeline.surface",
        );
        let hole_punch_pipeline = Self::create_quad_pipeline(
            &device,
            &quad_pipeline_layout,
            &quad_shader,
            wgpu::BlendState::REPLACE,
            Some(Self::stencil_state(
                wgpu::CompareFunction::Equal,
                wgpu::StencilOperation::Keep,
            )),
            true,
            "compositor.pipeline.hole_punch",
        );
        let stencil_raise_pipeline = Self::create_stencil_pipeline(
            &device,
            &quad_pipeline_layout,
            &quad_shader,
            wgpu::StencilOperation::IncrementClamp,
            "compositor.pipeline.stencil_raise",
        );
        let stencil_lower_pipeline = Self::create_stencil_pipeline(
            &device,
            &quad_pipeline_layout,
            &quad_shader,
            wgpu::StencilOperation::DecrementClamp,
            "compositor.pipeline.stencil_lower",
        );

        // Filter shaders are non-essential: a compile failure disables
        // filtering for the process and content renders unfiltered.
        let filter_pipeline = {
            let error_scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
            let filter_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("compositor.filter_pass"),
                source: wgpu::ShaderSource::Wgsl(include_str!("filter_pass.wgsl").into()),
            });
            let filter_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("compositor.filter_layout"),
                bind_group_layouts: &[&quad_bind_group_layout],
                immediate_size: 0,
            });
            let pipeline = Self::create_quad_pipeline(
                &device,
                &filter_layout,
                &filter_shader,
                wgpu::BlendState::REPLACE,
                None,
                true,
                "compositor.pipeline.filter",
            );
            match pollster::block_on(error_scope.pop()) {
                None => Some(pipeline),
                Some(error) => {
                    log::error!("filter shader failed to build; filters disabled: {error}");
                    None
                }
            }
        };

        let uniform_capacity = 256;
        let uniform_buffer = Self::create_uniform_buffer(&device, uniform_capacity);
        let stencil_vertex_capacity = 256;
        let stencil_vertex_buffer =
            Self::create_stencil_vertex_buffer(&device, stencil_vertex_capacity);

        let allocator = WgpuAllocator::new(device.clone(), queue.clone());
        let renderer = Self {
            device,
            queue,
            quad_scene_pipeline,
            quad_surface_pipeline,
            hole_punch_pipeline,
            stencil_raise_pipeline,
            stencil_lower_pipeline,
            quad_bind_group_layout,
            filter_pipeline,
            sampler,
            white_texture_view,
            uniform_buffer,
            uniform_capacity,
            stencil_vertex_buffer,
            stencil_vertex_capacity,
            stencil_texture: None,
            device_lost_receiver,
            functional: true,
        };
        Ok((renderer, allocator))
    }

    pub fn is_functional(&self) -> bool {
        self.functional
    }

    pub fn filters_enabled(&self) -> bool {
        self.filter_pipeline.is_some()
    }

    fn stencil_state(
        compare: wgpu::CompareFunction,
        pass_op: wgpu::StencilOperation,
    ) -> wgpu::DepthStencilState {
        let face = wgpu::StencilFaceState {
            compare,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op,
        };
        wgpu::DepthStencilState {
            format: wgpu::TextureFormat::Stencil8,
            depth_write_enabled: false,
            depth_compare: wgpu::CompareFunction::Always,
            stencil: wgpu::StencilState {
                front: face,
                back: face,
                read_mask: 0xff,
                write_mask: 0xff,
            },
            bias: wgpu::DepthBiasState::default(),
        }
    }

    fn create_quad_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("compositor.quad_bind_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn create_quad_pipeline(
        device: &wgpu::Device,
        layout: &wgpu::PipelineLayout,
        shader: &wgpu::ShaderModule,
        blend: wgpu::BlendState,
        depth_stencil: Option<wgpu::DepthStencilState>,
        color_writes: bool,
        label: &str,
    ) -> wgpu::RenderPipeline {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(blend),
                    write_mask: if color_writes {
                        wgpu::ColorWrites::ALL
                    } else {
                        wgpu::ColorWrites::empty()
                    },
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        })
    }

    /// Stencil raise/lower pipelines draw the clip polygon itself, not a
    /// rect: vertices come pre-triangulated from the plan and pass
    /// through `vs_stencil` with the projection alone. Color writes are
    /// off; only the stencil buffer changes.
    fn create_stencil_pipeline(
        device: &wgpu::Device,
        layout: &wgpu::PipelineLayout,
        shader: &wgpu::ShaderModule,
        pass_op: wgpu::StencilOperation,
        label: &str,
    ) -> wgpu::RenderPipeline {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some("vs_stencil"),
                compilation_options: Default::default(),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: 8,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &[wgpu::VertexAttribute {
                        format: wgpu::VertexFormat::Float32x2,
                        offset: 0,
                        shader_location: 0,
                    }],
                }],
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::empty(),
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: Some(Self::stencil_state(wgpu::CompareFunction::Equal, pass_op)),
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        })
    }

    fn create_uniform_buffer(device: &wgpu::Device, capacity: usize) -> wgpu::Buffer {
        let size = (capacity as u64)
            .checked_mul(UNIFORM_STRIDE)
            .expect("uniform buffer size overflow");
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("compositor.quad_uniforms"),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn ensure_uniform_capacity(&mut self, required: usize) {
        if required <= self.uniform_capacity {
            return;
        }
        let expanded = required
            .checked_next_power_of_two()
            .expect("uniform capacity overflow");
        self.uniform_buffer = Self::create_uniform_buffer(&self.device, expanded);
        self.uniform_capacity = expanded;
    }

    fn create_stencil_vertex_buffer(device: &wgpu::Device, capacity: usize) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("compositor.stencil_vertices"),
            size: (capacity as u64) * 8,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn ensure_stencil_vertex_capacity(&mut self, required: usize) {
        if required <= self.stencil_vertex_capacity {
            return;
        }
        let expanded = required
            .checked_next_power_of_two()
            .expect("stencil vertex capacity overflow");
        self.stencil_vertex_buffer = Self::create_stencil_vertex_buffer(&self.device, expanded);
        self.stencil_vertex_capacity = expanded;
    }

    fn ensure_stencil(&mut self, size: IntSize) -> wgpu::TextureView {
        if let Some((_, view, existing)) = &self.stencil_texture {
            if *existing == size {
                return view.clone();
            }
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("compositor.stencil"),
            size: wgpu::Extent3d {
                width: size.width,
                height: size.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Stencil8,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.stencil_texture = Some((texture, view.clone(), size));
        view
    }

    fn check_device_lost(&mut self) {
        while let Ok(message) = self.device_lost_receiver.try_recv() {
            // Deliberate, controlled termination of the render path;
            // rebuilding all GPU state risks compositing garbage.
            log::error!("GPU device lost: {message}");
            self.functional = false;
        }
    }

    /// Replay a frame plan into `target_view`. Ops were planned entirely
    /// on the CPU; this function only binds and draws.
    pub fn execute(
        &mut self,
        plan: &FramePlan,
        cache: &TextureCache,
        allocator: &WgpuAllocator,
        target_view: &wgpu::TextureView,
        target_size: IntSize,
    ) -> Result<(), RenderError> {
        self.check_device_lost();
        if !self.functional {
            return Err(RenderError::ContextLost);
        }

        let uniforms = self.build_uniforms(plan, target_size, cache);
        self.ensure_uniform_capacity(uniforms.len().max(1));
        let mut staging = vec![0u8; uniforms.len() * UNIFORM_STRIDE as usize];
        for (index, uniform) in uniforms.iter().enumerate() {
            let offset = index * UNIFORM_STRIDE as usize;
            staging[offset..offset + std::mem::size_of::<QuadUniform>()]
                .copy_from_slice(bytemuck::bytes_of(uniform));
        }
        if !staging.is_empty() {
            self.queue.write_buffer(&self.uniform_buffer, 0, &staging);
        }

        let (stencil_vertices, stencil_ranges) = build_stencil_vertices(plan);
        self.ensure_stencil_vertex_capacity(stencil_vertices.len());
        if !stencil_vertices.is_empty() {
            self.queue.write_buffer(
                &self.stencil_vertex_buffer,
                0,
                bytemuck::cast_slice(&stencil_vertices),
            );
        }

        let stencil_view = self.ensure_stencil(target_size);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compositor.frame"),
            });

        self.encode_plan(
            plan,
            cache,
            allocator,
            target_view,
            target_size,
            &stencil_view,
            &stencil_ranges,
            &mut encoder,
        );

        self.queue.submit(Some(encoder.finish()));
        self.check_device_lost();
        if !self.functional {
            return Err(RenderError::ContextLost);
        }
        Ok(())
    }

    fn texture_view(
        &self,
        cache: &TextureCache,
        allocator: &WgpuAllocator,
        key: TextureKey,
    ) -> Option<wgpu::TextureView> {
        allocator.view(cache.buffer_of(key)?)
    }

    fn quad_bind_group(
        &self,
        content: &wgpu::TextureView,
        mask: Option<&wgpu::TextureView>,
        label: &str,
    ) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.quad_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.uniform_buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(std::mem::size_of::<QuadUniform>() as u64),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(content),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(
                        mask.unwrap_or(&self.white_texture_view),
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        })
    }

    fn build_uniforms(
        &self,
        plan: &FramePlan,
        target_size: IntSize,
        cache: &TextureCache,
    ) -> Vec<QuadUniform> {
        let scene_projection = Matrix4::orthographic(
            0.0,
            target_size.width.max(1) as f32,
            0.0,
            target_size.height.max(1) as f32,
        );
        let mut surface_projection = scene_projection;
        let mut uniforms = Vec::new();
        for op in &plan.ops {
            match op {
                DrawOp::BeginSurface { texture, .. } => {
                    let size = cache
                        .size_of(*texture)
                        .unwrap_or(IntSize::new(1, 1));
                    surface_projection = Matrix4::orthographic(
                        0.0,
                        size.width.max(1) as f32,
                        0.0,
                        size.height.max(1) as f32,
                    );
                }
                DrawOp::EndSurface { .. } => {
                    surface_projection = scene_projection;
                }
                DrawOp::HolePunch { rect, transform } => {
                    uniforms.push(quad_uniform(
                        scene_projection.multiply(transform),
                        *rect,
                        [0.0, MODE_HOLE_PUNCH, 0.0, 0.0],
                        [0.0; 4],
                    ));
                }
                DrawOp::DrawTile {
                    rect,
                    transform,
                    opacity,
                    ..
                }
                | DrawOp::DrawImage {
                    rect,
                    transform,
                    opacity,
                    ..
                }
                | DrawOp::DrawSurface {
                    rect,
                    transform,
                    opacity,
                    ..
                } => {
                    uniforms.push(quad_uniform(
                        surface_projection.multiply(transform),
                        *rect,
                        [*opacity, MODE_TEXTURED, 0.0, 0.0],
                        [0.0; 4],
                    ));
                }
                DrawOp::DrawColor {
                    rect,
                    transform,
                    opacity,
                    color,
                    ..
                } => {
                    uniforms.push(quad_uniform(
                        surface_projection.multiply(transform),
                        *rect,
                        [*opacity, MODE_FLAT_COLOR, 0.0, 0.0],
                        color.to_unit_rgba(),
                    ));
                }
                DrawOp::DebugBorder {
                    rect, transform, color, ..
                } => {
                    uniforms.push(quad_uniform(
                        surface_projection.multiply(transform),
                        *rect,
                        [1.0, MODE_FLAT_COLOR, 0.0, 0.0],
                        color.to_unit_rgba(),
                    ));
                }
                // Stencil passes draw pre-projected polygon vertices; the
                // uniform carries only the projection.
                DrawOp::BeginStencilClip { .. } | DrawOp::EndStencilClip { .. } => {
                    uniforms.push(quad_uniform(
                        scene_projection,
                        geometry::Rect::new(0.0, 0.0, 1.0, 1.0),
                        [1.0, MODE_FLAT_COLOR, 0.0, 0.0],
                        [0.0; 4],
                    ));
                }
                DrawOp::FilterPass { action, .. } => {
                    uniforms.push(quad_uniform(
                        Matrix4::IDENTITY,
                        geometry::Rect::new(0.0, 0.0, 1.0, 1.0),
                        [
                            action.amount,
                            filter_program_index(action.program),
                            action.offset.x,
                            action.offset.y,
                        ],
                        action.color.to_unit_rgba(),
                    ));
                }
                DrawOp::SetScissor { .. } => {}
            }
        }
        uniforms
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_plan(
        &self,
        plan: &FramePlan,
        cache: &TextureCache,
        allocator: &WgpuAllocator,
        target_view: &wgpu::TextureView,
        target_size: IntSize,
        stencil_view: &wgpu::TextureView,
        stencil_ranges: &[(u32, u32)],
        encoder: &mut wgpu::CommandEncoder,
    ) {
        let mut uniform_index: usize = 0;
        let mut next_offset = |index: &mut usize| {
            let offset = (*index as u64 * UNIFORM_STRIDE) as u32;
            *index += 1;
            offset
        };
        // Vertex ranges were built in plan order; the cursor tracks the
        // next unclaimed polygon and the stack pairs each EndStencilClip
        // with its opening polygon so the lower pass erases exactly what
        // the raise pass drew.
        let mut stencil_cursor: usize = 0;
        let mut stencil_stack: Vec<(u32, u32)> = Vec::new();

        // Surface blocks precede the main scene in the plan, so replay is
        // a single linear walk that switches render passes at the block
        // boundaries.
        let mut op_iter = plan.ops.iter().peekable();
        while let Some(op) = op_iter.peek() {
            match op {
                DrawOp::BeginSurface { .. } => {
                    self.encode_surface_block(
                        &mut op_iter,
                        &mut uniform_index,
                        &mut next_offset,
                        &mut stencil_cursor,
                        cache,
                        allocator,
                        encoder,
                    );
                }
                _ => break,
            }
        }

        // Main scene pass.
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("compositor.scene_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target_view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: stencil_view,
                depth_ops: None,
                stencil_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(0),
                    store: wgpu::StoreOp::Store,
                }),
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        pass.set_stencil_reference(0);

        for op in op_iter {
            match op {
                DrawOp::SetScissor { rect } => {
                    let rect = rect
                        .unwrap_or(IntRect::from_size(target_size))
                        .intersection(IntRect::from_size(target_size));
                    if rect.is_empty() {
                        pass.set_scissor_rect(0, 0, 1, 1);
                    } else {
                        pass.set_scissor_rect(
                            rect.min_x().max(0) as u32,
                            rect.min_y().max(0) as u32,
                            rect.size.width,
                            rect.size.height,
                        );
                    }
                }
                DrawOp::BeginStencilClip { depth, .. } => {
                    let range = stencil_ranges[stencil_cursor];
                    stencil_cursor += 1;
                    stencil_stack.push(range);
                    pass.set_pipeline(&self.stencil_raise_pipeline);
                    pass.set_vertex_buffer(0, self.stencil_vertex_buffer.slice(..));
                    pass.set_stencil_reference(depth - 1);
                    let offset = next_offset(&mut uniform_index);
                    let bind = self.quad_bind_group(
                        &self.white_texture_view,
                        None,
                        "compositor.bind.stencil_raise",
                    );
                    pass.set_bind_group(0, &bind, &[offset]);
                    if range.1 > 0 {
                        pass.draw(range.0..range.0 + range.1, 0..1);
                    }
                    pass.set_stencil_reference(*depth);
                }
                DrawOp::EndStencilClip { depth } => {
                    let range = stencil_stack
                        .pop()
                        .expect("stencil clip scopes balance in the plan");
                    pass.set_pipeline(&self.stencil_lower_pipeline);
                    pass.set_vertex_buffer(0, self.stencil_vertex_buffer.slice(..));
                    pass.set_stencil_reference(*depth);
                    let offset = next_offset(&mut uniform_index);
                    let bind = self.quad_bind_group(
                        &self.white_texture_view,
                        None,
                        "compositor.bind.stencil_lower",
                    );
                    pass.set_bind_group(0, &bind, &[offset]);
                    if range.1 > 0 {
                        pass.draw(range.0..range.0 + range.1, 0..1);
                    }
                    pass.set_stencil_reference(depth - 1);
                }
                DrawOp::HolePunch { .. } => {
                    let offset = next_offset(&mut uniform_index);
                    pass.set_pipeline(&self.hole_punch_pipeline);
                    let bind = self.quad_bind_group(
                        &self.white_texture_view,
                        None,
                        "compositor.bind.hole_punch",
                    );
                    pass.set_bind_group(0, &bind, &[offset]);
                    pass.draw(0..6, 0..1);
                }
                DrawOp::DrawTile { texture, .. }
                | DrawOp::DrawImage { texture, .. } => {
                    let offset = next_offset(&mut uniform_index);
                    let Some(view) = self.texture_view(cache, allocator, *texture) else {
                        continue;
                    };
                    pass.set_pipeline(&self.quad_scene_pipeline);
                    let bind = self.quad_bind_group(&view, None, "compositor.bind.layer");
                    pass.set_bind_group(0, &bind, &[offset]);
                    pass.draw(0..6, 0..1);
                }
                DrawOp::DrawSurface { texture, mask, .. } => {
                    let offset = next_offset(&mut uniform_index);
                    let Some(view) = self.texture_view(cache, allocator, *texture) else {
                        continue;
                    };
                    let mask_view =
                        mask.and_then(|mask| self.texture_view(cache, allocator, mask));
                    pass.set_pipeline(&self.quad_scene_pipeline);
                    let bind = self.quad_bind_group(
                        &view,
                        mask_view.as_ref(),
                        "compositor.bind.surface",
                    );
                    pass.set_bind_group(0, &bind, &[offset]);
                    pass.draw(0..6, 0..1);
                }
                DrawOp::DrawColor { .. } | DrawOp::DebugBorder { .. } => {
                    let offset = next_offset(&mut uniform_index);
                    pass.set_pipeline(&self.quad_scene_pipeline);
                    let bind = self.quad_bind_group(
                        &self.white_texture_view,
                        None,
                        "compositor.bind.flat",
                    );
                    pass.set_bind_group(0, &bind, &[offset]);
                    pass.draw(0..6, 0..1);
                }
                DrawOp::BeginSurface { .. }
                | DrawOp::EndSurface { .. }
                | DrawOp::FilterPass { .. } => {
                    debug_assert!(false, "surface block inside the scene pass");
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_surface_block<'a>(
        &self,
        ops: &mut std::iter::Peekable<std::slice::Iter<'a, DrawOp>>,
        uniform_index: &mut usize,
        next_offset: &mut impl FnMut(&mut usize) -> u32,
        stencil_cursor: &mut usize,
        cache: &TextureCache,
        allocator: &WgpuAllocator,
        encoder: &mut wgpu::CommandEncoder,
    ) {
        let Some(DrawOp::BeginSurface {
            texture, scratch, ..
        }) = ops.next()
        else {
            return;
        };
        let Some(front_view) = self.texture_view(cache, allocator, *texture) else {
            // Surface texture vanished; skip ops up to EndSurface while
            // keeping uniform indices and stencil ranges aligned.
            for op in ops.by_ref() {
                if op_consumes_uniform(op) {
                    let _ = next_offset(uniform_index);
                }
                if matches!(op, DrawOp::BeginStencilClip { .. }) {
                    *stencil_cursor += 1;
                }
                if matches!(op, DrawOp::EndSurface { .. }) {
                    break;
                }
            }
            return;
        };

        // Content sub-pass.
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("compositor.surface_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &front_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            while let Some(op) = ops.peek() {
                match op {
                    DrawOp::FilterPass { .. } | DrawOp::EndSurface { .. } => break,
                    DrawOp::DrawTile { texture, .. } | DrawOp::DrawImage { texture, .. } => {
                        let texture = *texture;
                        ops.next();
                        let offset = next_offset(uniform_index);
                        let Some(view) = self.texture_view(cache, allocator, texture) else {
                            continue;
                        };
                        pass.set_pipeline(&self.quad_surface_pipeline);
                        let bind =
                            self.quad_bind_group(&view, None, "compositor.bind.surface_content");
                        pass.set_bind_group(0, &bind, &[offset]);
                        pass.draw(0..6, 0..1);
                    }
                    DrawOp::DrawColor { .. } => {
                        ops.next();
                        let offset = next_offset(uniform_index);
                        pass.set_pipeline(&self.quad_surface_pipeline);
                        let bind = self.quad_bind_group(
                            &self.white_texture_view,
                            None,
                            "compositor.bind.surface_flat",
                        );
                        pass.set_bind_group(0, &bind, &[offset]);
                        pass.draw(0..6, 0..1);
                    }
                    _ => {
                        // Scissor/stencil scopes inside surfaces are rare;
                        // consume uniforms and stencil ranges to stay
                        // aligned and move on.
                        let op = ops.next().expect("peeked op exists");
                        if op_consumes_uniform(op) {
                            let _ = next_offset(uniform_index);
                        }
                        if matches!(op, DrawOp::BeginStencilClip { .. }) {
                            *stencil_cursor += 1;
                        }
                    }
                }
            }
        }

        // Filter ping-pong sub-passes. The planner pads the chain to an
        // even pass count so the final write lands back on the surface
        // texture.
        let mut actions: Vec<(&FilterAction, u32)> = Vec::new();
        while let Some(DrawOp::FilterPass { .. }) = ops.peek() {
            let Some(DrawOp::FilterPass { action, .. }) = ops.next() else {
                unreachable!("peeked a filter pass");
            };
            actions.push((action, next_offset(uniform_index)));
        }
        if !actions.is_empty() {
            self.encode_filter_chain(&actions, *texture, *scratch, cache, allocator, encoder);
        }

        if let Some(DrawOp::EndSurface { .. }) = ops.peek() {
            ops.next();
        }
    }

    /// Run a planned filter chain over a surface, alternating between its
    /// front and scratch textures. A shadow cast marks where the chain
    /// forks: the content as filtered so far is snapshotted right there,
    /// so the shadow composite at the end blends the shadow under that
    /// intermediate, not under the unfiltered original.
    fn encode_filter_chain(
        &self,
        actions: &[(&FilterAction, u32)],
        front: TextureKey,
        scratch: Option<TextureKey>,
        cache: &TextureCache,
        allocator: &WgpuAllocator,
        encoder: &mut wgpu::CommandEncoder,
    ) {
        let Some(filter_pipeline) = &self.filter_pipeline else {
            return;
        };
        let Some(front_texture) =
            cache.buffer_of(front).and_then(|buffer| allocator.texture(buffer))
        else {
            return;
        };
        let front_view = front_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let Some(scratch_texture) = scratch
            .and_then(|scratch| cache.buffer_of(scratch))
            .and_then(|buffer| allocator.texture(buffer))
        else {
            log::warn!("filter chain without a scratch texture; skipping");
            return;
        };
        let scratch_view = scratch_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut snapshot: Option<(wgpu::Texture, wgpu::TextureView)> = None;
        for (index, (action, offset)) in actions.iter().enumerate() {
            let (read_texture, read_view, write_view) = if pass_reads_scratch(index) {
                (scratch_texture, &scratch_view, &front_view)
            } else {
                (front_texture, &front_view, &scratch_view)
            };
            if action.program == FilterProgram::ShadowCast {
                let size = front_texture.size();
                let (texture, _) = snapshot.get_or_insert_with(|| {
                    let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                        label: Some("compositor.filter_snapshot"),
                        size,
                        mip_level_count: 1,
                        sample_count: 1,
                        dimension: wgpu::TextureDimension::D2,
                        format: wgpu::TextureFormat::Rgba8Unorm,
                        usage: wgpu::TextureUsages::TEXTURE_BINDING
                            | wgpu::TextureUsages::COPY_DST,
                        view_formats: &[],
                    });
                    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                    (texture, view)
                });
                encoder.copy_texture_to_texture(
                    read_texture.as_image_copy(),
                    texture.as_image_copy(),
                    size,
                );
            }
            let snapshot_view = snapshot.as_ref().map(|(_, view)| view);
            // Shadow compositing samples both the blurred shadow and the
            // original content in one pass; the original rides in the
            // secondary (mask) binding.
            let (content_view, secondary_view) = match (action.program, action.source) {
                (FilterProgram::ShadowComposite, _) => (read_view, snapshot_view),
                (_, PassSource::LayerContents) => (snapshot_view.unwrap_or(read_view), None),
                _ => (read_view, None),
            };
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("compositor.filter_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: write_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            pass.set_pipeline(filter_pipeline);
            let bind =
                self.quad_bind_group(content_view, secondary_view, "compositor.bind.filter");
            pass.set_bind_group(0, &bind, &[*offset]);
            pass.draw(0..6, 0..1);
        }
    }
}

/// Ping-pong read side for filter pass `index`: even passes read the
/// surface's own texture, odd passes read the scratch.
fn pass_reads_scratch(index: usize) -> bool {
    index % 2 == 1
}

fn op_consumes_uniform(op: &DrawOp) -> bool {
    !matches!(
        op,
        DrawOp::SetScissor { .. } | DrawOp::BeginSurface { .. } | DrawOp::EndSurface { .. }
    )
}

fn quad_uniform(
    transform: Matrix4,
    rect: geometry::Rect,
    params: [f32; 4],
    color: [f32; 4],
) -> QuadUniform {
    QuadUniform {
        transform: transform.as_column_major(),
        rect: [rect.min_x(), rect.min_y(), rect.size.width, rect.size.height],
        params,
        color,
    }
}

/// Fan-triangulate every stencil clip polygon in the plan into one
/// vertex list, returning per-scope `(first_vertex, vertex_count)`
/// ranges in plan order. Clip polygons come from convex quads clipped
/// against the image plane, so they stay convex and a fan is exact.
fn build_stencil_vertices(plan: &FramePlan) -> (Vec<[f32; 2]>, Vec<(u32, u32)>) {
    let mut vertices: Vec<[f32; 2]> = Vec::new();
    let mut ranges = Vec::new();
    for op in &plan.ops {
        let DrawOp::BeginStencilClip { quad, .. } = op else {
            continue;
        };
        let start = vertices.len() as u32;
        if quad.len() >= 3 {
            let first = [quad[0].x, quad[0].y];
            for pair in quad[1..].windows(2) {
                vertices.push(first);
                vertices.push([pair[0].x, pair[0].y]);
                vertices.push([pair[1].x, pair[1].y]);
            }
        }
        ranges.push((start, vertices.len() as u32 - start));
    }
    (vertices, ranges)
}

fn filter_program_index(program: FilterProgram) -> f32 {
    match program {
        FilterProgram::Passthrough => 0.0,
        FilterProgram::Grayscale => 1.0,
        FilterProgram::Sepia => 2.0,
        FilterProgram::Saturate => 3.0,
        FilterProgram::HueRotate => 4.0,
        FilterProgram::Invert => 5.0,
        FilterProgram::Brightness => 6.0,
        FilterProgram::Contrast => 7.0,
        FilterProgram::Opacity => 8.0,
        FilterProgram::BlurY => 9.0,
        FilterProgram::BlurX => 10.0,
        FilterProgram::ShadowCast => 11.0,
        FilterProgram::ShadowComposite => 12.0,
    }
}
