//! [`RenderDevice`] on top of wgpu.
//!
//! wgpu has no persistent output-merger state, so the device keeps the bound targets,
//! views, uniforms and fixed-function state itself and records one short render pass per
//! clear or draw. Pipelines are created lazily and cached by everything that affects them.
//! Draws into a layered depth target with no color attachments are replayed once per layer;
//! the layer index reaches the shader through a dynamic uniform offset.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use wgpu::util::DeviceExt;

use super::device::{
    BlendMode, CompareFunction, CullMode, DepthStencilDesc, DepthViewDesc, DeviceError, PrimitiveTopology, Program,
    RasterizerDesc, RenderDevice, SampledViewDesc, StencilOp, TextureDesc, TextureFormat, TextureUsage,
    ViewDimension, Viewport,
};

pub const DEFAULT_TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const SHADOW_SAMPLER_BINDING: u32 = 8;
const LAYER_INDEX_BINDING: u32 = 9;
const UNIFORM_BINDING_BASE: u32 = 16;
const LAYER_UNIFORM_STRIDE: u64 = 256;
const MAX_DRAW_LAYERS: u32 = 6;

const LOAD_STORE_DEPTH: wgpu::Operations<f32> =
    wgpu::Operations { load: wgpu::LoadOp::Load, store: wgpu::StoreOp::Store };
const LOAD_STORE_STENCIL: wgpu::Operations<u32> =
    wgpu::Operations { load: wgpu::LoadOp::Load, store: wgpu::StoreOp::Store };

pub struct WgpuTexture {
    texture: wgpu::Texture,
    label: &'static str,
    format: TextureFormat,
    gpu_format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    layers: u32,
}

impl WgpuTexture {
    pub fn raw(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Clone)]
pub struct WgpuRenderView {
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
}

#[derive(Clone)]
pub struct WgpuDepthView {
    layer_views: Vec<wgpu::TextureView>,
    format: wgpu::TextureFormat,
    read_only: bool,
    has_stencil: bool,
    width: u32,
    height: u32,
}

impl WgpuDepthView {
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[derive(Clone)]
pub struct WgpuSampledView {
    view: wgpu::TextureView,
    dimension: ViewDimension,
    depth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LayoutKey {
    program: Program,
    textures: Vec<(u32, ViewDimension, bool)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RasterizerKey {
    cull: CullMode,
    depth_bias: i32,
    slope_bits: u32,
    depth_clip: bool,
}

impl From<RasterizerDesc> for RasterizerKey {
    fn from(desc: RasterizerDesc) -> Self {
        Self {
            cull: desc.cull,
            depth_bias: desc.depth_bias,
            slope_bits: desc.slope_scaled_depth_bias.to_bits(),
            depth_clip: desc.depth_clip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    layout: LayoutKey,
    color_formats: Vec<Option<wgpu::TextureFormat>>,
    depth_format: Option<(wgpu::TextureFormat, bool)>,
    depth_stencil: DepthStencilDesc,
    rasterizer: RasterizerKey,
    topology: PrimitiveTopology,
    blend: BlendMode,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    normal_format: wgpu::TextureFormat,
    unclipped_depth: bool,
    _default_texture: wgpu::Texture,
    default_target: WgpuRenderView,
    shadow_sampler: wgpu::Sampler,
    layer_buffer: wgpu::Buffer,
    shaders: HashMap<Program, wgpu::ShaderModule>,
    layouts: HashMap<LayoutKey, wgpu::BindGroupLayout>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    uniforms: HashMap<u32, wgpu::Buffer>,
    colors: Vec<Option<WgpuRenderView>>,
    depth: Option<WgpuDepthView>,
    sampled: BTreeMap<u32, WgpuSampledView>,
    viewport: Viewport,
    depth_stencil: DepthStencilDesc,
    stencil_ref: u32,
    rasterizer: RasterizerDesc,
    topology: PrimitiveTopology,
    blend: BlendMode,
    draw_calls: u64,
}

impl WgpuDevice {
    /// Opens an adapter without a surface; the default target is an offscreen texture.
    pub async fn new_headless(width: u32, height: u32) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request headless adapter")?;
        let adapter_features = adapter.features();
        let unclipped_depth = adapter_features.contains(wgpu::Features::DEPTH_CLIP_CONTROL);
        let rg11b10_renderable = adapter_features.contains(wgpu::Features::RG11B10UFLOAT_RENDERABLE);
        let mut required_features = wgpu::Features::empty();
        if unclipped_depth {
            required_features |= wgpu::Features::DEPTH_CLIP_CONTROL;
        }
        if rg11b10_renderable {
            required_features |= wgpu::Features::RG11B10UFLOAT_RENDERABLE;
        }
        let required_limits = wgpu::Limits::default().using_resolution(adapter.limits());
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Deferred Device"),
            required_features,
            required_limits: required_limits.clone(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) =
            adapter.request_device(&device_desc).await.context("Failed to request headless device")?;
        let adapter_info = adapter.get_info();

        let normal_format = if rg11b10_renderable {
            wgpu::TextureFormat::Rg11b10Ufloat
        } else {
            log::warn!("[renderer] Rg11b10Ufloat is not renderable on this adapter; normals use Rgba16Float");
            wgpu::TextureFormat::Rgba16Float
        };
        if !unclipped_depth {
            log::warn!("[renderer] depth clip control unavailable; shadow casters are clipped to the volume");
        }

        let width = width.max(1);
        let height = height.max(1);
        let default_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Default Target"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEFAULT_TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let default_target = WgpuRenderView {
            view: default_texture.create_view(&wgpu::TextureViewDescriptor::default()),
            format: DEFAULT_TARGET_FORMAT,
            width,
            height,
        };

        let shadow_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Shadow Comparison Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            lod_min_clamp: 0.0,
            lod_max_clamp: 0.0,
            compare: Some(wgpu::CompareFunction::LessEqual),
            anisotropy_clamp: 1,
            border_color: None,
        });

        let words_per_layer = (LAYER_UNIFORM_STRIDE / 4) as usize;
        let mut layer_words = vec![0u32; words_per_layer * MAX_DRAW_LAYERS as usize];
        for layer in 0..MAX_DRAW_LAYERS as usize {
            layer_words[layer * words_per_layer] = layer as u32;
        }
        let layer_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Layer Index Buffer"),
            contents: bytemuck::cast_slice(&layer_words),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        log::info!(
            "[renderer] headless device on {} ({:?}), {}x{}",
            adapter_info.name,
            adapter_info.backend,
            width,
            height
        );

        Ok(Self {
            device,
            queue,
            adapter_info,
            limits: required_limits,
            normal_format,
            unclipped_depth,
            _default_texture: default_texture,
            default_target: default_target.clone(),
            shadow_sampler,
            layer_buffer,
            shaders: HashMap::new(),
            layouts: HashMap::new(),
            pipelines: HashMap::new(),
            uniforms: HashMap::new(),
            colors: vec![Some(default_target)],
            depth: None,
            sampled: BTreeMap::new(),
            viewport: Viewport::sized(width, height),
            depth_stencil: DepthStencilDesc::default(),
            stencil_ref: 0,
            rasterizer: RasterizerDesc::default(),
            topology: PrimitiveTopology::default(),
            blend: BlendMode::default(),
            draw_calls: 0,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn default_size(&self) -> (u32, u32) {
        (self.default_target.width, self.default_target.height)
    }

    pub fn draw_calls(&self) -> u64 {
        self.draw_calls
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Blocks until every submitted command has finished.
    pub fn wait_idle(&self) -> Result<(), DeviceError> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|err| DeviceError::Backend { reason: err.to_string() })
    }

    fn sampled_at(&self, program: Program, stage: u32) -> Result<&WgpuSampledView, DeviceError> {
        self.sampled.get(&stage).ok_or(DeviceError::MissingBinding { program, binding: stage })
    }

    fn gpu_format(&self, format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Depth24Stencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rg11b10Float => self.normal_format,
        }
    }

    fn shader(&mut self, program: Program) -> wgpu::ShaderModule {
        let device = &self.device;
        self.shaders
            .entry(program)
            .or_insert_with(|| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(program.label()),
                    source: wgpu::ShaderSource::Wgsl(shader_source(program).into()),
                })
            })
            .clone()
    }

    fn bind_group_layout(&mut self, key: &LayoutKey) -> wgpu::BindGroupLayout {
        if let Some(layout) = self.layouts.get(key) {
            return layout.clone();
        }
        let visibility = wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT;
        let mut entries = Vec::new();
        for &(stage, dimension, depth) in &key.textures {
            let sample_type = if depth {
                wgpu::TextureSampleType::Depth
            } else {
                wgpu::TextureSampleType::Float { filterable: false }
            };
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: stage,
                visibility,
                ty: wgpu::BindingType::Texture {
                    sample_type,
                    view_dimension: view_dimension(dimension),
                    multisampled: false,
                },
                count: None,
            });
        }
        if uses_shadow_sampler(key.program) {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: SHADOW_SAMPLER_BINDING,
                visibility,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                count: None,
            });
        }
        if key.program.is_layered() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: LAYER_INDEX_BINDING,
                visibility,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(16),
                },
                count: None,
            });
        }
        for &slot in key.program.uniform_slots() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: UNIFORM_BINDING_BASE + slot,
                visibility,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(key.program.label()),
            entries: &entries,
        });
        self.layouts.insert(key.clone(), layout.clone());
        layout
    }

    fn pipeline(&mut self, key: &PipelineKey) -> wgpu::RenderPipeline {
        if let Some(pipeline) = self.pipelines.get(key) {
            return pipeline.clone();
        }
        let program = key.layout.program;
        let bind_group_layout = self.bind_group_layout(&key.layout);
        let module = self.shader(program);
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(program.label()),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color_formats
            .iter()
            .map(|format| {
                format.map(|format| wgpu::ColorTargetState {
                    format,
                    blend: blend_state(key.blend),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        let fragment = has_fragment_stage(program).then(|| wgpu::FragmentState {
            module: &module,
            entry_point: Some("fs_main"),
            targets: &targets,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        let depth_stencil = key.depth_format.map(|(format, has_stencil)| {
            depth_stencil_state(format, has_stencil, &key.depth_stencil, &self.rasterizer)
        });
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(program.label()),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment,
            primitive: wgpu::PrimitiveState {
                topology: primitive_topology(key.topology),
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: cull_face(key.rasterizer.cull),
                unclipped_depth: self.unclipped_depth && !key.rasterizer.depth_clip,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        log::debug!("[renderer] built pipeline for {} ({} cached)", program.label(), self.pipelines.len());
        self.pipelines.insert(key.clone(), pipeline.clone());
        pipeline
    }

    fn bind_group(&mut self, key: &LayoutKey) -> Result<wgpu::BindGroup, DeviceError> {
        let layout = self.bind_group_layout(key);
        let program = key.program;
        let mut entries = Vec::new();
        for &(stage, _, _) in &key.textures {
            let view = self.sampled_at(program, stage)?;
            entries.push(wgpu::BindGroupEntry {
                binding: stage,
                resource: wgpu::BindingResource::TextureView(&view.view),
            });
        }
        if uses_shadow_sampler(program) {
            entries.push(wgpu::BindGroupEntry {
                binding: SHADOW_SAMPLER_BINDING,
                resource: wgpu::BindingResource::Sampler(&self.shadow_sampler),
            });
        }
        if program.is_layered() {
            entries.push(wgpu::BindGroupEntry {
                binding: LAYER_INDEX_BINDING,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &self.layer_buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(16),
                }),
            });
        }
        for &slot in program.uniform_slots() {
            let binding = UNIFORM_BINDING_BASE + slot;
            let buffer = self.uniforms.get(&slot).ok_or(DeviceError::MissingBinding { program, binding })?;
            entries.push(wgpu::BindGroupEntry { binding, resource: buffer.as_entire_binding() });
        }
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(program.label()),
            layout: &layout,
            entries: &entries,
        }))
    }
}

impl RenderDevice for WgpuDevice {
    type Texture = WgpuTexture;
    type RenderView = WgpuRenderView;
    type DepthView = WgpuDepthView;
    type SampledView = WgpuSampledView;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<WgpuTexture, DeviceError> {
        let max_dim = self.limits.max_texture_dimension_2d;
        if desc.width == 0
            || desc.height == 0
            || desc.array_layers == 0
            || desc.width > max_dim
            || desc.height > max_dim
            || desc.array_layers > self.limits.max_texture_array_layers
        {
            return Err(DeviceError::TextureRejected {
                label: desc.label.to_string(),
                reason: format!(
                    "extent {}x{}x{} outside device limits (max {max_dim})",
                    desc.width, desc.height, desc.array_layers
                ),
            });
        }
        let mut usage = wgpu::TextureUsages::empty();
        if desc.usage.intersects(TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_STENCIL) {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if desc.usage.contains(TextureUsage::SHADER_RESOURCE) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        let gpu_format = self.gpu_format(desc.format);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.array_layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: gpu_format,
            usage,
            view_formats: &[],
        });
        Ok(WgpuTexture {
            texture,
            label: desc.label,
            format: desc.format,
            gpu_format,
            width: desc.width,
            height: desc.height,
            layers: desc.array_layers,
        })
    }

    fn create_render_view(&mut self, texture: &WgpuTexture) -> Result<WgpuRenderView, DeviceError> {
        if texture.format.is_depth() {
            return Err(DeviceError::ViewRejected {
                label: texture.label.to_string(),
                reason: "depth formats cannot be color targets".to_string(),
            });
        }
        let view = texture.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Render Target View"),
            format: Some(texture.gpu_format),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_array_layer: 0,
            array_layer_count: Some(1),
            ..Default::default()
        });
        Ok(WgpuRenderView { view, format: texture.gpu_format, width: texture.width, height: texture.height })
    }

    fn create_depth_view(
        &mut self,
        texture: &WgpuTexture,
        desc: &DepthViewDesc,
    ) -> Result<WgpuDepthView, DeviceError> {
        let out_of_range = desc.layer_count == 0 || desc.first_layer + desc.layer_count > texture.layers;
        if !texture.format.is_depth() || out_of_range {
            return Err(DeviceError::ViewRejected {
                label: texture.label.to_string(),
                reason: "not a depth texture or layer range out of bounds".to_string(),
            });
        }
        let layer_views = (desc.first_layer..desc.first_layer + desc.layer_count)
            .map(|layer| {
                texture.texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("Depth Stencil Layer View"),
                    format: Some(texture.gpu_format),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();
        Ok(WgpuDepthView {
            layer_views,
            format: texture.gpu_format,
            read_only: desc.read_only,
            has_stencil: texture.format.has_stencil(),
            width: texture.width,
            height: texture.height,
        })
    }

    fn create_sampled_view(
        &mut self,
        texture: &WgpuTexture,
        desc: &SampledViewDesc,
    ) -> Result<WgpuSampledView, DeviceError> {
        if desc.first_layer + desc.layer_count > texture.layers {
            return Err(DeviceError::ViewRejected {
                label: texture.label.to_string(),
                reason: "layer range out of bounds".to_string(),
            });
        }
        let aspect = if texture.format.has_stencil() {
            wgpu::TextureAspect::DepthOnly
        } else {
            wgpu::TextureAspect::All
        };
        let format = (!texture.format.has_stencil()).then_some(texture.gpu_format);
        let view = texture.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Shader Resource View"),
            format,
            dimension: Some(view_dimension(desc.dimension)),
            aspect,
            base_array_layer: desc.first_layer,
            array_layer_count: Some(desc.layer_count),
            ..Default::default()
        });
        Ok(WgpuSampledView { view, dimension: desc.dimension, depth: texture.format.is_depth() })
    }

    fn clear_render_view(&mut self, view: &WgpuRenderView, color: [f32; 4]) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Clear Color") });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear Color Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: color[0] as f64,
                            g: color[1] as f64,
                            b: color[2] as f64,
                            a: color[3] as f64,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
    }

    fn clear_depth_view(&mut self, view: &WgpuDepthView, depth: f32, stencil: u32) {
        if view.read_only {
            log::warn!("[renderer] ignoring clear of a read-only depth view");
            return;
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Clear Depth") });
        for layer_view in &view.layer_views {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear Depth Pass"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: layer_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(depth),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: view.has_stencil.then_some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(stencil),
                        store: wgpu::StoreOp::Store,
                    }),
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
    }

    fn set_render_targets(&mut self, colors: &[Option<&WgpuRenderView>], depth: Option<&WgpuDepthView>) {
        self.colors = colors.iter().map(|view| view.cloned()).collect();
        self.depth = depth.cloned();
    }

    fn restore_default_targets(&mut self) {
        self.colors = vec![Some(self.default_target.clone())];
        self.depth = None;
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn set_depth_stencil_state(&mut self, desc: DepthStencilDesc, stencil_ref: u32) {
        self.depth_stencil = desc;
        self.stencil_ref = stencil_ref;
    }

    fn set_rasterizer_state(&mut self, desc: RasterizerDesc) {
        self.rasterizer = desc;
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.topology = topology;
    }

    fn set_blend_mode(&mut self, mode: BlendMode) {
        self.blend = mode;
    }

    fn bind_sampled_views(&mut self, first_stage: u32, views: &[Option<&WgpuSampledView>]) {
        for (offset, view) in views.iter().enumerate() {
            let stage = first_stage + offset as u32;
            match view {
                Some(view) => {
                    self.sampled.insert(stage, (*view).clone());
                }
                None => {
                    self.sampled.remove(&stage);
                }
            }
        }
    }

    fn write_uniform(&mut self, slot: u32, bytes: &[u8]) {
        let size = (bytes.len() as u64).max(16).next_multiple_of(16);
        let stale = self.uniforms.get(&slot).map_or(true, |buffer| buffer.size() < size);
        if stale {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Uniform Slot"),
                size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.uniforms.insert(slot, buffer);
        }
        if let Some(buffer) = self.uniforms.get(&slot) {
            self.queue.write_buffer(buffer, 0, bytes);
        }
    }

    fn draw(&mut self, program: Program, vertex_count: u32) -> Result<(), DeviceError> {
        let mut textures = Vec::with_capacity(program.sampled_stages().len());
        for &stage in program.sampled_stages() {
            let view = self.sampled_at(program, stage)?;
            textures.push((stage, view.dimension, view.depth));
        }
        let layout_key = LayoutKey { program, textures };

        let colors: Vec<Option<WgpuRenderView>> =
            if self.colors.iter().all(Option::is_none) { Vec::new() } else { self.colors.clone() };
        let depth = self.depth.clone();
        let key = PipelineKey {
            layout: layout_key.clone(),
            color_formats: colors.iter().map(|view| view.as_ref().map(|view| view.format)).collect(),
            depth_format: depth.as_ref().map(|view| (view.format, view.has_stencil)),
            depth_stencil: self.depth_stencil,
            rasterizer: RasterizerKey::from(self.rasterizer),
            topology: self.topology,
            blend: self.blend,
        };
        let bind_group = self.bind_group(&layout_key)?;
        let pipeline = self.pipeline(&key);

        let (target_width, target_height) = colors
            .iter()
            .flatten()
            .map(|view| (view.width, view.height))
            .next()
            .or_else(|| depth.as_ref().map(|view| (view.width, view.height)))
            .unwrap_or((1, 1));
        let vp = self.viewport;
        let vp_width = vp.width.min(target_width as f32 - vp.x).max(1.0);
        let vp_height = vp.height.min(target_height as f32 - vp.y).max(1.0);

        let layers = match &depth {
            Some(view) if colors.is_empty() => view.layer_views.len(),
            _ => 1,
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(program.label()) });
        for layer in 0..layers {
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = colors
                .iter()
                .map(|view| {
                    view.as_ref().map(|view| wgpu::RenderPassColorAttachment {
                        view: &view.view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations { load: wgpu::LoadOp::Load, store: wgpu::StoreOp::Store },
                    })
                })
                .collect();
            let depth_attachment = depth.as_ref().and_then(|view| {
                view.layer_views.get(layer).map(|layer_view| wgpu::RenderPassDepthStencilAttachment {
                    view: layer_view,
                    depth_ops: (!view.read_only).then_some(LOAD_STORE_DEPTH),
                    stencil_ops: (view.has_stencil && !view.read_only).then_some(LOAD_STORE_STENCIL),
                })
            });
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(program.label()),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            let layer_offset = [(layer as u64 * LAYER_UNIFORM_STRIDE) as u32];
            let offsets: &[u32] = if program.is_layered() { &layer_offset } else { &[] };
            pass.set_bind_group(0, &bind_group, offsets);
            pass.set_viewport(vp.x, vp.y, vp_width, vp_height, vp.min_depth, vp.max_depth);
            pass.set_stencil_reference(self.stencil_ref);
            pass.draw(0..vertex_count, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        self.draw_calls += 1;
        Ok(())
    }
}

fn shader_source(program: Program) -> &'static str {
    match program {
        Program::GBufferVisualize => include_str!("../../assets/shaders/gbuffer_visualize.wgsl"),
        Program::DepthArrayVisualize => include_str!("../../assets/shaders/depth_array_visualize.wgsl"),
        Program::DirectionalLight => include_str!("../../assets/shaders/directional_light.wgsl"),
        Program::PointLight => include_str!("../../assets/shaders/point_light.wgsl"),
        Program::SceneDepth => include_str!("../../assets/shaders/scene_depth.wgsl"),
        Program::SceneGBuffer => include_str!("../../assets/shaders/scene_gbuffer.wgsl"),
    }
}

fn has_fragment_stage(program: Program) -> bool {
    !matches!(program, Program::SceneDepth)
}

fn uses_shadow_sampler(program: Program) -> bool {
    matches!(program, Program::DirectionalLight)
}

fn depth_stencil_state(
    format: wgpu::TextureFormat,
    has_stencil: bool,
    desc: &DepthStencilDesc,
    rasterizer: &RasterizerDesc,
) -> wgpu::DepthStencilState {
    let stencil = match desc.stencil {
        Some(stencil) if has_stencil => {
            let face = wgpu::StencilFaceState {
                compare: compare_function(stencil.compare),
                fail_op: stencil_operation(stencil.fail_op),
                depth_fail_op: stencil_operation(stencil.depth_fail_op),
                pass_op: stencil_operation(stencil.pass_op),
            };
            wgpu::StencilState {
                front: face,
                back: face,
                read_mask: stencil.read_mask,
                write_mask: stencil.write_mask,
            }
        }
        _ => wgpu::StencilState::default(),
    };
    wgpu::DepthStencilState {
        format,
        depth_write_enabled: desc.depth_write,
        depth_compare: desc.depth_compare.map(compare_function).unwrap_or(wgpu::CompareFunction::Always),
        stencil,
        bias: wgpu::DepthBiasState {
            constant: rasterizer.depth_bias,
            slope_scale: rasterizer.slope_scaled_depth_bias,
            clamp: 0.0,
        },
    }
}

fn compare_function(compare: CompareFunction) -> wgpu::CompareFunction {
    match compare {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn stencil_operation(op: StencilOp) -> wgpu::StencilOperation {
    match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
    }
}

fn cull_face(cull: CullMode) -> Option<wgpu::Face> {
    match cull {
        CullMode::None => None,
        CullMode::Front => Some(wgpu::Face::Front),
        CullMode::Back => Some(wgpu::Face::Back),
    }
}

fn primitive_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
    match topology {
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

fn blend_state(mode: BlendMode) -> Option<wgpu::BlendState> {
    match mode {
        BlendMode::Replace => None,
        BlendMode::Additive => {
            let add = wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            };
            Some(wgpu::BlendState { color: add, alpha: add })
        }
    }
}

fn view_dimension(dimension: ViewDimension) -> wgpu::TextureViewDimension {
    match dimension {
        ViewDimension::D2 => wgpu::TextureViewDimension::D2,
        ViewDimension::D2Array => wgpu::TextureViewDimension::D2Array,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::shadow_pass::SHADOW_GEN_RASTERIZER;

    #[test]
    fn rasterizer_key_distinguishes_bias() {
        let plain = RasterizerKey::from(RasterizerDesc::default());
        let biased = RasterizerKey::from(SHADOW_GEN_RASTERIZER);
        assert_ne!(plain, biased);
        assert_eq!(biased, RasterizerKey::from(SHADOW_GEN_RASTERIZER));
    }

    #[test]
    fn stencil_is_dropped_for_depth_only_formats() {
        let desc = crate::renderer::gbuffer::GEOMETRY_DEPTH_STENCIL;
        let state =
            depth_stencil_state(wgpu::TextureFormat::Depth32Float, false, &desc, &RasterizerDesc::default());
        assert_eq!(state.stencil, wgpu::StencilState::default());
        let format = wgpu::TextureFormat::Depth24PlusStencil8;
        let with_stencil = depth_stencil_state(format, true, &desc, &RasterizerDesc::default());
        assert_eq!(with_stencil.stencil.front.pass_op, wgpu::StencilOperation::Replace);
    }

    #[test]
    fn headless_device_renders_when_adapter_available() {
        let Ok(mut device) = pollster::block_on(WgpuDevice::new_headless(64, 64)) else {
            eprintln!("[test] no adapter available; skipping");
            return;
        };
        let texture = device
            .create_texture(&TextureDesc::new_2d(
                "target",
                64,
                64,
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_TARGET | TextureUsage::SHADER_RESOURCE,
            ))
            .expect("texture");
        let view = device.create_render_view(&texture).expect("render view");
        device.clear_render_view(&view, [0.0, 0.0, 0.0, 1.0]);
        device.wait_idle().expect("idle");
    }
}
