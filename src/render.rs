//! GPU side of the point viewer.
//!
//! All wgpu calls in this module run on the eframe thread that owns the
//! render state. Load workers only ever hand over a finished
//! [`PointCloud`]; they never see a device or queue.

use crate::{
    color::{self, ColormapKind, COLORMAP_SIZE},
    error::ShaderError,
    points::{Point, PointCloud},
    view::ViewState,
};
use bytemuck::{Pod, Zeroable};
use eframe::egui;
use egui_wgpu::wgpu;
use egui_wgpu::wgpu::util::DeviceExt;
use egui_wgpu::CallbackTrait;

const SHADER_SRC: &str = include_str!("../assets/pointcloud.wgsl");

/// Largest `write_buffer` call for point data: about 16 MiB of whole points.
const UPLOAD_CHUNK: usize = 16 * 1024 * 1024 / std::mem::size_of::<Point>() * std::mem::size_of::<Point>();

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Uniforms {
    /// Column-major view transform.
    pub transform: [f32; 16],
    pub viewport_px: [f32; 2],
    pub point_size: f32,
    pub vmin: f32,
    pub vmax: f32,
    pub _pad: [f32; 3],
}

impl Uniforms {
    pub fn from_view(view: &ViewState, viewport_px: [f32; 2], pixels_per_point: f32) -> Self {
        Self {
            transform: view.transform(),
            viewport_px,
            point_size: view.point_size * pixels_per_point,
            vmin: view.value_range.0,
            vmax: view.value_range.1,
            _pad: [0.0; 3],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CornerVert {
    corner: [f32; 2],
}

const POINT_ATTRIBUTES: [wgpu::VertexAttribute; 2] = [
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Float32x2,
        offset: 0,
        shader_location: 0,
    },
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Float32,
        offset: 8,
        shader_location: 1,
    },
];

const CORNER_ATTRIBUTES: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
    format: wgpu::VertexFormat::Float32x2,
    offset: 0,
    shader_location: 2,
}];

/// Pipeline, buffers and colormap texture. Lives in egui's callback
/// resources while the engine is ready.
pub struct PointCloudGpu {
    pipeline: wgpu::RenderPipeline,
    bind_group: wgpu::BindGroup,
    uniform_buf: wgpu::Buffer,
    points: wgpu::Buffer,
    corners: wgpu::Buffer,
    colormap: wgpu::Texture,
    n_points: u32,
}

impl PointCloudGpu {
    fn create_pipeline(
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        shader_src: &str,
    ) -> Result<(wgpu::RenderPipeline, wgpu::BindGroupLayout), ShaderError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("pointcloud.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(ShaderError::Compile(err.to_string()));
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pc_bgl"),
            entries: &[
                // uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<Uniforms>() as u64),
                    },
                    count: None,
                },
                // colormap
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D1,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("pc_pl"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("pc_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[
                    wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<Point>() as u64,
                        step_mode: wgpu::VertexStepMode::Instance,
                        attributes: &POINT_ATTRIBUTES,
                    },
                    wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<CornerVert>() as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &CORNER_ATTRIBUTES,
                    },
                ],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(ShaderError::Link(err.to_string()));
        }

        Ok((pipeline, bgl))
    }

    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        format: wgpu::TextureFormat,
        colormap_kind: ColormapKind,
    ) -> Result<Self, ShaderError> {
        let (pipeline, bgl) = Self::create_pipeline(device, format, SHADER_SRC)?;

        let uniform_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pc_uniform"),
            size: std::mem::size_of::<Uniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // Start tiny, grow on demand
        let points = Self::create_point_buffer(device, 12);

        let corners_data = [
            CornerVert { corner: [-1.0, -1.0] },
            CornerVert { corner: [1.0, -1.0] },
            CornerVert { corner: [1.0, 1.0] },
            CornerVert { corner: [-1.0, -1.0] },
            CornerVert { corner: [1.0, 1.0] },
            CornerVert { corner: [-1.0, 1.0] },
        ];
        let corners = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("pc_corners"),
            contents: bytemuck::cast_slice(&corners_data),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let colormap = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("pc_colormap"),
            size: wgpu::Extent3d {
                width: COLORMAP_SIZE as u32,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D1,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let colormap_view = colormap.create_view(&wgpu::TextureViewDescriptor {
            label: Some("pc_colormap_view"),
            dimension: Some(wgpu::TextureViewDimension::D1),
            ..Default::default()
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pc_bg"),
            layout: &bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: uniform_buf.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&colormap_view),
                },
            ],
        });

        let gpu = Self {
            pipeline,
            bind_group,
            uniform_buf,
            points,
            corners,
            colormap,
            n_points: 0,
        };
        gpu.upload_colormap(queue, colormap_kind);
        Ok(gpu)
    }

    fn create_point_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pc_points"),
            size: size.max(12),
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn write_chunked(queue: &wgpu::Queue, buf: &wgpu::Buffer, data: &[u8]) {
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + UPLOAD_CHUNK).min(data.len());
            queue.write_buffer(buf, offset as u64, &data[offset..end]);
            offset = end;
        }
    }

    /// Replaces the whole point buffer with `cloud`.
    pub fn upload_points(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, cloud: &PointCloud) {
        let bytes = cloud.as_bytes();
        if self.points.size() < bytes.len() as u64 {
            self.points.destroy();
            self.points = Self::create_point_buffer(device, bytes.len() as u64);
        }
        Self::write_chunked(queue, &self.points, bytes);
        self.n_points = cloud.len() as u32;
    }

    pub fn upload_colormap(&self, queue: &wgpu::Queue, kind: ColormapKind) {
        let texels = color::colormap(kind, COLORMAP_SIZE);
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.colormap,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some((COLORMAP_SIZE * std::mem::size_of::<[f32; 4]>()) as u32),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: COLORMAP_SIZE as u32,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
    }

    pub fn paint<'rp>(&self, render_pass: &mut wgpu::RenderPass<'rp>) {
        if self.n_points == 0 {
            return;
        }
        let used = self.n_points as u64 * std::mem::size_of::<Point>() as u64;
        render_pass.set_pipeline(&self.pipeline);
        render_pass.set_bind_group(0, &self.bind_group, &[]);
        render_pass.set_vertex_buffer(0, self.points.slice(..used));
        render_pass.set_vertex_buffer(1, self.corners.slice(..));
        render_pass.draw(0..6, 0..self.n_points);
    }

    /// Frees GPU memory now instead of whenever the last handle drops.
    pub fn destroy(self) {
        self.points.destroy();
        self.uniform_buf.destroy();
        self.corners.destroy();
        self.colormap.destroy();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    /// A wgpu render state is attached, nothing allocated yet.
    Initialized,
    Ready,
    /// Pipeline creation failed; the engine never draws again.
    Failed,
    ShutDown,
}

/// Owns the view state and the lifecycle of [`PointCloudGpu`].
pub struct RenderEngine {
    state: EngineState,
    render_state: Option<egui_wgpu::RenderState>,
    ctx: Option<egui::Context>,
    view: ViewState,
    colormap: ColormapKind,
    /// Cloud waiting for the engine to become ready.
    pending: Option<PointCloud>,
    point_count: usize,
    pub background: egui::Color32,
}

impl Default for RenderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderEngine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Uninitialized,
            render_state: None,
            ctx: None,
            view: ViewState::default(),
            colormap: ColormapKind::default(),
            pending: None,
            point_count: 0,
            background: egui::Color32::BLACK,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    pub fn colormap(&self) -> ColormapKind {
        self.colormap
    }

    /// Hooks the engine to eframe's wgpu state.
    pub fn attach(&mut self, render_state: egui_wgpu::RenderState, ctx: egui::Context) {
        if self.state == EngineState::Uninitialized {
            self.render_state = Some(render_state);
            self.ctx = Some(ctx);
            self.state = EngineState::Initialized;
        }
    }

    /// Builds the pipeline and GPU resources and uploads any pending cloud.
    pub fn initialize(&mut self) -> Result<(), ShaderError> {
        if self.state != EngineState::Initialized {
            return Err(ShaderError::InvalidState(self.state));
        }
        let Some(rs) = self.render_state.clone() else {
            return Err(ShaderError::InvalidState(self.state));
        };

        let mut gpu = match PointCloudGpu::new(&rs.device, &rs.queue, rs.target_format, self.colormap) {
            Ok(gpu) => gpu,
            Err(err) => {
                log::error!("{err}");
                self.state = EngineState::Failed;
                return Err(err);
            }
        };
        if let Some(cloud) = self.pending.take() {
            gpu.upload_points(&rs.device, &rs.queue, &cloud);
        }
        rs.renderer.write().callback_resources.insert(gpu);
        self.state = EngineState::Ready;
        log::info!("render engine ready ({:?})", rs.target_format);
        self.request_repaint();
        Ok(())
    }

    fn with_gpu<R>(&self, f: impl FnOnce(&mut PointCloudGpu, &wgpu::Device, &wgpu::Queue) -> R) -> Option<R> {
        if self.state != EngineState::Ready {
            return None;
        }
        let rs = self.render_state.as_ref()?;
        let mut renderer = rs.renderer.write();
        let gpu = renderer.callback_resources.get_mut::<PointCloudGpu>()?;
        Some(f(gpu, &rs.device, &rs.queue))
    }

    fn request_repaint(&self) {
        if let Some(ctx) = &self.ctx {
            ctx.request_repaint();
        }
    }

    /// Replaces the displayed points. Before the engine is ready the cloud
    /// is kept and uploaded by [`RenderEngine::initialize`].
    pub fn set_points(&mut self, cloud: PointCloud) {
        self.point_count = cloud.len();
        if self.state == EngineState::Ready {
            self.with_gpu(|gpu, device, queue| gpu.upload_points(device, queue, &cloud));
        } else {
            self.pending = Some(cloud);
        }
        self.request_repaint();
    }

    pub fn set_point_size(&mut self, px: f32) {
        if px.is_finite() && px > 0.0 {
            self.view.point_size = px;
            self.request_repaint();
        }
    }

    pub fn set_value_range(&mut self, min: f32, max: f32) {
        self.view.value_range = (min, max);
        self.request_repaint();
    }

    pub fn set_colormap(&mut self, kind: ColormapKind) {
        if self.colormap == kind {
            return;
        }
        self.colormap = kind;
        self.with_gpu(|gpu, _, queue| gpu.upload_colormap(queue, kind));
        self.request_repaint();
    }

    pub fn reset_view(&mut self) {
        self.view.reset();
        self.request_repaint();
    }

    /// Uniforms for this frame, or `None` when there is nothing to draw.
    pub fn frame_uniforms(&self, viewport_px: [f32; 2], pixels_per_point: f32) -> Option<Uniforms> {
        if self.state != EngineState::Ready || self.point_count == 0 {
            return None;
        }
        Some(Uniforms::from_view(&self.view, viewport_px, pixels_per_point))
    }

    /// Applies drag-to-pan and wheel zoom for the viewport `response`.
    pub fn handle_input(&mut self, ctx: &egui::Context, response: &egui::Response) {
        let rect = response.rect;
        let viewport = [rect.width(), rect.height()];
        let local = |p: egui::Pos2| [p.x - rect.min.x, p.y - rect.min.y];

        if response.drag_started_by(egui::PointerButton::Primary) {
            if let Some(pos) = response.interact_pointer_pos() {
                self.view.begin_drag(local(pos));
            }
        }
        if self.view.is_dragging() && response.dragged() {
            if let Some(pos) = response.interact_pointer_pos() {
                self.view.drag_to(local(pos), viewport);
                self.request_repaint();
            }
        }
        if response.drag_stopped() {
            self.view.end_drag();
        }

        if response.hovered() {
            let scroll = ctx.input(|i| i.raw_scroll_delta.y);
            if scroll != 0.0 {
                let mouse = ctx.input(|i| i.pointer.hover_pos()).unwrap_or(rect.center());
                self.view.wheel(local(mouse), viewport, scroll);
                self.request_repaint();
            }
        }
    }

    /// Clears `rect` and queues the point draw for it.
    pub fn render(&self, ui: &mut egui::Ui, rect: egui::Rect) {
        ui.painter().rect_filled(rect, 0.0, self.background);
        let ppp = ui.ctx().pixels_per_point();
        let viewport_px = [rect.width() * ppp, rect.height() * ppp];
        let Some(uniforms) = self.frame_uniforms(viewport_px, ppp) else {
            return;
        };
        let cb = PointCloudCallback { uniforms };
        ui.painter().add(egui_wgpu::Callback::new_paint_callback(rect, cb));
    }

    /// Releases every GPU resource. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(rs) = self.render_state.take() {
            if let Some(gpu) = rs.renderer.write().callback_resources.remove::<PointCloudGpu>() {
                gpu.destroy();
                log::info!("render engine resources released");
            }
        }
        self.pending = None;
        self.point_count = 0;
        self.state = EngineState::ShutDown;
    }
}

struct PointCloudCallback {
    uniforms: Uniforms,
}

impl CallbackTrait for PointCloudCallback {
    fn prepare(
        &self,
        _device: &wgpu::Device,
        queue: &wgpu::Queue,
        _screen_descriptor: &egui_wgpu::ScreenDescriptor,
        _egui_encoder: &mut wgpu::CommandEncoder,
        callback_resources: &mut egui_wgpu::CallbackResources,
    ) -> Vec<wgpu::CommandBuffer> {
        if let Some(gpu) = callback_resources.get::<PointCloudGpu>() {
            queue.write_buffer(&gpu.uniform_buf, 0, bytemuck::bytes_of(&self.uniforms));
        }
        Vec::new()
    }

    fn paint(
        &self,
        _info: egui::PaintCallbackInfo,
        render_pass: &mut wgpu::RenderPass<'static>,
        callback_resources: &egui_wgpu::CallbackResources,
    ) {
        let Some(gpu) = callback_resources.get::<PointCloudGpu>() else {
            return;
        };
        gpu.paint(render_pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_matches_wgsl_layout() {
        // mat4 (64) + vec2 (8) + 3 floats (12), rounded up to 16.
        assert_eq!(std::mem::size_of::<Uniforms>(), 96);
    }

    #[test]
    fn vertex_layout_matches_point() {
        assert_eq!(std::mem::size_of::<Point>() as u64, 12);
        assert_eq!(POINT_ATTRIBUTES[0].offset, 0);
        assert_eq!(POINT_ATTRIBUTES[1].offset, 8);
        assert_eq!(POINT_ATTRIBUTES[1].shader_location, 1);
    }

    #[test]
    fn upload_chunks_split_on_point_boundaries() {
        assert_eq!(UPLOAD_CHUNK % std::mem::size_of::<Point>(), 0);
        // write_buffer sizes must be multiples of COPY_BUFFER_ALIGNMENT.
        assert_eq!(UPLOAD_CHUNK as u64 % wgpu::COPY_BUFFER_ALIGNMENT, 0);
    }

    #[test]
    fn uniforms_follow_view() {
        let mut view = ViewState::default();
        view.zoom_at_ndc([0.0, 0.0], 2.0);
        view.point_size = 3.0;
        view.value_range = (1000.0, 4000.0);
        let u = Uniforms::from_view(&view, [640.0, 480.0], 2.0);
        assert_eq!(u.transform[0], 2.0);
        assert_eq!(u.point_size, 6.0);
        assert_eq!((u.vmin, u.vmax), (1000.0, 4000.0));
    }

    #[test]
    fn points_wait_until_ready() {
        let mut engine = RenderEngine::new();
        assert_eq!(engine.state(), EngineState::Uninitialized);

        engine.set_points(PointCloud::demo_cross());
        assert_eq!(engine.point_count(), 100);
        assert!(engine.pending.is_some());
        assert_eq!(engine.frame_uniforms([100.0, 100.0], 1.0), None);
    }

    #[test]
    fn initialize_requires_a_render_state() {
        let mut engine = RenderEngine::new();
        let err = engine.initialize().unwrap_err();
        assert!(matches!(err, ShaderError::InvalidState(EngineState::Uninitialized)));
    }

    #[test]
    fn setters_validate_and_shutdown_is_idempotent() {
        let mut engine = RenderEngine::new();
        engine.set_point_size(4.0);
        engine.set_point_size(0.0);
        engine.set_point_size(f32::NAN);
        assert_eq!(engine.view().point_size, 4.0);

        engine.set_value_range(10.0, 20.0);
        assert_eq!(engine.view().value_range, (10.0, 20.0));

        engine.set_colormap(ColormapKind::Turbo);
        assert_eq!(engine.colormap(), ColormapKind::Turbo);

        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.state(), EngineState::ShutDown);
        assert_eq!(engine.point_count(), 0);
    }
}
