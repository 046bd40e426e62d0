//! wgpu backend: every grid is a render-target texture, every program a
//! render pipeline drawing one full-screen triangle.
//!
//! Draws are recorded into one command encoder per frame and submitted in
//! `finish_frame`, together with presenting the surface texture when the
//! display pass touched it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use wgpu::util::DeviceExt;
use winit::window::Window;

use super::{missing_texture, ProgramHandle, RenderBackend, SurfaceStatus};
use crate::asset::SourceImage;
use crate::error::{EngineError, Result};
use crate::grid::{FilterMode, GridDescriptor, TextureFormat, TextureId};
use crate::program::{Pass, PassUniforms, ProgramKind, Target};

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    filter: FilterMode,
    width: u32,
    height: u32,
}

struct GpuProgram {
    kind: ProgramKind,
    module: wgpu::ShaderModule,
    /// One pipeline per colour target format the program has drawn into.
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    half_float: bool,
    device_lost: Arc<AtomicBool>,
    surface_lost: bool,

    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    // Bound to sampler slots a program leaves empty.
    placeholder: wgpu::TextureView,

    textures: HashMap<u64, GpuTexture>,
    next_texture: u64,
    programs: HashMap<u32, GpuProgram>,
    next_program: u32,

    encoder: Option<wgpu::CommandEncoder>,
    frame: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
}

impl GpuBackend {
    pub async fn new(window: Arc<Window>) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|err| EngineError::ContextUnavailable(err.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                ..Default::default()
            })
            .await
            .ok_or_else(|| EngineError::ContextUnavailable("no compatible GPU adapter".to_string()))?;
        let info = adapter.get_info();
        log::info!("using {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fluid Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|err| EngineError::ContextUnavailable(err.to_string()))?;

        let device_lost = Arc::new(AtomicBool::new(false));
        let lost = Arc::clone(&device_lost);
        device.set_device_lost_callback(move |reason, message| {
            log::error!("GPU device lost ({reason:?}): {message}");
            lost.store(true, Ordering::SeqCst);
        });
        // Errors outside an explicit scope would otherwise abort the process.
        device.on_uncaptured_error(Box::new(|err: wgpu::Error| {
            log::error!("uncaptured GPU error: {err}");
        }));

        let half = adapter.get_texture_format_features(wgpu::TextureFormat::Rgba16Float);
        let half_float = half.allowed_usages.contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
            && half.flags.contains(wgpu::TextureFormatFeatureFlags::FILTERABLE);

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| EngineError::ContextUnavailable("surface reports no formats".to_string()))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            // Simulation speed follows the display refresh rate.
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let sampler_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Fluid Pass Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(1),
                sampler_entry(2),
                texture_entry(3),
                sampler_entry(4),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Fluid Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let sampler = |label: &'static str, filter: wgpu::FilterMode| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: filter,
                min_filter: filter,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        };
        let linear_sampler = sampler("Linear Clamp", wgpu::FilterMode::Linear);
        let nearest_sampler = sampler("Nearest Clamp", wgpu::FilterMode::Nearest);

        let placeholder = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("Unbound Slot"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
            half_float,
            device_lost,
            surface_lost: false,
            bind_group_layout,
            pipeline_layout,
            linear_sampler,
            nearest_sampler,
            placeholder,
            textures: HashMap::new(),
            next_texture: 1,
            programs: HashMap::new(),
            next_program: 1,
            encoder: None,
            frame: None,
        })
    }

    fn is_lost(&self) -> bool {
        self.surface_lost || self.device_lost.load(Ordering::SeqCst)
    }

    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        match self.encoder.take() {
            Some(encoder) => encoder,
            None => self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Fluid Frame"),
            }),
        }
    }

    /// Colour format a program's pipeline is built for up front.
    fn target_format(&self, kind: ProgramKind) -> wgpu::TextureFormat {
        match kind {
            ProgramKind::Display => self.surface_config.format,
            _ => grid_format(TextureFormat::select(self.half_float)),
        }
    }

    fn sampler(&self, filter: FilterMode) -> &wgpu::Sampler {
        match filter {
            FilterMode::Linear => &self.linear_sampler,
            FilterMode::Nearest => &self.nearest_sampler,
        }
    }

    fn binding(&self, input: Option<TextureId>) -> Result<(&wgpu::TextureView, &wgpu::Sampler)> {
        match input {
            Some(id) => {
                let texture = self.textures.get(&id.0).ok_or_else(|| missing_texture(id))?;
                Ok((&texture.view, self.sampler(texture.filter)))
            }
            None => Ok((&self.placeholder, &self.nearest_sampler)),
        }
    }

    /// Records one pass into `encoder`. The pipeline for `format` must exist.
    fn record(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pass: &Pass,
        format: wgpu::TextureFormat,
        uniforms: &wgpu::Buffer,
    ) -> Result<()> {
        let (view0, sampler0) = self.binding(pass.inputs[0])?;
        let (view1, sampler1) = self.binding(pass.inputs[1])?;
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(pass.kind.label()),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(view0),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(sampler0),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(view1),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(sampler1),
                },
            ],
        });

        let (target, load) = match pass.target {
            Target::Grid(id) => (
                &self.textures.get(&id.0).ok_or_else(|| missing_texture(id))?.view,
                wgpu::LoadOp::Load,
            ),
            Target::Screen => match &self.frame {
                Some((_, view)) => (view, wgpu::LoadOp::Clear(wgpu::Color::BLACK)),
                None => return Err(EngineError::SurfaceLost),
            },
        };
        let pipeline = self
            .programs
            .get(&pass.program.0)
            .and_then(|program| program.pipelines.get(&format))
            .ok_or(EngineError::InvalidState {
                operation: "draw",
                state: "pipeline missing",
            })?;

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(pass.kind.label()),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_pipeline(pipeline);
        render_pass.set_bind_group(0, &bind_group, &[]);
        render_pass.draw(0..3, 0..1); // Full-screen triangle
        Ok(())
    }

    fn acquire_frame(&mut self) -> Result<()> {
        if self.frame.is_some() {
            return Ok(());
        }
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Timeout) => {
                self.surface.configure(&self.device, &self.surface_config);
                self.surface.get_current_texture().map_err(|err| {
                    log::warn!("surface unusable after reconfigure: {err}");
                    self.surface_lost = true;
                    EngineError::SurfaceLost
                })?
            }
            Err(wgpu::SurfaceError::Lost) => {
                self.surface_lost = true;
                return Err(EngineError::SurfaceLost);
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                return Err(EngineError::ContextUnavailable("surface out of memory".to_string()))
            }
        };
        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.frame = Some((frame, view));
        Ok(())
    }

    fn draw_into(&mut self, pass: &Pass, format: wgpu::TextureFormat, clip_flip: f32) -> Result<()> {
        let program = self.programs.get_mut(&pass.program.0).ok_or(EngineError::InvalidState {
            operation: "draw",
            state: "program released",
        })?;
        if !program.pipelines.contains_key(&format) {
            let pipeline = create_pipeline(&self.device, &self.pipeline_layout, program.kind, &program.module, format)?;
            program.pipelines.insert(format, pipeline);
        }

        let uniforms = PassUniforms {
            clip_flip,
            ..pass.uniforms
        };
        let uniform_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Pass Uniforms"),
            contents: bytemuck::bytes_of(&uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut encoder = self.take_encoder();
        self.record(&mut encoder, pass, format, &uniform_buffer)?;
        self.encoder = Some(encoder);
        Ok(())
    }

    /// Drops pending commands and the acquired surface texture.
    fn abandon_frame(&mut self) {
        self.encoder = None;
        self.frame = None;
    }

    fn insert(&mut self, texture: GpuTexture) -> TextureId {
        let id = self.next_texture;
        self.next_texture += 1;
        self.textures.insert(id, texture);
        TextureId(id)
    }
}

impl RenderBackend for GpuBackend {
    fn supports_half_float(&self) -> bool {
        self.half_float
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    fn surface_status(&self) -> SurfaceStatus {
        if self.is_lost() {
            SurfaceStatus::Lost
        } else {
            SurfaceStatus::Ready
        }
    }

    fn configure_surface(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(EngineError::Config(format!("surface size {width}x{height}")));
        }
        self.frame = None;
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.device, &self.surface_config);
        self.surface_lost = false;
        Ok(())
    }

    fn allocate(&mut self, desc: &GridDescriptor) -> Result<TextureId> {
        let refuse = |reason: String| EngineError::Allocation {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            reason,
        };
        if self.is_lost() {
            return Err(refuse("device lost".to_string()));
        }
        let max = self.device.limits().max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(refuse(format!("size must be within 1..={max}")));
        }
        if desc.format == TextureFormat::Rgba16Float && !self.half_float {
            return Err(refuse("half-float targets unsupported".to_string()));
        }

        let format = grid_format(desc.format);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = validation.or(out_of_memory) {
            return Err(refuse(err.to_string()));
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self.take_encoder();
        {
            let _clear = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear Grid"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.encoder = Some(encoder);

        Ok(self.insert(GpuTexture {
            texture,
            view,
            format,
            filter: desc.filter,
            width: desc.width,
            height: desc.height,
        }))
    }

    fn release(&mut self, id: TextureId) {
        self.textures.remove(&id.0);
    }

    fn live_textures(&self) -> usize {
        self.textures.len()
    }

    fn upload_image(&mut self, image: &SourceImage) -> Result<TextureId> {
        let max = self.device.limits().max_texture_dimension_2d;
        if image.width() > max || image.height() > max {
            return Err(EngineError::Allocation {
                width: image.width(),
                height: image.height(),
                format: TextureFormat::Rgba8Unorm,
                reason: format!("source image exceeds {max} texels"),
            });
        }
        let format = if self.surface_config.format.is_srgb() {
            wgpu::TextureFormat::Rgba8UnormSrgb
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        };
        let texture = self.device.create_texture_with_data(
            &self.queue,
            &wgpu::TextureDescriptor {
                label: Some("Source Image"),
                size: wgpu::Extent3d {
                    width: image.width(),
                    height: image.height(),
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            image.pixels(),
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(self.insert(GpuTexture {
            texture,
            view,
            format,
            filter: FilterMode::Linear,
            width: image.width(),
            height: image.height(),
        }))
    }

    fn compile(&mut self, kind: ProgramKind, vertex: &str, fragment: &str) -> Result<ProgramHandle> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kind.label()),
            source: wgpu::ShaderSource::Wgsl(format!("{vertex}\n{fragment}").into()),
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(EngineError::ShaderCompile {
                program: kind,
                diagnostic: err.to_string(),
            });
        }

        let format = self.target_format(kind);
        let pipeline = create_pipeline(&self.device, &self.pipeline_layout, kind, &module, format)?;
        let mut pipelines = HashMap::new();
        pipelines.insert(format, pipeline);

        let handle = self.next_program;
        self.next_program += 1;
        self.programs.insert(handle, GpuProgram { kind, module, pipelines });
        Ok(ProgramHandle(handle))
    }

    fn release_program(&mut self, handle: ProgramHandle) {
        self.programs.remove(&handle.0);
    }

    fn draw(&mut self, pass: &Pass) -> Result<()> {
        if self.is_lost() {
            return Err(EngineError::SurfaceLost);
        }
        if pass.reads_own_target() {
            return Err(EngineError::InvalidState {
                operation: "draw",
                state: "reading its own target",
            });
        }
        let (format, clip_flip) = match pass.target {
            Target::Grid(id) => (self.textures.get(&id.0).ok_or_else(|| missing_texture(id))?.format, -1.0),
            Target::Screen => {
                self.acquire_frame()?;
                (self.surface_config.format, 1.0)
            }
        };
        let drawn = self.draw_into(pass, format, clip_flip);
        if drawn.is_err() {
            // A half-recorded frame must not be presented or reused.
            self.abandon_frame();
        }
        drawn
    }

    fn finish_frame(&mut self) -> Result<()> {
        if self.is_lost() {
            self.abandon_frame();
            return Err(EngineError::SurfaceLost);
        }
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        if let Some((frame, _view)) = self.frame.take() {
            frame.present();
        }
        Ok(())
    }

    fn read_texels(&mut self, id: TextureId) -> Result<Vec<[f32; 4]>> {
        // Whatever is pending has to land before the copy reads the texture.
        if let Some(pending) = self.encoder.take() {
            self.queue.submit(std::iter::once(pending.finish()));
        }
        let texture = self.textures.get(&id.0).ok_or_else(|| missing_texture(id))?;
        let texel_bytes = match texture.format {
            wgpu::TextureFormat::Rgba16Float => 8,
            _ => 4,
        };
        let unpadded = texture.width * texel_bytes;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback"),
            size: padded as u64 * texture.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback"),
        });
        let extent = wgpu::Extent3d {
            width: texture.width,
            height: texture.height,
            depth_or_array_layers: 1,
        };
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(texture.height),
                },
            },
            extent,
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match pollster::block_on(receiver.receive()) {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                log::warn!("texture readback failed: {err}");
                return Err(EngineError::SurfaceLost);
            }
            None => return Err(EngineError::SurfaceLost),
        }

        let data = buffer_slice.get_mapped_range();
        let mut texels = Vec::with_capacity((texture.width * texture.height) as usize);
        for row in data.chunks_exact(padded as usize) {
            let row = &row[..unpadded as usize];
            if texel_bytes == 8 {
                texels.extend(row.chunks_exact(8).map(|t| {
                    let half = |i: usize| f16_to_f32(u16::from_le_bytes([t[i], t[i + 1]]));
                    [half(0), half(2), half(4), half(6)]
                }));
            } else {
                texels.extend(row.chunks_exact(4).map(|t| {
                    [
                        t[0] as f32 / 255.0,
                        t[1] as f32 / 255.0,
                        t[2] as f32 / 255.0,
                        t[3] as f32 / 255.0,
                    ]
                }));
            }
        }
        drop(data);
        staging.unmap();
        Ok(texels)
    }
}

fn grid_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    kind: ProgramKind,
    module: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
) -> Result<wgpu::RenderPipeline> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(kind.label()),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: "vs_main",
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: "fs_main",
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
        cache: None,
    });
    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => Err(EngineError::ProgramLink {
            program: kind,
            diagnostic: err.to_string(),
        }),
        None => Ok(pipeline),
    }
}

/// IEEE half to single precision.
fn f16_to_f32(bits: u16) -> f32 {
    let exp = ((bits >> 10) & 0x1f) as u32;
    let frac = (bits & 0x03ff) as u32;
    let magnitude = match exp {
        0 => frac as f32 / 16_777_216.0,
        0x1f if frac == 0 => f32::INFINITY,
        0x1f => f32::NAN,
        _ => f32::from_bits(((exp + 127 - 15) << 23) | (frac << 13)),
    };
    if bits & 0x8000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_floats_decode() {
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert_eq!(f16_to_f32(0x3c00), 1.0);
        assert_eq!(f16_to_f32(0xc000), -2.0);
        assert_eq!(f16_to_f32(0x3800), 0.5);
        assert_eq!(f16_to_f32(0x7bff), 65504.0);
        // Smallest subnormal.
        assert_eq!(f16_to_f32(0x0001), 2f32.powi(-24));
        assert!(f16_to_f32(0x7c00).is_infinite());
        assert!(f16_to_f32(0x7e00).is_nan());
    }

    #[test]
    fn grid_formats_map_one_to_one() {
        assert_eq!(grid_format(TextureFormat::Rgba16Float), wgpu::TextureFormat::Rgba16Float);
        assert_eq!(grid_format(TextureFormat::Rgba8Unorm), wgpu::TextureFormat::Rgba8Unorm);
    }
}
