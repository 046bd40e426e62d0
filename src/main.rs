use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use winit::{
    dpi::{LogicalPosition, LogicalSize, PhysicalPosition, PhysicalSize},
    event::*,
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
};

use fluid_image::{
    CpuBackend, Engine, FrameOutcome, GpuBackend, ImageSource, InputAggregator, PendingAsset, SessionState,
    SimulationParameters, SourceImage, SurfaceRect,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Preset {
    /// Large images: subtle distortion.
    Hero,
    /// Small images: wider, stronger splats.
    Thumbnail,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "fluid_image")]
#[command(about = "Distort an image with a real-time fluid stirred by the pointer", long_about = None)]
struct Args {
    /// Image to distort (PNG, JPEG or BMP).
    image: PathBuf,

    #[arg(long, value_enum, default_value_t = Preset::Hero)]
    preset: Preset,

    /// UV displacement per unit of dye; overrides the preset.
    #[arg(long)]
    intensity: Option<f32>,

    /// Splat Gaussian radius; overrides the preset.
    #[arg(long)]
    radius: Option<f32>,

    /// JSON parameter file; replaces the preset.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective parameters to this JSON file.
    #[arg(long)]
    save_config: Option<PathBuf>,

    #[arg(long, default_value_t = 800)]
    width: u32,

    #[arg(long, default_value_t = 800)]
    height: u32,

    /// Run this many frames without a window and write the last one to `--output`.
    #[arg(long)]
    headless_frames: Option<u32>,

    #[arg(long, default_value = "fluid_frame.png")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let params = parameters(&args)?;
    match args.headless_frames {
        Some(frames) => run_headless(&args, params, frames),
        None => run_windowed(&args, params),
    }
}

fn parameters(args: &Args) -> anyhow::Result<SimulationParameters> {
    let mut params = match &args.config {
        Some(path) => SimulationParameters::load_from_disk(path)
            .with_context(|| format!("reading parameters from {}", path.display()))?,
        None => match args.preset {
            Preset::Hero => SimulationParameters::hero(),
            Preset::Thumbnail => SimulationParameters::thumbnail(),
        },
    };
    if let Some(intensity) = args.intensity {
        params = params.with_intensity(intensity);
    }
    if let Some(radius) = args.radius {
        params = params.with_cursor_radius(radius);
    }
    params.sanitize();
    if let Some(path) = &args.save_config {
        params
            .save_to_disk(path)
            .with_context(|| format!("writing parameters to {}", path.display()))?;
        log::info!("parameters saved to {}", path.display());
    }
    Ok(params)
}

/// Runs the engine on the software backend with a scripted pointer stroke and
/// saves the final frame.
fn run_headless(args: &Args, params: SimulationParameters, frames: u32) -> anyhow::Result<()> {
    let image = SourceImage::open(&args.image)?;
    let (width, height) = (args.width.max(1), args.height.max(1));
    let mut engine = Engine::new(CpuBackend::new(width, height), params, PendingAsset::ready(image));
    engine.init()?;

    let mut input = InputAggregator::with_force(engine.splat_queue(), engine.params().splat_force);
    let rect = SurfaceRect::from_size(width as f32, height as f32);
    let started = Instant::now();
    for frame in 0..frames {
        let t = frame as f32 / frames.max(1) as f32;
        let x = rect.width * (0.2 + 0.6 * t);
        let y = rect.height * (0.5 + 0.15 * (t * std::f32::consts::TAU).sin());
        input.pointer_move(x, y, rect);
        engine.step()?;
    }
    log::info!(
        "{} frames in {:.2} s",
        engine.frame_count(),
        started.elapsed().as_secs_f32()
    );

    // The software screen stores its bottom row first.
    let screen = engine.backend().screen();
    let mut output = image::RgbaImage::new(width, height);
    for (i, texel) in screen.iter().enumerate() {
        let x = i as u32 % width;
        let y = height - 1 - i as u32 / width;
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        output.put_pixel(
            x,
            y,
            image::Rgba([channel(texel[0]), channel(texel[1]), channel(texel[2]), channel(texel[3])]),
        );
    }
    output
        .save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    log::info!("wrote {}", args.output.display());
    Ok(())
}

struct FrameStats {
    frame_count: u32,
    frame_time_sum: f32,
    last_frame: Instant,
    last_fps_update: Instant,
}

impl FrameStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frame_count: 0,
            frame_time_sum: 0.0,
            last_frame: now,
            last_fps_update: now,
        }
    }

    fn record_frame(&mut self) {
        let now = Instant::now();
        self.frame_time_sum += (now - self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frame_count += 1;
    }

    fn get_fps_and_frame_time(&mut self) -> Option<(f32, f32)> {
        let elapsed = self.last_fps_update.elapsed().as_secs_f32();
        if elapsed < 0.5 || self.frame_count == 0 {
            return None;
        }
        let fps = self.frame_count as f32 / elapsed;
        let avg_frame_time_ms = (self.frame_time_sum / self.frame_count as f32) * 1000.0;
        self.frame_count = 0;
        self.frame_time_sum = 0.0;
        self.last_fps_update = Instant::now();
        Some((fps, avg_frame_time_ms))
    }

    fn update_window_title(&mut self, window: &winit::window::Window, state: SessionState) {
        if let Some((fps, frame_time_ms)) = self.get_fps_and_frame_time() {
            window.set_title(&format!(
                "Fluid Image | {:.0} FPS | {:.2} ms/frame | {}",
                fps,
                frame_time_ms,
                state.name()
            ));
        }
    }
}

/// Pointer deltas are scaled in logical pixels, so the splat force does not
/// grow with the display's scale factor.
fn logical_point(position: PhysicalPosition<f64>, scale_factor: f64) -> [f32; 2] {
    let logical: LogicalPosition<f32> = position.to_logical(scale_factor);
    [logical.x, logical.y]
}

fn logical_rect(size: PhysicalSize<u32>, scale_factor: f64) -> SurfaceRect {
    let logical: LogicalSize<f32> = size.to_logical(scale_factor);
    SurfaceRect::from_size(logical.width, logical.height)
}

fn run_windowed(args: &Args, params: SimulationParameters) -> anyhow::Result<()> {
    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        event_loop.create_window(
            winit::window::WindowAttributes::default()
                .with_title("Fluid Image")
                .with_inner_size(PhysicalSize::new(args.width, args.height)),
        )?,
    );

    let backend = pollster::block_on(GpuBackend::new(window.clone()))?;
    let asset = PendingAsset::spawn(ImageSource::Path(args.image.clone()));
    let mut engine = Engine::new(backend, params, asset);
    if let Err(err) = engine.init() {
        // Keep the window up; the engine stays inert and has logged why.
        log::debug!("continuing without fluid: {err}");
    }

    let mut input = InputAggregator::with_force(engine.splat_queue(), engine.params().splat_force);
    let mut active_touch: Option<u64> = None;
    let mut stats = FrameStats::new();

    event_loop.run(move |event, target| match event {
        Event::WindowEvent {
            ref event,
            window_id,
        } if window_id == window.id() => {
            let size = window.inner_size();
            let scale_factor = window.scale_factor();
            let rect = logical_rect(size, scale_factor);
            match event {
                WindowEvent::CloseRequested
                | WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(KeyCode::Escape),
                            ..
                        },
                    ..
                } => {
                    engine.dispose();
                    target.exit();
                }
                WindowEvent::CursorMoved { position, .. } => {
                    let [x, y] = logical_point(*position, scale_factor);
                    input.pointer_move(x, y, rect);
                }
                WindowEvent::CursorLeft { .. } => input.pointer_leave(),
                WindowEvent::Touch(touch) => match touch.phase {
                    TouchPhase::Started | TouchPhase::Moved => {
                        if active_touch.is_none() {
                            active_touch = Some(touch.id);
                        }
                        if active_touch == Some(touch.id) {
                            input.touch_move(&[logical_point(touch.location, scale_factor)], rect);
                        }
                    }
                    TouchPhase::Ended | TouchPhase::Cancelled => {
                        if active_touch == Some(touch.id) {
                            active_touch = None;
                            input.touch_end();
                        }
                    }
                },
                WindowEvent::Resized(physical_size) => {
                    if physical_size.width > 0 && physical_size.height > 0 {
                        if let Err(err) = engine.resize(physical_size.width, physical_size.height) {
                            log::warn!("resize to {}x{} failed: {err}", physical_size.width, physical_size.height);
                        }
                    }
                }
                WindowEvent::RedrawRequested => {
                    if engine.state() == SessionState::SurfaceLost && size.width > 0 && size.height > 0 {
                        // Reconfiguring the surface is how wgpu recovers it.
                        if let Err(err) = engine.resize(size.width, size.height) {
                            log::debug!("surface still unavailable: {err}");
                        }
                    }
                    match engine.step() {
                        Ok(FrameOutcome::Rendered) => stats.record_frame(),
                        Ok(_) => {}
                        Err(err) => log::debug!("frame skipped: {err}"),
                    }
                    stats.update_window_title(&window, engine.state());
                }
                _ => {}
            }
        }
        Event::AboutToWait => {
            window.request_redraw();
        }
        _ => {}
    })?;
    Ok(())
}
