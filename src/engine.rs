//! One fluid-distorted image on one output surface.
//!
//! The engine owns every grid, program and queued splat. A host drives it
//! with `init`, then `step` once per display frame, `resize` when the surface
//! changes size and `dispose` (or drop) when done.

use std::sync::Arc;

use crate::asset::{AssetStatus, PendingAsset, SourceImage};
use crate::backend::{RenderBackend, SurfaceStatus};
use crate::compositor;
use crate::config::SimulationParameters;
use crate::error::{EngineError, Result};
use crate::grid::{TextureFormat, TextureId};
use crate::input::SplatQueue;
use crate::solver::{Field, Solver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Running,
    /// Drawing suspended until the host restores the surface.
    SurfaceLost,
    /// A fatal error happened; the engine never draws again.
    Inert,
    Disposed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Running => "running",
            SessionState::SurfaceLost => "surface lost",
            SessionState::Inert => "inert",
            SessionState::Disposed => "disposed",
        }
    }
}

/// What one call to [`Engine::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Solver ran and the distorted image was drawn.
    Rendered,
    /// Source image still loading; nothing was drawn.
    AwaitingAsset,
    /// Source image failed to load; the engine will not draw again.
    AssetUnavailable,
    /// Not running (surface lost, inert or disposed).
    Suspended,
}

enum AssetSlot {
    Pending(PendingAsset),
    Ready {
        image: Arc<SourceImage>,
        texture: Option<TextureId>,
    },
    Failed(String),
}

pub struct Engine<B: RenderBackend> {
    backend: B,
    params: SimulationParameters,
    state: SessionState,
    solver: Option<Solver>,
    splats: SplatQueue,
    asset: AssetSlot,
    format: TextureFormat,
    frames: u64,
}

impl<B: RenderBackend> Engine<B> {
    pub fn new(backend: B, mut params: SimulationParameters, asset: PendingAsset) -> Self {
        params.sanitize();
        let format = TextureFormat::select(backend.supports_half_float());
        Self {
            backend,
            params,
            state: SessionState::Uninitialized,
            solver: None,
            splats: SplatQueue::new(),
            asset: AssetSlot::Pending(asset),
            format,
            frames: 0,
        }
    }

    /// Shared handle input code pushes splats into.
    pub fn splat_queue(&self) -> SplatQueue {
        self.splats.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn params(&self) -> &SimulationParameters {
        &self.params
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Frames rendered so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Compiles every program and allocates every grid. Any failure leaves
    /// the engine inert with nothing allocated.
    pub fn init(&mut self) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(self.invalid("init"));
        }
        self.state = SessionState::Initializing;
        match self.build() {
            Ok(()) => {
                self.state = SessionState::Running;
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn build(&mut self) -> Result<()> {
        if self.backend.surface_status() == SurfaceStatus::Lost {
            return Err(EngineError::ContextUnavailable("surface is lost".to_string()));
        }
        self.format = TextureFormat::select(self.backend.supports_half_float());
        let solver = Solver::new(&mut self.backend, &self.params, self.format)?;
        self.solver = Some(solver);
        let (width, height) = self.backend.surface_size();
        log::info!(
            "fluid engine ready: {:?} grids, sim {}², dye {}², surface {}x{}",
            self.format,
            self.params.sim_resolution,
            self.params.dye_resolution,
            width,
            height
        );
        Ok(())
    }

    /// Advances one frame. Never blocks on the asset load.
    pub fn step(&mut self) -> Result<FrameOutcome> {
        match self.state {
            SessionState::Running => {}
            SessionState::Uninitialized | SessionState::Initializing => return Err(self.invalid("step")),
            SessionState::SurfaceLost | SessionState::Inert | SessionState::Disposed => {
                return Ok(FrameOutcome::Suspended)
            }
        }
        if self.backend.surface_status() == SurfaceStatus::Lost {
            self.surface_lost();
            return Ok(FrameOutcome::Suspended);
        }
        match self.frame() {
            Ok(outcome) => Ok(outcome),
            Err(EngineError::SurfaceLost) => {
                self.surface_lost();
                Ok(FrameOutcome::Suspended)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.fail(&err);
                }
                Err(err)
            }
        }
    }

    fn frame(&mut self) -> Result<FrameOutcome> {
        if let AssetSlot::Pending(pending) = &mut self.asset {
            match pending.poll() {
                AssetStatus::Pending => return Ok(FrameOutcome::AwaitingAsset),
                AssetStatus::Ready(image) => {
                    log::info!("source image loaded: {}x{}", image.width(), image.height());
                    self.asset = AssetSlot::Ready { image, texture: None };
                }
                AssetStatus::Failed(reason) => {
                    log::warn!("source image failed to load: {reason}; fluid stays off");
                    self.asset = AssetSlot::Failed(reason);
                }
            }
        }

        let image = match &mut self.asset {
            AssetSlot::Pending(_) => return Ok(FrameOutcome::AwaitingAsset),
            AssetSlot::Failed(_) => {
                self.splats.clear();
                return Ok(FrameOutcome::AssetUnavailable);
            }
            AssetSlot::Ready { image, texture } => match texture {
                Some(id) => *id,
                None => {
                    let id = self.backend.upload_image(image)?;
                    *texture = Some(id);
                    id
                }
            },
        };

        let Some(solver) = self.solver.as_mut() else {
            return Err(EngineError::InvalidState {
                operation: "step",
                state: "missing solver",
            });
        };
        let splats = self.splats.drain();
        let (width, height) = self.backend.surface_size();
        let aspect_ratio = width as f32 / height.max(1) as f32;
        solver.step(&mut self.backend, &self.params, &splats, aspect_ratio)?;
        compositor::composite(
            &mut self.backend,
            &solver.programs().display,
            image,
            solver.fields().dye.read().id(),
            &self.params,
        )?;
        self.backend.finish_frame()?;
        self.frames += 1;
        Ok(FrameOutcome::Rendered)
    }

    /// Reconfigures the surface and rebuilds every grid and program at the
    /// new size. Queued splats survive.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        match self.state {
            SessionState::Running | SessionState::SurfaceLost => {}
            _ => return Err(self.invalid("resize")),
        }
        if let Err(err) = self.backend.configure_surface(width, height) {
            if err.is_recoverable() {
                self.surface_lost();
            }
            return Err(err);
        }
        if self.backend.surface_status() == SurfaceStatus::Lost {
            self.surface_lost();
            return Err(EngineError::SurfaceLost);
        }
        self.teardown();
        self.state = SessionState::Initializing;
        match self.build() {
            Ok(()) => {
                self.state = SessionState::Running;
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Marks the surface as gone. Everything on the backend is treated as
    /// destroyed and released; `restore` rebuilds from scratch.
    pub fn surface_lost(&mut self) {
        if matches!(
            self.state,
            SessionState::SurfaceLost | SessionState::Disposed | SessionState::Inert
        ) {
            return;
        }
        log::warn!("rendering surface lost; fluid paused");
        self.teardown();
        self.state = SessionState::SurfaceLost;
    }

    /// Rebuilds after a surface loss.
    pub fn restore(&mut self) -> Result<()> {
        if self.state != SessionState::SurfaceLost {
            return Err(self.invalid("restore"));
        }
        if self.backend.surface_status() == SurfaceStatus::Lost {
            return Err(EngineError::SurfaceLost);
        }
        self.state = SessionState::Initializing;
        match self.build() {
            Ok(()) => {
                log::info!("rendering surface restored");
                self.state = SessionState::Running;
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Releases everything. Idempotent.
    pub fn dispose(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        self.teardown();
        self.splats.clear();
        self.state = SessionState::Disposed;
        log::debug!("fluid engine disposed after {} frames", self.frames);
    }

    /// The decoded source image, for hosts that fall back to showing it
    /// undistorted.
    pub fn source_image(&self) -> Result<Arc<SourceImage>> {
        match &self.asset {
            AssetSlot::Pending(_) => Err(EngineError::AssetLoadPending),
            AssetSlot::Ready { image, .. } => Ok(Arc::clone(image)),
            AssetSlot::Failed(reason) => Err(EngineError::AssetLoadFailed(reason.clone())),
        }
    }

    /// Copies a field's current contents back from the backend.
    pub fn read_field(&mut self, field: Field) -> Result<Vec<[f32; 4]>> {
        let Some(solver) = self.solver.as_ref() else {
            return Err(self.invalid("read_field"));
        };
        let id = solver.fields().current(field).id();
        self.backend.read_texels(id)
    }

    fn teardown(&mut self) {
        if let Some(solver) = self.solver.take() {
            solver.release(&mut self.backend);
        }
        if let AssetSlot::Ready { texture, .. } = &mut self.asset {
            if let Some(id) = texture.take() {
                self.backend.release(id);
            }
        }
    }

    fn fail(&mut self, err: &EngineError) {
        log::error!("fluid engine stopped: {err}");
        self.teardown();
        self.state = SessionState::Inert;
    }

    fn invalid(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }
}

impl<B: RenderBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;
    use crate::input::Splat;
    use crate::program::ProgramKind;

    fn params() -> SimulationParameters {
        SimulationParameters {
            sim_resolution: 8,
            dye_resolution: 16,
            ..SimulationParameters::default()
        }
    }

    fn running() -> Engine<CpuBackend> {
        let image = SourceImage::solid(4, 4, [128, 128, 128, 255]);
        let mut engine = Engine::new(CpuBackend::new(8, 8), params(), PendingAsset::ready(image));
        engine.init().unwrap();
        engine
    }

    #[test]
    fn step_before_init_is_rejected() {
        let mut engine = Engine::new(
            CpuBackend::new(8, 8),
            params(),
            PendingAsset::ready(SourceImage::solid(1, 1, [0; 4])),
        );
        assert!(matches!(engine.step(), Err(EngineError::InvalidState { .. })));
        assert_eq!(engine.state(), SessionState::Uninitialized);
    }

    #[test]
    fn init_twice_is_rejected() {
        let mut engine = running();
        assert!(matches!(engine.init(), Err(EngineError::InvalidState { .. })));
        assert_eq!(engine.state(), SessionState::Running);
    }

    #[test]
    fn running_engine_renders_and_uploads_once() {
        let mut engine = running();
        assert_eq!(engine.step().unwrap(), FrameOutcome::Rendered);
        assert_eq!(engine.step().unwrap(), FrameOutcome::Rendered);
        // Solver grids plus the image texture.
        assert_eq!(engine.backend().live_textures(), crate::solver::Fields::TEXTURE_COUNT + 1);
        assert_eq!(engine.backend().draw_count(ProgramKind::Display), 2);
        assert_eq!(engine.backend().frames_finished(), 2);
        assert_eq!(engine.frame_count(), 2);
    }

    #[test]
    fn step_drains_the_queue() {
        let mut engine = running();
        let queue = engine.splat_queue();
        queue.push(Splat {
            position: [0.5, 0.5],
            velocity: [1.0, 0.0],
        });
        engine.step().unwrap();
        assert!(queue.is_empty());
        assert_eq!(engine.backend().draw_count(ProgramKind::Splat), 2);
    }

    #[test]
    fn dispose_releases_everything_and_is_idempotent() {
        let mut engine = running();
        engine.step().unwrap();
        engine.dispose();
        engine.dispose();
        assert_eq!(engine.state(), SessionState::Disposed);
        assert_eq!(engine.backend().live_textures(), 0);
        assert_eq!(engine.backend().live_programs(), 0);
        assert_eq!(engine.step().unwrap(), FrameOutcome::Suspended);
    }

    #[test]
    fn resize_before_init_is_rejected() {
        let mut engine = Engine::new(
            CpuBackend::new(8, 8),
            params(),
            PendingAsset::ready(SourceImage::solid(1, 1, [0; 4])),
        );
        assert!(engine.resize(16, 16).is_err());
    }

    #[test]
    fn zero_sized_resize_keeps_running() {
        let mut engine = running();
        assert!(matches!(engine.resize(0, 10), Err(EngineError::Config(_))));
        assert_eq!(engine.state(), SessionState::Running);
        assert_eq!(engine.step().unwrap(), FrameOutcome::Rendered);
    }

    #[test]
    fn parameters_are_sanitized_on_construction() {
        let engine = Engine::new(
            CpuBackend::new(8, 8),
            SimulationParameters {
                pressure_iterations: 0,
                velocity_dissipation: f32::NAN,
                ..params()
            },
            PendingAsset::ready(SourceImage::solid(1, 1, [0; 4])),
        );
        assert_eq!(engine.params().pressure_iterations, 1);
        assert!((engine.params().velocity_dissipation - 0.98).abs() < 1e-6);
    }
}
