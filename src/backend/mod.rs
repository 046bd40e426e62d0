//! The drawing context the engine runs on.
//!
//! [`gpu::GpuBackend`] drives a real wgpu device and window surface.
//! [`cpu::CpuBackend`] executes the same passes on `f32` grids in memory; it is
//! what the tests and headless runs use.

pub mod cpu;
pub mod gpu;

use crate::asset::SourceImage;
use crate::error::{EngineError, Result};
use crate::grid::{GridDescriptor, TextureId};
use crate::program::{Pass, ProgramKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Ready,
    Lost,
}

pub trait RenderBackend {
    /// Whether `Rgba16Float` can be both rendered to and linearly filtered.
    fn supports_half_float(&self) -> bool;

    /// Output surface size in physical pixels.
    fn surface_size(&self) -> (u32, u32);

    fn surface_status(&self) -> SurfaceStatus;

    /// Reconfigures the output surface. Grids are untouched; the engine
    /// rebuilds them itself.
    fn configure_surface(&mut self, width: u32, height: u32) -> Result<()>;

    /// Creates a zero-filled, clamp-to-edge grid texture.
    fn allocate(&mut self, desc: &GridDescriptor) -> Result<TextureId>;

    fn release(&mut self, id: TextureId);

    fn live_textures(&self) -> usize;

    /// Uploads the source image as a linearly filtered texture.
    fn upload_image(&mut self, image: &SourceImage) -> Result<TextureId>;

    fn compile(&mut self, kind: ProgramKind, vertex: &str, fragment: &str) -> Result<ProgramHandle>;

    fn release_program(&mut self, handle: ProgramHandle);

    /// Records one full-screen pass. Passes are executed in recording order.
    fn draw(&mut self, pass: &Pass) -> Result<()>;

    /// Submits everything recorded since the last call and presents the
    /// screen if a pass rendered to it.
    fn finish_frame(&mut self) -> Result<()>;

    /// Copies a texture back as RGBA `f32`, row 0 first.
    fn read_texels(&mut self, id: TextureId) -> Result<Vec<[f32; 4]>>;
}

pub(crate) fn missing_texture(id: TextureId) -> EngineError {
    log::debug!("texture {:?} is not live", id);
    EngineError::InvalidState {
        operation: "texture access",
        state: "released",
    }
}
