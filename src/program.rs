//! The nine full-screen passes and their shader sources.
//!
//! Each pass is a vertex + fragment pair. Sampler slots are resolved once,
//! when the program is compiled, so per-frame code binds inputs by a typed
//! [`Sampler`] and never looks anything up by string.

use bytemuck::{Pod, Zeroable};

use crate::backend::{ProgramHandle, RenderBackend};
use crate::error::Result;
use crate::grid::TextureId;

const COMMON: &str = include_str!("../shaders/common.wgsl");
const BASE_VERTEX: &str = include_str!("../shaders/base_vertex.wgsl");
const DISPLAY_VERTEX: &str = include_str!("../shaders/display_vertex.wgsl");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Clear,
    Splat,
    Advection,
    Divergence,
    Curl,
    Vorticity,
    Pressure,
    GradientSubtract,
    Display,
}

/// Named texture inputs of the fluid passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sampler {
    Texture,
    Target,
    Velocity,
    Source,
    Curl,
    Pressure,
    Divergence,
    Fluid,
}

impl ProgramKind {
    pub const ALL: [ProgramKind; 9] = [
        ProgramKind::Clear,
        ProgramKind::Splat,
        ProgramKind::Advection,
        ProgramKind::Divergence,
        ProgramKind::Curl,
        ProgramKind::Vorticity,
        ProgramKind::Pressure,
        ProgramKind::GradientSubtract,
        ProgramKind::Display,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ProgramKind::Clear => "Clear",
            ProgramKind::Splat => "Splat",
            ProgramKind::Advection => "Advection",
            ProgramKind::Divergence => "Divergence",
            ProgramKind::Curl => "Curl",
            ProgramKind::Vorticity => "Vorticity",
            ProgramKind::Pressure => "Pressure",
            ProgramKind::GradientSubtract => "Gradient Subtract",
            ProgramKind::Display => "Display",
        }
    }

    /// Vertex stage, with the shared declarations prepended.
    pub fn vertex_source(self) -> String {
        let stage = match self {
            ProgramKind::Display => DISPLAY_VERTEX,
            _ => BASE_VERTEX,
        };
        format!("{COMMON}\n{stage}")
    }

    pub fn fragment_source(self) -> &'static str {
        match self {
            ProgramKind::Clear => include_str!("../shaders/clear.wgsl"),
            ProgramKind::Splat => include_str!("../shaders/splat.wgsl"),
            ProgramKind::Advection => include_str!("../shaders/advection.wgsl"),
            ProgramKind::Divergence => include_str!("../shaders/divergence.wgsl"),
            ProgramKind::Curl => include_str!("../shaders/curl.wgsl"),
            ProgramKind::Vorticity => include_str!("../shaders/vorticity.wgsl"),
            ProgramKind::Pressure => include_str!("../shaders/pressure.wgsl"),
            ProgramKind::GradientSubtract => include_str!("../shaders/gradient_subtract.wgsl"),
            ProgramKind::Display => include_str!("../shaders/display.wgsl"),
        }
    }

    /// Texture inputs in slot order.
    pub fn samplers(self) -> &'static [Sampler] {
        match self {
            ProgramKind::Clear => &[Sampler::Texture],
            ProgramKind::Splat => &[Sampler::Target],
            ProgramKind::Advection => &[Sampler::Velocity, Sampler::Source],
            ProgramKind::Divergence => &[Sampler::Velocity],
            ProgramKind::Curl => &[Sampler::Velocity],
            ProgramKind::Vorticity => &[Sampler::Velocity, Sampler::Curl],
            ProgramKind::Pressure => &[Sampler::Pressure, Sampler::Divergence],
            ProgramKind::GradientSubtract => &[Sampler::Pressure, Sampler::Velocity],
            ProgramKind::Display => &[Sampler::Texture, Sampler::Fluid],
        }
    }
}

/// Uniform block shared by every pass. Layout matches `Uniforms` in
/// `shaders/common.wgsl`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct PassUniforms {
    pub texel_size: [f32; 2],
    pub dye_texel_size: [f32; 2],
    pub point: [f32; 2],
    pub aspect_ratio: f32,
    pub radius: f32,
    pub color: [f32; 4],
    pub dt: f32,
    pub dissipation: f32,
    pub curl: f32,
    pub value: f32,
    pub intensity: f32,
    /// Written by the backend per target: -1 for grids, 1 for the screen.
    pub clip_flip: f32,
    pub _pad: [f32; 2],
}

const _: [(); 80] = [(); std::mem::size_of::<PassUniforms>()];

impl Default for PassUniforms {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// A compiled pass plus its resolved sampler slots.
#[derive(Debug, Clone)]
pub struct Program {
    kind: ProgramKind,
    handle: ProgramHandle,
    slots: Vec<(Sampler, usize)>,
}

impl Program {
    pub fn compile<B: RenderBackend + ?Sized>(backend: &mut B, kind: ProgramKind) -> Result<Self> {
        let vertex = kind.vertex_source();
        let handle = backend.compile(kind, &vertex, kind.fragment_source())?;
        let slots = kind
            .samplers()
            .iter()
            .enumerate()
            .map(|(slot, sampler)| (*sampler, slot))
            .collect();
        Ok(Self { kind, handle, slots })
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    fn slot(&self, sampler: Sampler) -> Option<usize> {
        self.slots.iter().find(|(s, _)| *s == sampler).map(|(_, slot)| *slot)
    }
}

/// Where a pass renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Grid(TextureId),
    Screen,
}

/// One full-screen draw.
#[derive(Debug, Clone)]
pub struct Pass {
    pub kind: ProgramKind,
    pub program: ProgramHandle,
    pub inputs: [Option<TextureId>; 2],
    pub uniforms: PassUniforms,
    pub target: Target,
}

impl Pass {
    pub fn new(program: &Program, target: Target) -> PassBuilder<'_> {
        PassBuilder {
            program,
            pass: Pass {
                kind: program.kind,
                program: program.handle,
                inputs: [None; 2],
                uniforms: PassUniforms::default(),
                target,
            },
        }
    }

    /// True when the target is also bound as an input.
    pub fn reads_own_target(&self) -> bool {
        match self.target {
            Target::Grid(id) => self.inputs.iter().any(|input| *input == Some(id)),
            Target::Screen => false,
        }
    }
}

pub struct PassBuilder<'a> {
    program: &'a Program,
    pass: Pass,
}

impl<'a> PassBuilder<'a> {
    pub fn bind(mut self, sampler: Sampler, texture: TextureId) -> Self {
        match self.program.slot(sampler) {
            Some(slot) => self.pass.inputs[slot] = Some(texture),
            None => debug_assert!(false, "{:?} has no {:?} input", self.program.kind, sampler),
        }
        self
    }

    pub fn uniforms(mut self, uniforms: PassUniforms) -> Self {
        self.pass.uniforms = uniforms;
        self
    }

    pub fn build(self) -> Pass {
        self.pass
    }
}
