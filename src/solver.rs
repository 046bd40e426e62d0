//! Per-frame velocity/pressure solve and dye transport.
//!
//! Every step is one full-screen pass over a grid: read from the current
//! buffer, render into the other, swap. The order is fixed:
//! splats, curl, vorticity confinement, divergence, pressure fade, Jacobi
//! pressure solve, gradient subtraction, velocity self-advection, dye
//! advection.

use crate::backend::RenderBackend;
use crate::config::SimulationParameters;
use crate::error::{EngineError, Result};
use crate::grid::{AllocationLedger, DoubleBuffer, FilterMode, GridBuffer, GridDescriptor, SingleBuffer, TextureFormat};
use crate::input::Splat;
use crate::program::{Pass, PassUniforms, Program, ProgramKind, Sampler, Target};

/// One compiled program per pass.
pub struct Programs {
    pub clear: Program,
    pub splat: Program,
    pub advection: Program,
    pub divergence: Program,
    pub curl: Program,
    pub vorticity: Program,
    pub pressure: Program,
    pub gradient_subtract: Program,
    pub display: Program,
}

impl Programs {
    /// Compiles the full set or nothing: programs built before a failure are
    /// released again.
    pub fn compile<B: RenderBackend + ?Sized>(backend: &mut B) -> Result<Self> {
        let mut compiled = Vec::with_capacity(ProgramKind::ALL.len());
        for kind in ProgramKind::ALL {
            match Program::compile(backend, kind) {
                Ok(program) => compiled.push(program),
                Err(err) => {
                    for program in compiled {
                        backend.release_program(program.handle());
                    }
                    return Err(err);
                }
            }
        }
        let mut take = compiled.into_iter();
        let mut next = || take.next().ok_or(EngineError::InvalidState {
            operation: "compile",
            state: "missing program",
        });
        Ok(Self {
            clear: next()?,
            splat: next()?,
            advection: next()?,
            divergence: next()?,
            curl: next()?,
            vorticity: next()?,
            pressure: next()?,
            gradient_subtract: next()?,
            display: next()?,
        })
    }

    fn all(&self) -> [&Program; 9] {
        [
            &self.clear,
            &self.splat,
            &self.advection,
            &self.divergence,
            &self.curl,
            &self.vorticity,
            &self.pressure,
            &self.gradient_subtract,
            &self.display,
        ]
    }

    pub fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        for program in self.all() {
            backend.release_program(program.handle());
        }
    }
}

/// The grids the solver works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Velocity,
    Dye,
    Pressure,
    Divergence,
    Curl,
}

pub struct Fields {
    pub velocity: DoubleBuffer,
    pub dye: DoubleBuffer,
    pub pressure: DoubleBuffer,
    pub divergence: SingleBuffer,
    pub curl: SingleBuffer,
}

impl Fields {
    /// Number of textures one field set holds.
    pub const TEXTURE_COUNT: usize = 8;

    pub fn allocate<B: RenderBackend + ?Sized>(
        backend: &mut B,
        params: &SimulationParameters,
        format: TextureFormat,
    ) -> Result<Self> {
        let mut ledger = AllocationLedger::new();
        match Self::allocate_with(&mut ledger, backend, params, format) {
            Ok(fields) => Ok(fields),
            Err(err) => {
                ledger.rollback(backend);
                Err(err)
            }
        }
    }

    fn allocate_with<B: RenderBackend + ?Sized>(
        ledger: &mut AllocationLedger,
        backend: &mut B,
        params: &SimulationParameters,
        format: TextureFormat,
    ) -> Result<Self> {
        let sim = |label, filter| GridDescriptor::square(label, params.sim_resolution, format, filter);
        Ok(Self {
            velocity: ledger.double(backend, sim("velocity", FilterMode::Linear))?,
            dye: ledger.double(
                backend,
                GridDescriptor::square("dye", params.dye_resolution, format, FilterMode::Linear),
            )?,
            pressure: ledger.double(backend, sim("pressure", FilterMode::Nearest))?,
            divergence: ledger.single(backend, sim("divergence", FilterMode::Nearest))?,
            curl: ledger.single(backend, sim("curl", FilterMode::Nearest))?,
        })
    }

    /// The buffer holding the field's current value.
    pub fn current(&self, field: Field) -> &GridBuffer {
        match field {
            Field::Velocity => self.velocity.read(),
            Field::Dye => self.dye.read(),
            Field::Pressure => self.pressure.read(),
            Field::Divergence => self.divergence.get(),
            Field::Curl => self.curl.get(),
        }
    }

    pub fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        self.velocity.release(backend);
        self.dye.release(backend);
        self.pressure.release(backend);
        self.divergence.release(backend);
        self.curl.release(backend);
    }
}

pub struct Solver {
    programs: Programs,
    fields: Fields,
}

impl Solver {
    pub fn new<B: RenderBackend + ?Sized>(
        backend: &mut B,
        params: &SimulationParameters,
        format: TextureFormat,
    ) -> Result<Self> {
        let programs = Programs::compile(backend)?;
        let fields = match Fields::allocate(backend, params, format) {
            Ok(fields) => fields,
            Err(err) => {
                programs.release(backend);
                return Err(err);
            }
        };
        Ok(Self { programs, fields })
    }

    pub fn programs(&self) -> &Programs {
        &self.programs
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        self.fields.release(backend);
        self.programs.release(backend);
    }

    /// Runs one full solver frame: splats, then the fixed pass sequence.
    pub fn step<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        params: &SimulationParameters,
        splats: &[Splat],
        aspect_ratio: f32,
    ) -> Result<()> {
        for splat in splats {
            self.splat(backend, params, splat, aspect_ratio)?;
        }
        self.compute_curl(backend, params)?;
        self.confine_vorticity(backend, params)?;
        self.compute_divergence(backend, params)?;
        self.fade_pressure(backend, params)?;
        self.solve_pressure(backend, params)?;
        self.subtract_gradient(backend, params)?;
        self.advect_velocity(backend, params)?;
        self.advect_dye(backend, params)?;
        Ok(())
    }

    fn sim_uniforms(params: &SimulationParameters) -> PassUniforms {
        PassUniforms {
            texel_size: params.sim_texel_size(),
            dt: params.time_step,
            ..PassUniforms::default()
        }
    }

    /// Adds a Gaussian impulse to velocity and dye.
    pub fn splat<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        params: &SimulationParameters,
        splat: &Splat,
        aspect_ratio: f32,
    ) -> Result<()> {
        let uniforms = PassUniforms {
            point: splat.position,
            aspect_ratio,
            radius: params.splat_radius,
            color: splat.color(),
            ..Self::sim_uniforms(params)
        };
        for field in [&mut self.fields.velocity, &mut self.fields.dye] {
            let pass = Pass::new(&self.programs.splat, Target::Grid(field.write().id()))
                .bind(Sampler::Target, field.read().id())
                .uniforms(uniforms)
                .build();
            backend.draw(&pass)?;
            field.swap();
        }
        Ok(())
    }

    pub fn compute_curl<B: RenderBackend + ?Sized>(&mut self, backend: &mut B, params: &SimulationParameters) -> Result<()> {
        let pass = Pass::new(&self.programs.curl, Target::Grid(self.fields.curl.get().id()))
            .bind(Sampler::Velocity, self.fields.velocity.read().id())
            .uniforms(Self::sim_uniforms(params))
            .build();
        backend.draw(&pass)
    }

    pub fn confine_vorticity<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        params: &SimulationParameters,
    ) -> Result<()> {
        let velocity = &mut self.fields.velocity;
        let pass = Pass::new(&self.programs.vorticity, Target::Grid(velocity.write().id()))
            .bind(Sampler::Velocity, velocity.read().id())
            .bind(Sampler::Curl, self.fields.curl.get().id())
            .uniforms(PassUniforms {
                curl: params.curl_strength,
                ..Self::sim_uniforms(params)
            })
            .build();
        backend.draw(&pass)?;
        velocity.swap();
        Ok(())
    }

    pub fn compute_divergence<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        params: &SimulationParameters,
    ) -> Result<()> {
        let pass = Pass::new(&self.programs.divergence, Target::Grid(self.fields.divergence.get().id()))
            .bind(Sampler::Velocity, self.fields.velocity.read().id())
            .uniforms(Self::sim_uniforms(params))
            .build();
        backend.draw(&pass)
    }

    /// Scales last frame's pressure down instead of zeroing it, which keeps
    /// the solve warm from frame to frame.
    pub fn fade_pressure<B: RenderBackend + ?Sized>(&mut self, backend: &mut B, params: &SimulationParameters) -> Result<()> {
        let pressure = &mut self.fields.pressure;
        let pass = Pass::new(&self.programs.clear, Target::Grid(pressure.write().id()))
            .bind(Sampler::Texture, pressure.read().id())
            .uniforms(PassUniforms {
                value: params.pressure_dissipation,
                ..Self::sim_uniforms(params)
            })
            .build();
        backend.draw(&pass)?;
        pressure.swap();
        Ok(())
    }

    pub fn solve_pressure<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        params: &SimulationParameters,
    ) -> Result<()> {
        let divergence = self.fields.divergence.get().id();
        let pressure = &mut self.fields.pressure;
        for _ in 0..params.pressure_iterations {
            let pass = Pass::new(&self.programs.pressure, Target::Grid(pressure.write().id()))
                .bind(Sampler::Pressure, pressure.read().id())
                .bind(Sampler::Divergence, divergence)
                .uniforms(Self::sim_uniforms(params))
                .build();
            backend.draw(&pass)?;
            pressure.swap();
        }
        Ok(())
    }

    pub fn subtract_gradient<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        params: &SimulationParameters,
    ) -> Result<()> {
        let velocity = &mut self.fields.velocity;
        let pass = Pass::new(&self.programs.gradient_subtract, Target::Grid(velocity.write().id()))
            .bind(Sampler::Pressure, self.fields.pressure.read().id())
            .bind(Sampler::Velocity, velocity.read().id())
            .uniforms(Self::sim_uniforms(params))
            .build();
        backend.draw(&pass)?;
        velocity.swap();
        Ok(())
    }

    pub fn advect_velocity<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        params: &SimulationParameters,
    ) -> Result<()> {
        let velocity = &mut self.fields.velocity;
        let current = velocity.read().id();
        let pass = Pass::new(&self.programs.advection, Target::Grid(velocity.write().id()))
            .bind(Sampler::Velocity, current)
            .bind(Sampler::Source, current)
            .uniforms(PassUniforms {
                dye_texel_size: params.sim_texel_size(),
                dissipation: params.velocity_dissipation,
                ..Self::sim_uniforms(params)
            })
            .build();
        backend.draw(&pass)?;
        velocity.swap();
        Ok(())
    }

    /// Moves dye through the freshly advected velocity at the dye grid's own
    /// resolution.
    pub fn advect_dye<B: RenderBackend + ?Sized>(&mut self, backend: &mut B, params: &SimulationParameters) -> Result<()> {
        let dye = &mut self.fields.dye;
        let pass = Pass::new(&self.programs.advection, Target::Grid(dye.write().id()))
            .bind(Sampler::Velocity, self.fields.velocity.read().id())
            .bind(Sampler::Source, dye.read().id())
            .uniforms(PassUniforms {
                dye_texel_size: dye.read().texel_size(),
                dissipation: params.density_dissipation,
                ..Self::sim_uniforms(params)
            })
            .build();
        backend.draw(&pass)?;
        dye.swap();
        Ok(())
    }
}
