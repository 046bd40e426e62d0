//! Software rasteriser for the fluid passes.
//!
//! Each pass is evaluated once per target texel at its centre, with the same
//! arithmetic as the WGSL fragment stage. Sampling follows clamp-to-edge
//! addressing with per-texture linear or nearest filtering. Row 0 of every
//! texture is `v = 0`; row 0 of the screen is its bottom edge.

use std::collections::HashMap;

use super::{missing_texture, ProgramHandle, RenderBackend, SurfaceStatus};
use crate::asset::SourceImage;
use crate::error::{EngineError, Result};
use crate::grid::{FilterMode, GridDescriptor, TextureFormat, TextureId};
use crate::program::{Pass, PassUniforms, ProgramKind, Target};

struct CpuTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    filter: FilterMode,
    texels: Vec<[f32; 4]>,
}

impl CpuTexture {
    fn texel(&self, x: i64, y: i64) -> [f32; 4] {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.texels[y * self.width as usize + x]
    }

    fn sample(&self, uv: [f32; 2]) -> [f32; 4] {
        let (w, h) = (self.width as f32, self.height as f32);
        match self.filter {
            FilterMode::Nearest => self.texel((uv[0] * w).floor() as i64, (uv[1] * h).floor() as i64),
            FilterMode::Linear => {
                let sx = uv[0] * w - 0.5;
                let sy = uv[1] * h - 0.5;
                let (x0, y0) = (sx.floor(), sy.floor());
                let (fx, fy) = (sx - x0, sy - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let a = self.texel(x0, y0);
                let b = self.texel(x0 + 1, y0);
                let c = self.texel(x0, y0 + 1);
                let d = self.texel(x0 + 1, y0 + 1);
                mix4(mix4(a, b, fx), mix4(c, d, fx), fy)
            }
        }
    }
}

/// Headless backend. Besides running the passes it records what happened so
/// callers can inspect draw counts and live resources, and it can be told to
/// fail on purpose.
pub struct CpuBackend {
    width: u32,
    height: u32,
    half_float: bool,
    surface: SurfaceStatus,
    textures: HashMap<u64, CpuTexture>,
    next_texture: u64,
    programs: HashMap<u32, ProgramKind>,
    next_program: u32,
    screen: Vec<[f32; 4]>,
    draw_counts: HashMap<ProgramKind, usize>,
    frames: usize,
    failing_compile: Option<ProgramKind>,
    failing_link: Option<ProgramKind>,
    allocations_left: Option<usize>,
}

impl CpuBackend {
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        Self {
            width,
            height,
            half_float: true,
            surface: SurfaceStatus::Ready,
            textures: HashMap::new(),
            next_texture: 1,
            programs: HashMap::new(),
            next_program: 1,
            screen: vec![[0.0; 4]; (width * height) as usize],
            draw_counts: HashMap::new(),
            frames: 0,
            failing_compile: None,
            failing_link: None,
            allocations_left: None,
        }
    }

    /// Behave like a context without half-float render targets.
    pub fn without_half_float(mut self) -> Self {
        self.half_float = false;
        self
    }

    pub fn draw_count(&self, kind: ProgramKind) -> usize {
        self.draw_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_draws(&self) -> usize {
        self.draw_counts.values().sum()
    }

    pub fn frames_finished(&self) -> usize {
        self.frames
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    /// Composited output, bottom row first.
    pub fn screen(&self) -> &[[f32; 4]] {
        &self.screen
    }

    pub fn fail_compile(&mut self, kind: ProgramKind) {
        self.failing_compile = Some(kind);
    }

    pub fn fail_link(&mut self, kind: ProgramKind) {
        self.failing_link = Some(kind);
    }

    /// Lets `count` more allocations succeed, then fails every one after.
    pub fn fail_allocations_after(&mut self, count: usize) {
        self.allocations_left = Some(count);
    }

    pub fn lose_surface(&mut self) {
        self.surface = SurfaceStatus::Lost;
    }

    pub fn restore_surface(&mut self) {
        self.surface = SurfaceStatus::Ready;
    }

    /// Overwrites a texture's contents; `texels` must match its size.
    pub fn write_texels(&mut self, id: TextureId, texels: &[[f32; 4]]) -> Result<()> {
        let texture = self.textures.get_mut(&id.0).ok_or_else(|| missing_texture(id))?;
        if texels.len() != texture.texels.len() {
            return Err(EngineError::Config(format!(
                "expected {} texels, got {}",
                texture.texels.len(),
                texels.len()
            )));
        }
        texture.texels.copy_from_slice(texels);
        Ok(())
    }

    fn insert(&mut self, texture: CpuTexture) -> TextureId {
        let id = self.next_texture;
        self.next_texture += 1;
        self.textures.insert(id, texture);
        TextureId(id)
    }

    fn input(&self, id: Option<TextureId>) -> Result<Option<&CpuTexture>> {
        match id {
            Some(id) => self.textures.get(&id.0).map(Some).ok_or_else(|| missing_texture(id)),
            None => Ok(None),
        }
    }
}

impl RenderBackend for CpuBackend {
    fn supports_half_float(&self) -> bool {
        self.half_float
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn surface_status(&self) -> SurfaceStatus {
        self.surface
    }

    fn configure_surface(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(EngineError::Config(format!("surface size {width}x{height}")));
        }
        self.width = width;
        self.height = height;
        self.screen = vec![[0.0; 4]; (width * height) as usize];
        Ok(())
    }

    fn allocate(&mut self, desc: &GridDescriptor) -> Result<TextureId> {
        let refuse = |reason: &str| EngineError::Allocation {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            reason: reason.to_string(),
        };
        if self.surface == SurfaceStatus::Lost {
            return Err(refuse("context lost"));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(refuse("zero-sized grid"));
        }
        if desc.format == TextureFormat::Rgba16Float && !self.half_float {
            return Err(refuse("half-float targets unsupported"));
        }
        if let Some(left) = self.allocations_left.as_mut() {
            if *left == 0 {
                return Err(refuse("out of memory"));
            }
            *left -= 1;
        }
        Ok(self.insert(CpuTexture {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            filter: desc.filter,
            texels: vec![[0.0; 4]; desc.texel_count()],
        }))
    }

    fn release(&mut self, id: TextureId) {
        self.textures.remove(&id.0);
    }

    fn live_textures(&self) -> usize {
        self.textures.len()
    }

    fn upload_image(&mut self, image: &SourceImage) -> Result<TextureId> {
        let texels = image
            .pixels()
            .chunks_exact(4)
            .map(|p| {
                [
                    p[0] as f32 / 255.0,
                    p[1] as f32 / 255.0,
                    p[2] as f32 / 255.0,
                    p[3] as f32 / 255.0,
                ]
            })
            .collect();
        Ok(self.insert(CpuTexture {
            width: image.width(),
            height: image.height(),
            format: TextureFormat::Rgba8Unorm,
            filter: FilterMode::Linear,
            texels,
        }))
    }

    fn compile(&mut self, kind: ProgramKind, vertex: &str, fragment: &str) -> Result<ProgramHandle> {
        if self.failing_compile == Some(kind) {
            return Err(EngineError::ShaderCompile {
                program: kind,
                diagnostic: "injected compile failure".to_string(),
            });
        }
        for (stage, source, entry) in [("vertex", vertex, "fn vs_main"), ("fragment", fragment, "fn fs_main")] {
            if !source.contains(entry) {
                return Err(EngineError::ShaderCompile {
                    program: kind,
                    diagnostic: format!("{stage} stage has no `{entry}`"),
                });
            }
        }
        if self.failing_link == Some(kind) {
            return Err(EngineError::ProgramLink {
                program: kind,
                diagnostic: "injected link failure".to_string(),
            });
        }
        let handle = self.next_program;
        self.next_program += 1;
        self.programs.insert(handle, kind);
        Ok(ProgramHandle(handle))
    }

    fn release_program(&mut self, handle: ProgramHandle) {
        self.programs.remove(&handle.0);
    }

    fn draw(&mut self, pass: &Pass) -> Result<()> {
        if self.surface == SurfaceStatus::Lost {
            return Err(EngineError::SurfaceLost);
        }
        let kind = *self
            .programs
            .get(&pass.program.0)
            .ok_or(EngineError::InvalidState {
                operation: "draw",
                state: "program released",
            })?;
        if pass.reads_own_target() {
            return Err(EngineError::InvalidState {
                operation: "draw",
                state: "reading its own target",
            });
        }

        let (width, height, clamp_unit) = match pass.target {
            Target::Grid(id) => {
                let target = self.textures.get(&id.0).ok_or_else(|| missing_texture(id))?;
                (target.width, target.height, !target.format.is_signed())
            }
            Target::Screen => (self.width, self.height, true),
        };

        let t0 = self.input(pass.inputs[0])?;
        let t1 = self.input(pass.inputs[1])?;
        let mut output = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let uv = [(x as f32 + 0.5) / width as f32, (y as f32 + 0.5) / height as f32];
                let frag = Fragment::new(uv, &pass.uniforms, t0, t1);
                let mut color = shade(kind, &frag);
                if clamp_unit {
                    for c in color.iter_mut() {
                        *c = c.clamp(0.0, 1.0);
                    }
                }
                output.push(color);
            }
        }

        match pass.target {
            Target::Grid(id) => {
                if let Some(target) = self.textures.get_mut(&id.0) {
                    target.texels = output;
                }
            }
            Target::Screen => self.screen = output,
        }
        *self.draw_counts.entry(kind).or_insert(0) += 1;
        Ok(())
    }

    fn finish_frame(&mut self) -> Result<()> {
        if self.surface == SurfaceStatus::Lost {
            return Err(EngineError::SurfaceLost);
        }
        self.frames += 1;
        Ok(())
    }

    fn read_texels(&mut self, id: TextureId) -> Result<Vec<[f32; 4]>> {
        self.textures
            .get(&id.0)
            .map(|t| t.texels.clone())
            .ok_or_else(|| missing_texture(id))
    }
}

/// Varyings and inputs of one fragment invocation.
struct Fragment<'a> {
    uv: [f32; 2],
    l: [f32; 2],
    r: [f32; 2],
    t: [f32; 2],
    b: [f32; 2],
    u: &'a PassUniforms,
    t0: Option<&'a CpuTexture>,
    t1: Option<&'a CpuTexture>,
}

impl<'a> Fragment<'a> {
    fn new(uv: [f32; 2], u: &'a PassUniforms, t0: Option<&'a CpuTexture>, t1: Option<&'a CpuTexture>) -> Self {
        let [tx, ty] = u.texel_size;
        Self {
            uv,
            l: [uv[0] - tx, uv[1]],
            r: [uv[0] + tx, uv[1]],
            t: [uv[0], uv[1] + ty],
            b: [uv[0], uv[1] - ty],
            u,
            t0,
            t1,
        }
    }

    fn sample0(&self, uv: [f32; 2]) -> [f32; 4] {
        self.t0.map_or([0.0; 4], |t| t.sample(uv))
    }

    fn sample1(&self, uv: [f32; 2]) -> [f32; 4] {
        self.t1.map_or([0.0; 4], |t| t.sample(uv))
    }
}

fn shade(kind: ProgramKind, f: &Fragment) -> [f32; 4] {
    let u = f.u;
    match kind {
        ProgramKind::Clear => scale4(f.sample0(f.uv), u.value),
        ProgramKind::Splat => {
            let mut p = [f.uv[0] - u.point[0], f.uv[1] - u.point[1]];
            p[0] *= u.aspect_ratio;
            let falloff = (-(p[0] * p[0] + p[1] * p[1]) / u.radius).exp();
            let base = f.sample0(f.uv);
            [
                base[0] + falloff * u.color[0],
                base[1] + falloff * u.color[1],
                base[2] + falloff * u.color[2],
                1.0,
            ]
        }
        ProgramKind::Advection => {
            let ts = u.texel_size;
            let vel = bilerp(|uv| f.sample0(uv), f.uv, ts);
            let coord = [f.uv[0] - u.dt * vel[0] * ts[0], f.uv[1] - u.dt * vel[1] * ts[1]];
            let mut out = scale4(bilerp(|uv| f.sample1(uv), coord, u.dye_texel_size), u.dissipation);
            out[3] = 1.0;
            out
        }
        ProgramKind::Divergence => {
            let c = f.sample0(f.uv);
            let l = if f.l[0] < 0.0 { -c[0] } else { f.sample0(f.l)[0] };
            let r = if f.r[0] > 1.0 { -c[0] } else { f.sample0(f.r)[0] };
            let t = if f.t[1] > 1.0 { -c[1] } else { f.sample0(f.t)[1] };
            let b = if f.b[1] < 0.0 { -c[1] } else { f.sample0(f.b)[1] };
            [0.5 * (r - l + t - b), 0.0, 0.0, 1.0]
        }
        ProgramKind::Curl => {
            let l = f.sample0(f.l)[1];
            let r = f.sample0(f.r)[1];
            let t = f.sample0(f.t)[0];
            let b = f.sample0(f.b)[0];
            [0.5 * (r - l - t + b), 0.0, 0.0, 1.0]
        }
        ProgramKind::Vorticity => {
            let l = f.sample1(f.l)[0];
            let r = f.sample1(f.r)[0];
            let t = f.sample1(f.t)[0];
            let b = f.sample1(f.b)[0];
            let c = f.sample1(f.uv)[0];
            let mut force = [0.5 * (t.abs() - b.abs()), 0.5 * (r.abs() - l.abs())];
            let len = (force[0] * force[0] + force[1] * force[1]).sqrt() + 0.0001;
            force = [force[0] / len * u.curl * c, -(force[1] / len * u.curl * c)];
            let vel = f.sample0(f.uv);
            [vel[0] + force[0] * u.dt, vel[1] + force[1] * u.dt, 0.0, 1.0]
        }
        ProgramKind::Pressure => {
            let l = f.sample0(f.l)[0];
            let r = f.sample0(f.r)[0];
            let t = f.sample0(f.t)[0];
            let b = f.sample0(f.b)[0];
            let divergence = f.sample1(f.uv)[0];
            [(l + r + b + t - divergence) * 0.25, 0.0, 0.0, 1.0]
        }
        ProgramKind::GradientSubtract => {
            let l = f.sample0(f.l)[0];
            let r = f.sample0(f.r)[0];
            let t = f.sample0(f.t)[0];
            let b = f.sample0(f.b)[0];
            let vel = f.sample1(f.uv);
            [vel[0] - (r - l), vel[1] - (t - b), 0.0, 1.0]
        }
        ProgramKind::Display => {
            let fluid = f.sample1(f.uv);
            let uv = [
                f.uv[0] - fluid[0] * u.intensity,
                1.0 - (f.uv[1] - fluid[1] * u.intensity),
            ];
            f.sample0(uv)
        }
    }
}

/// Manual bilinear fetch between texel centres, as the advection shader does.
fn bilerp(sample: impl Fn([f32; 2]) -> [f32; 4], uv: [f32; 2], tsize: [f32; 2]) -> [f32; 4] {
    let st = [uv[0] / tsize[0] - 0.5, uv[1] / tsize[1] - 0.5];
    let iuv = [st[0].floor(), st[1].floor()];
    let fuv = [st[0] - iuv[0], st[1] - iuv[1]];
    let at = |dx: f32, dy: f32| sample([(iuv[0] + dx) * tsize[0], (iuv[1] + dy) * tsize[1]]);
    let a = at(0.5, 0.5);
    let b = at(1.5, 0.5);
    let c = at(0.5, 1.5);
    let d = at(1.5, 1.5);
    mix4(mix4(a, b, fuv[0]), mix4(c, d, fuv[0]), fuv[1])
}

fn mix4(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

fn scale4(v: [f32; 4], s: f32) -> [f32; 4] {
    [v[0] * s, v[1] * s, v[2] * s, v[3] * s]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{allocate, GridDescriptor};
    use crate::program::{Pass, Program, Sampler};

    fn grid(backend: &mut CpuBackend, size: u32, filter: FilterMode) -> TextureId {
        allocate(
            backend,
            GridDescriptor::square("t", size, TextureFormat::Rgba16Float, filter),
        )
        .unwrap()
        .id()
    }

    #[test]
    fn linear_sampling_hits_texel_centres_exactly() {
        let mut backend = CpuBackend::new(4, 4);
        let id = grid(&mut backend, 2, FilterMode::Linear);
        backend
            .write_texels(id, &[[1.0; 4], [2.0; 4], [3.0; 4], [4.0; 4]])
            .unwrap();
        let texture = &backend.textures[&id.0];
        assert_eq!(texture.sample([0.25, 0.25])[0], 1.0);
        assert_eq!(texture.sample([0.75, 0.75])[0], 4.0);
        assert!((texture.sample([0.5, 0.25])[0] - 1.5).abs() < 1e-6);
        // Clamp to edge outside the domain.
        assert_eq!(texture.sample([-0.5, 0.25])[0], 1.0);
    }

    #[test]
    fn nearest_sampling_does_not_blend() {
        let mut backend = CpuBackend::new(4, 4);
        let id = grid(&mut backend, 2, FilterMode::Nearest);
        backend
            .write_texels(id, &[[1.0; 4], [2.0; 4], [3.0; 4], [4.0; 4]])
            .unwrap();
        let texture = &backend.textures[&id.0];
        assert_eq!(texture.sample([0.49, 0.1])[0], 1.0);
        assert_eq!(texture.sample([0.51, 0.1])[0], 2.0);
    }

    #[test]
    fn clear_pass_scales_every_texel() {
        let mut backend = CpuBackend::new(4, 4);
        let program = Program::compile(&mut backend, ProgramKind::Clear).unwrap();
        let src = grid(&mut backend, 2, FilterMode::Nearest);
        let dst = grid(&mut backend, 2, FilterMode::Nearest);
        backend.write_texels(src, &[[2.0, 4.0, 0.0, 1.0]; 4]).unwrap();
        let pass = Pass::new(&program, Target::Grid(dst))
            .bind(Sampler::Texture, src)
            .uniforms(PassUniforms {
                value: 0.5,
                ..PassUniforms::default()
            })
            .build();
        backend.draw(&pass).unwrap();
        let out = backend.read_texels(dst).unwrap();
        assert!(out.iter().all(|t| t[0] == 1.0 && t[1] == 2.0));
        assert_eq!(backend.draw_count(ProgramKind::Clear), 1);
    }

    #[test]
    fn unorm_targets_clamp_negative_values() {
        let mut backend = CpuBackend::new(4, 4).without_half_float();
        assert!(!backend.supports_half_float());
        let program = Program::compile(&mut backend, ProgramKind::Clear).unwrap();
        let desc = GridDescriptor::square("u", 2, TextureFormat::Rgba8Unorm, FilterMode::Nearest);
        let src = allocate(&mut backend, desc).unwrap().id();
        let dst = allocate(&mut backend, desc).unwrap().id();
        backend.write_texels(src, &[[0.5, -0.5, 2.0, 1.0]; 4]).unwrap();
        let pass = Pass::new(&program, Target::Grid(dst))
            .bind(Sampler::Texture, src)
            .uniforms(PassUniforms {
                value: 1.0,
                ..PassUniforms::default()
            })
            .build();
        backend.draw(&pass).unwrap();
        assert_eq!(backend.read_texels(dst).unwrap()[0], [0.5, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn lost_surface_rejects_draws() {
        let mut backend = CpuBackend::new(4, 4);
        let program = Program::compile(&mut backend, ProgramKind::Clear).unwrap();
        let dst = grid(&mut backend, 2, FilterMode::Nearest);
        backend.lose_surface();
        let pass = Pass::new(&program, Target::Grid(dst)).build();
        assert!(matches!(backend.draw(&pass), Err(EngineError::SurfaceLost)));
        assert!(matches!(backend.finish_frame(), Err(EngineError::SurfaceLost)));
        assert_eq!(backend.total_draws(), 0);
    }

    #[test]
    fn injected_failures_surface_as_typed_errors() {
        let mut backend = CpuBackend::new(4, 4);
        backend.fail_compile(ProgramKind::Curl);
        backend.fail_link(ProgramKind::Display);
        assert!(matches!(
            Program::compile(&mut backend, ProgramKind::Curl),
            Err(EngineError::ShaderCompile { program: ProgramKind::Curl, .. })
        ));
        assert!(matches!(
            Program::compile(&mut backend, ProgramKind::Display),
            Err(EngineError::ProgramLink { program: ProgramKind::Display, .. })
        ));
        assert!(Program::compile(&mut backend, ProgramKind::Splat).is_ok());
    }
}
