use fluid_image::program::ProgramKind;
use fluid_image::solver::Fields;
use fluid_image::{
    CpuBackend, Engine, EngineError, Field, FrameOutcome, PendingAsset, RenderBackend, SessionState,
    SimulationParameters, SourceImage, Splat,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const PROGRAMS: usize = ProgramKind::ALL.len();

fn small() -> SimulationParameters {
    SimulationParameters {
        sim_resolution: 8,
        dye_resolution: 16,
        splat_radius: 0.01,
        ..SimulationParameters::default()
    }
}

fn image() -> SourceImage {
    SourceImage::solid(4, 4, [200, 100, 50, 255])
}

fn start(backend: CpuBackend, params: SimulationParameters) -> Engine<CpuBackend> {
    let mut engine = Engine::new(backend, params, PendingAsset::ready(image()));
    engine.init().expect("init");
    engine
}

fn splat(x: f32, y: f32, vx: f32, vy: f32) -> Splat {
    Splat {
        position: [x, y],
        velocity: [vx, vy],
    }
}

fn max_abs_rgb(texels: &[[f32; 4]]) -> f32 {
    texels
        .iter()
        .flat_map(|t| t[..3].iter().copied())
        .fold(0.0f32, |m, v| m.max(v.abs()))
}

#[test]
fn every_queued_splat_is_applied_once() {
    let mut engine = start(CpuBackend::new(8, 8), small());
    let queue = engine.splat_queue();
    queue.push(splat(0.2, 0.2, 1.0, 0.0));
    queue.push(splat(0.5, 0.5, 0.0, 1.0));
    queue.push(splat(0.8, 0.8, -1.0, 0.0));

    assert_eq!(engine.step().unwrap(), FrameOutcome::Rendered);
    assert!(queue.is_empty());
    // One draw into velocity and one into dye per splat.
    assert_eq!(engine.backend().draw_count(ProgramKind::Splat), 6);

    engine.step().unwrap();
    assert_eq!(engine.backend().draw_count(ProgramKind::Splat), 6);
}

#[test]
fn still_fluid_stays_divergence_free() {
    let mut engine = start(CpuBackend::new(8, 8), small());
    for _ in 0..5 {
        engine.step().unwrap();
    }
    let divergence = engine.read_field(Field::Divergence).unwrap();
    assert!(divergence.iter().all(|t| t[0].abs() < 1e-6));
}

#[test]
fn no_input_leaves_fields_at_zero() {
    let mut engine = start(CpuBackend::new(8, 8), small());
    for _ in 0..10 {
        engine.step().unwrap();
    }
    let velocity = engine.read_field(Field::Velocity).unwrap();
    assert!(velocity.iter().all(|t| t[0] == 0.0 && t[1] == 0.0));
    let dye = engine.read_field(Field::Dye).unwrap();
    assert_eq!(max_abs_rgb(&dye), 0.0);
    assert_eq!(engine.frame_count(), 10);
}

#[test]
fn centred_splat_pushes_right_and_spares_the_corners() {
    let params = SimulationParameters {
        sim_resolution: 4,
        dye_resolution: 4,
        splat_radius: 0.02,
        ..SimulationParameters::default()
    };
    let mut engine = start(CpuBackend::new(4, 4), params);
    engine.splat_queue().push(splat(0.5, 0.5, 1.0, 0.0));
    engine.step().unwrap();

    let velocity = engine.read_field(Field::Velocity).unwrap();
    let vx = |x: usize, y: usize| velocity[y * 4 + x][0];
    let centre = [vx(1, 1), vx(2, 1), vx(1, 2), vx(2, 2)];
    let centre_mean = centre.iter().sum::<f32>() / 4.0;
    assert!(centre.iter().all(|v| *v > 0.0), "{centre:?}");
    assert!(centre_mean > 0.05, "{centre_mean}");

    for corner in [vx(0, 0), vx(3, 0), vx(0, 3), vx(3, 3)] {
        assert!(corner.abs() < 0.01, "{corner}");
        assert!(corner.abs() < 0.1 * centre_mean);
    }
}

#[test]
fn dye_decays_without_new_splats() {
    let mut engine = start(CpuBackend::new(8, 8), small());
    let queue = engine.splat_queue();
    queue.push(splat(0.3, 0.6, 4.0, -2.0));
    queue.push(splat(0.6, 0.4, -3.0, 1.0));
    engine.step().unwrap();

    let mut previous = max_abs_rgb(&engine.read_field(Field::Dye).unwrap());
    let first = previous;
    assert!(first > 0.0);
    for _ in 0..30 {
        engine.step().unwrap();
        let current = max_abs_rgb(&engine.read_field(Field::Dye).unwrap());
        assert!(current <= previous * (1.0 + 1e-5), "{current} > {previous}");
        previous = current;
    }
    assert!(previous < 0.5 * first);
}

#[test]
fn resize_rebuilds_without_leaking() {
    let mut engine = start(CpuBackend::new(8, 8), small());
    let after_init = engine.backend().live_textures();
    assert_eq!(after_init, Fields::TEXTURE_COUNT);

    engine.step().unwrap();
    assert_eq!(engine.backend().live_textures(), after_init + 1);

    engine.resize(16, 12).unwrap();
    assert_eq!(engine.state(), SessionState::Running);
    assert_eq!(engine.backend().surface_size(), (16, 12));
    assert_eq!(engine.backend().live_textures(), after_init);
    assert_eq!(engine.backend().live_programs(), PROGRAMS);

    assert_eq!(engine.step().unwrap(), FrameOutcome::Rendered);
    assert_eq!(engine.backend().screen().len(), 16 * 12);

    engine.dispose();
    assert_eq!(engine.backend().live_textures(), 0);
    assert_eq!(engine.backend().live_programs(), 0);
}

#[test]
fn loading_image_keeps_the_display_pass_idle() {
    let (sender, asset) = PendingAsset::channel();
    let mut engine = Engine::new(CpuBackend::new(8, 8), small(), asset);
    engine.init().unwrap();
    let queue = engine.splat_queue();
    queue.push(splat(0.5, 0.5, 1.0, 1.0));

    for _ in 0..5 {
        assert_eq!(engine.step().unwrap(), FrameOutcome::AwaitingAsset);
    }
    assert_eq!(engine.backend().draw_count(ProgramKind::Display), 0);
    assert_eq!(engine.backend().total_draws(), 0);
    assert_eq!(queue.len(), 1);
    assert!(matches!(engine.source_image(), Err(EngineError::AssetLoadPending)));

    sender.complete(image());
    assert_eq!(engine.step().unwrap(), FrameOutcome::Rendered);
    assert_eq!(engine.backend().draw_count(ProgramKind::Display), 1);
    assert!(queue.is_empty());
    assert!(engine.source_image().is_ok());
}

#[test]
fn failed_image_never_composites() {
    let (sender, asset) = PendingAsset::channel();
    let mut engine = Engine::new(CpuBackend::new(8, 8), small(), asset);
    engine.init().unwrap();
    sender.fail("404 not found");

    let queue = engine.splat_queue();
    for _ in 0..3 {
        queue.push(splat(0.5, 0.5, 1.0, 0.0));
        assert_eq!(engine.step().unwrap(), FrameOutcome::AssetUnavailable);
    }
    assert_eq!(engine.backend().total_draws(), 0);
    assert!(queue.is_empty());
    assert_eq!(engine.state(), SessionState::Running);
    assert!(matches!(engine.source_image(), Err(EngineError::AssetLoadFailed(reason)) if reason.contains("404")));
}

#[test]
fn shader_compile_failure_leaves_engine_inert() {
    let mut backend = CpuBackend::new(8, 8);
    backend.fail_compile(ProgramKind::Vorticity);
    let mut engine = Engine::new(backend, small(), PendingAsset::ready(image()));

    let err = engine.init().unwrap_err();
    assert!(matches!(err, EngineError::ShaderCompile { program: ProgramKind::Vorticity, .. }));
    assert!(err.is_fatal());
    assert_eq!(engine.state(), SessionState::Inert);
    assert_eq!(engine.backend().live_programs(), 0);
    assert_eq!(engine.backend().live_textures(), 0);
    assert_eq!(engine.step().unwrap(), FrameOutcome::Suspended);
    assert!(engine.resize(4, 4).is_err());
}

#[test]
fn link_failure_leaves_engine_inert() {
    let mut backend = CpuBackend::new(8, 8);
    backend.fail_link(ProgramKind::Display);
    let mut engine = Engine::new(backend, small(), PendingAsset::ready(image()));

    assert!(matches!(
        engine.init(),
        Err(EngineError::ProgramLink { program: ProgramKind::Display, .. })
    ));
    assert_eq!(engine.state(), SessionState::Inert);
    assert_eq!(engine.backend().live_programs(), 0);
}

#[test]
fn allocation_failure_releases_partial_grids() {
    let mut backend = CpuBackend::new(8, 8);
    backend.fail_allocations_after(3);
    let mut engine = Engine::new(backend, small(), PendingAsset::ready(image()));

    assert!(matches!(engine.init(), Err(EngineError::Allocation { .. })));
    assert_eq!(engine.state(), SessionState::Inert);
    assert_eq!(engine.backend().live_textures(), 0);
    assert_eq!(engine.backend().live_programs(), 0);
}

#[test]
fn lost_context_at_start_is_fatal() {
    let mut backend = CpuBackend::new(8, 8);
    backend.lose_surface();
    let mut engine = Engine::new(backend, small(), PendingAsset::ready(image()));
    assert!(matches!(engine.init(), Err(EngineError::ContextUnavailable(_))));
    assert_eq!(engine.state(), SessionState::Inert);
}

#[test]
fn surface_loss_suspends_until_restored() {
    let mut engine = start(CpuBackend::new(8, 8), small());
    assert_eq!(engine.step().unwrap(), FrameOutcome::Rendered);

    engine.backend_mut().lose_surface();
    engine.splat_queue().push(splat(0.5, 0.5, 1.0, 0.0));
    assert_eq!(engine.step().unwrap(), FrameOutcome::Suspended);
    assert_eq!(engine.state(), SessionState::SurfaceLost);
    assert_eq!(engine.backend().live_textures(), 0);
    assert_eq!(engine.step().unwrap(), FrameOutcome::Suspended);

    assert!(matches!(engine.restore(), Err(EngineError::SurfaceLost)));
    assert_eq!(engine.state(), SessionState::SurfaceLost);

    engine.backend_mut().restore_surface();
    engine.restore().unwrap();
    assert_eq!(engine.state(), SessionState::Running);
    assert_eq!(engine.step().unwrap(), FrameOutcome::Rendered);
    assert_eq!(engine.backend().live_textures(), Fields::TEXTURE_COUNT + 1);

    // Fresh grids: the splat queued before the loss is the only motion.
    assert!(engine.splat_queue().is_empty());
    let velocity = engine.read_field(Field::Velocity).unwrap();
    assert!(velocity.iter().any(|t| t[0] > 0.0));
}

#[test]
fn splat_order_within_a_frame_does_not_matter() {
    let mut rng = StdRng::seed_from_u64(7);
    let splats: Vec<Splat> = (0..6)
        .map(|_| {
            splat(
                rng.gen(),
                rng.gen(),
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
            )
        })
        .collect();
    let mut shuffled = splats.clone();
    shuffled.shuffle(&mut rng);

    let mut a = start(CpuBackend::new(8, 8), small());
    let mut b = start(CpuBackend::new(8, 8), small());
    for s in &splats {
        a.splat_queue().push(*s);
    }
    for s in &shuffled {
        b.splat_queue().push(*s);
    }
    a.step().unwrap();
    b.step().unwrap();

    for field in [Field::Velocity, Field::Dye, Field::Pressure] {
        let fa = a.read_field(field).unwrap();
        let fb = b.read_field(field).unwrap();
        for (ta, tb) in fa.iter().zip(&fb) {
            for c in 0..4 {
                assert!((ta[c] - tb[c]).abs() < 1e-4, "{field:?}: {ta:?} vs {tb:?}");
            }
        }
    }
}

#[test]
fn falls_back_to_unorm_grids_without_half_floats() {
    let mut engine = start(CpuBackend::new(8, 8).without_half_float(), small());
    assert_eq!(engine.format(), fluid_image::grid::TextureFormat::Rgba8Unorm);
    engine.splat_queue().push(splat(0.5, 0.5, -1.0, 1.0));
    assert_eq!(engine.step().unwrap(), FrameOutcome::Rendered);

    // Unsigned storage cannot hold the leftward push.
    let velocity = engine.read_field(Field::Velocity).unwrap();
    assert!(velocity.iter().all(|t| t[0] >= 0.0 && t[0] <= 1.0));
}

#[test]
fn disposed_engine_rejects_further_use() {
    let mut engine = start(CpuBackend::new(8, 8), small());
    engine.step().unwrap();
    engine.dispose();
    assert_eq!(engine.state(), SessionState::Disposed);
    assert!(matches!(engine.read_field(Field::Dye), Err(EngineError::InvalidState { .. })));
    assert!(engine.init().is_err());
}
