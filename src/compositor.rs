//! Final pass: the source image, resampled through the dye field.

use crate::backend::RenderBackend;
use crate::config::SimulationParameters;
use crate::error::Result;
use crate::grid::TextureId;
use crate::program::{Pass, PassUniforms, Program, Sampler, Target};

/// Draws `image` to the screen, each pixel looking up the image at its own
/// UV pushed back by the dye's red/green channels times `fluid_intensity`.
pub fn composite<B: RenderBackend + ?Sized>(
    backend: &mut B,
    display: &Program,
    image: TextureId,
    dye: TextureId,
    params: &SimulationParameters,
) -> Result<()> {
    let pass = Pass::new(display, Target::Screen)
        .bind(Sampler::Texture, image)
        .bind(Sampler::Fluid, dye)
        .uniforms(PassUniforms {
            intensity: params.fluid_intensity,
            ..PassUniforms::default()
        })
        .build();
    backend.draw(&pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::SourceImage;
    use crate::backend::cpu::CpuBackend;
    use crate::grid::{allocate, FilterMode, GridDescriptor, TextureFormat};
    use crate::program::ProgramKind;

    /// 2x2 image, top row red/green, bottom row blue/white.
    fn quad() -> SourceImage {
        SourceImage::new(
            2,
            2,
            vec![
                255, 0, 0, 255, 0, 255, 0, 255, //
                0, 0, 255, 255, 255, 255, 255, 255,
            ],
        )
        .unwrap()
    }

    #[test]
    fn still_dye_shows_the_image_upright() {
        let mut backend = CpuBackend::new(2, 2);
        let display = Program::compile(&mut backend, ProgramKind::Display).unwrap();
        let image = backend.upload_image(&quad()).unwrap();
        let dye = allocate(
            &mut backend,
            GridDescriptor::square("dye", 2, TextureFormat::Rgba16Float, FilterMode::Linear),
        )
        .unwrap()
        .id();

        composite(&mut backend, &display, image, dye, &SimulationParameters::default()).unwrap();

        // Screen row 0 is the bottom edge: blue, white.
        let screen = backend.screen();
        assert_eq!(screen[0], [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(screen[1], [1.0, 1.0, 1.0, 1.0]);
        assert_eq!(screen[2], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(screen[3], [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(backend.draw_count(ProgramKind::Display), 1);
    }

    #[test]
    fn dye_displaces_the_lookup() {
        let mut backend = CpuBackend::new(2, 2);
        let display = Program::compile(&mut backend, ProgramKind::Display).unwrap();
        let image = backend.upload_image(&quad()).unwrap();
        let dye = allocate(
            &mut backend,
            GridDescriptor::square("dye", 2, TextureFormat::Rgba16Float, FilterMode::Linear),
        )
        .unwrap()
        .id();
        // Push every lookup half a screen to the left.
        backend.write_texels(dye, &[[-0.5, 0.0, 1.0, 1.0]; 4]).unwrap();
        let params = SimulationParameters::default().with_intensity(1.0);

        composite(&mut backend, &display, image, dye, &params).unwrap();

        // The bottom-left pixel now samples the bottom-right texel.
        assert_eq!(backend.screen()[0], [1.0, 1.0, 1.0, 1.0]);
    }
}
