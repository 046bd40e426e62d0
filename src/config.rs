use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Screen pixels to simulation velocity.
pub const DEFAULT_SPLAT_FORCE: f32 = 5.0;
/// One nominal 60 Hz frame. The solver never looks at wall-clock time.
pub const DEFAULT_TIME_STEP: f32 = 0.016;

/// Per-session solver configuration. Fixed once the engine is built; a new
/// set only takes effect through a full reinitialisation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationParameters {
    pub sim_resolution: u32,
    pub dye_resolution: u32,
    pub pressure_iterations: u32,
    pub density_dissipation: f32,
    pub velocity_dissipation: f32,
    pub pressure_dissipation: f32,
    pub curl_strength: f32,
    /// Gaussian falloff denominator of a splat, in normalised units squared.
    pub splat_radius: f32,
    /// How far the dye field pushes image UVs on screen.
    pub fluid_intensity: f32,
    pub splat_force: f32,
    pub time_step: f32,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            sim_resolution: 128,
            dye_resolution: 512,
            pressure_iterations: 4,
            density_dissipation: 0.97,
            velocity_dissipation: 0.98,
            pressure_dissipation: 0.8,
            curl_strength: 20.0,
            splat_radius: 0.0003,
            fluid_intensity: 0.0003,
            splat_force: DEFAULT_SPLAT_FORCE,
            time_step: DEFAULT_TIME_STEP,
        }
    }
}

impl SimulationParameters {
    /// Large hero images: keep the distortion subtle.
    pub fn hero() -> Self {
        Self {
            splat_radius: 0.0003,
            fluid_intensity: 0.0003,
            ..Self::default()
        }
    }

    /// Small decorative thumbnails need a wider, stronger splat to be visible.
    pub fn thumbnail() -> Self {
        Self {
            splat_radius: 0.003,
            fluid_intensity: 0.004,
            ..Self::default()
        }
    }

    pub fn with_intensity(mut self, fluid_intensity: f32) -> Self {
        self.fluid_intensity = fluid_intensity;
        self
    }

    pub fn with_cursor_radius(mut self, splat_radius: f32) -> Self {
        self.splat_radius = splat_radius;
        self
    }

    pub fn load_from_disk(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut params: Self = serde_json::from_str(&data)?;
        params.sanitize();
        Ok(params)
    }

    pub fn save_to_disk(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.sim_resolution = self.sim_resolution.clamp(1, 2048);
        self.dye_resolution = self.dye_resolution.clamp(1, 4096);
        self.pressure_iterations = self.pressure_iterations.clamp(1, 256);
        self.density_dissipation = sanitize_unit(self.density_dissipation, 0.97);
        self.velocity_dissipation = sanitize_unit(self.velocity_dissipation, 0.98);
        self.pressure_dissipation = sanitize_unit(self.pressure_dissipation, 0.8);
        self.curl_strength = finite_or(self.curl_strength, 20.0).clamp(0.0, 100.0);
        self.splat_radius = finite_or(self.splat_radius, 0.0003).clamp(1e-6, 1.0);
        self.fluid_intensity = finite_or(self.fluid_intensity, 0.0003).clamp(0.0, 1.0);
        self.splat_force = finite_or(self.splat_force, DEFAULT_SPLAT_FORCE).clamp(0.0, 1000.0);
        self.time_step = finite_or(self.time_step, DEFAULT_TIME_STEP).clamp(1e-4, 0.1);
    }

    pub fn sim_texel_size(&self) -> [f32; 2] {
        let inv = 1.0 / self.sim_resolution.max(1) as f32;
        [inv, inv]
    }

    pub fn dye_texel_size(&self) -> [f32; 2] {
        let inv = 1.0 / self.dye_resolution.max(1) as f32;
        [inv, inv]
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

fn sanitize_unit(value: f32, fallback: f32) -> f32 {
    finite_or(value, fallback).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fluid_image_constants() {
        let p = SimulationParameters::default();
        assert_eq!(p.sim_resolution, 128);
        assert_eq!(p.dye_resolution, 512);
        assert_eq!(p.pressure_iterations, 4);
        assert!((p.pressure_dissipation - 0.8).abs() < 1e-6);
        assert!((p.time_step - 0.016).abs() < 1e-6);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut p = SimulationParameters {
            sim_resolution: 0,
            pressure_iterations: 0,
            density_dissipation: 4.0,
            velocity_dissipation: f32::NAN,
            splat_radius: -1.0,
            ..SimulationParameters::default()
        };
        p.sanitize();
        assert_eq!(p.sim_resolution, 1);
        assert_eq!(p.pressure_iterations, 1);
        assert_eq!(p.density_dissipation, 1.0);
        assert!((p.velocity_dissipation - 0.98).abs() < 1e-6);
        assert!(p.splat_radius > 0.0);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let p: SimulationParameters =
            serde_json::from_str(r#"{ "sim_resolution": 64, "curl_strength": 5.0 }"#).unwrap();
        assert_eq!(p.sim_resolution, 64);
        assert_eq!(p.curl_strength, 5.0);
        assert_eq!(p.dye_resolution, 512);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = std::env::temp_dir().join(format!("fluid_image_cfg_{}", std::process::id()));
        let path = dir.join("params.json");
        let params = SimulationParameters::thumbnail().with_intensity(0.002);
        params.save_to_disk(&path).unwrap();
        let loaded = SimulationParameters::load_from_disk(&path).unwrap();
        assert_eq!(loaded, params);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn presets_scale_with_image_size() {
        let hero = SimulationParameters::hero();
        let thumb = SimulationParameters::thumbnail();
        assert!(thumb.fluid_intensity > hero.fluid_intensity);
        assert!(thumb.splat_radius > hero.splat_radius);
    }
}
