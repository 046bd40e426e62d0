//! Real-time fluid distortion of a still image.
//!
//! An [`Engine`] runs a small incompressible fluid solver on GPU grids and
//! draws its source image resampled through the resulting dye field. Pointer
//! and touch movement, fed through an [`InputAggregator`], stirs the fluid.

pub mod asset;
pub mod backend;
pub mod compositor;
pub mod config;
pub mod engine;
pub mod error;
pub mod grid;
pub mod input;
pub mod program;
pub mod solver;

pub use asset::{AssetSender, AssetStatus, ImageSource, PendingAsset, SourceImage};
pub use backend::cpu::CpuBackend;
pub use backend::gpu::GpuBackend;
pub use backend::{RenderBackend, SurfaceStatus};
pub use config::SimulationParameters;
pub use engine::{Engine, FrameOutcome, SessionState};
pub use error::{EngineError, Result};
pub use input::{InputAggregator, Splat, SplatQueue, SurfaceRect};
pub use solver::Field;
