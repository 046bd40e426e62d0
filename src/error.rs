use crate::grid::TextureFormat;
use crate::program::ProgramKind;

/// Everything that can go wrong inside one engine instance.
///
/// None of these ever escape as a panic: the host sees a `Result`, the engine
/// logs the failure and goes inert when the kind is fatal.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no GPU drawing context available: {0}")]
    ContextUnavailable(String),

    #[error("shader compile failed for {program:?} program: {diagnostic}")]
    ShaderCompile {
        program: ProgramKind,
        diagnostic: String,
    },

    #[error("program link failed for {program:?} program: {diagnostic}")]
    ProgramLink {
        program: ProgramKind,
        diagnostic: String,
    },

    #[error("could not allocate {width}x{height} {format:?} grid: {reason}")]
    Allocation {
        width: u32,
        height: u32,
        format: TextureFormat,
        reason: String,
    },

    #[error("rendering surface lost")]
    SurfaceLost,

    #[error("source image still loading")]
    AssetLoadPending,

    #[error("source image failed to load: {0}")]
    AssetLoadFailed(String),

    #[error("{operation} not allowed while engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Fatal errors leave the engine inert for the rest of its life.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ContextUnavailable(_)
                | EngineError::ShaderCompile { .. }
                | EngineError::ProgramLink { .. }
                | EngineError::Allocation { .. }
        )
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::SurfaceLost)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_follows_error_kind() {
        assert!(EngineError::ContextUnavailable("none".into()).is_fatal());
        assert!(EngineError::ShaderCompile {
            program: ProgramKind::Curl,
            diagnostic: "bad".into()
        }
        .is_fatal());
        assert!(!EngineError::SurfaceLost.is_fatal());
        assert!(EngineError::SurfaceLost.is_recoverable());
        assert!(!EngineError::AssetLoadFailed("404".into()).is_fatal());
        assert!(!EngineError::AssetLoadPending.is_fatal());
    }

    #[test]
    fn messages_carry_diagnostics() {
        let err = EngineError::ProgramLink {
            program: ProgramKind::Display,
            diagnostic: "entry point missing".into(),
        };
        let text = err.to_string();
        assert!(text.contains("Display"));
        assert!(text.contains("entry point missing"));
    }
}
