use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("layer not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("layer {} has no column `{column}`", path.display())]
    Schema { path: PathBuf, column: String },
    #[error("raw samples need at least 4 channels, got {found}")]
    ChannelCount { found: usize },
    #[error("malformed layer {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },
    #[error("failed to decode wav {}: {source}", path.display())]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
}

impl LayerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            LayerError::NotFound(path)
        } else {
            LayerError::Io { path, source }
        }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        LayerError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("merge scale must be finite and greater than zero, got {0}")]
    InvalidScale(f32),
}

/// Failures while building the GPU program. The message is the wgpu
/// validation text, unmodified.
#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("shader compilation failed:\n{0}")]
    Compile(String),
    #[error("pipeline link failed:\n{0}")]
    Link(String),
    #[error("render engine is in state {0:?}, cannot initialize")]
    InvalidState(crate::render::EngineState),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("no layers to load")]
    Empty,
    #[error("load worker exited without a result")]
    WorkerLost,
}
