//! Crate-wide error type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Recorder error: {0}")]
    Recorder(String),

    #[error("Config error: {0}")]
    Config(String),

    /// A constructor argument violates a documented requirement.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Unsupported image input: {0}")]
    UnsupportedImage(String),

    #[error("Unknown objective `{0}` (expected pred_noise, pred_x0 or pred_v)")]
    UnknownObjective(String),

    #[error("Unknown beta schedule `{0}` (expected linear, cosine or sigmoid)")]
    UnknownSchedule(String),

    #[error("No noise artifact for `{stem}` at {}", path.display())]
    MissingNoise { stem: String, path: PathBuf },

    #[error("Noise artifact {} has shape {actual:?}, expected {expected:?}", path.display())]
    NoiseShape {
        path: PathBuf,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Height and width of image must be {expected}, got {height}x{width}")]
    ImageSize {
        expected: usize,
        height: usize,
        width: usize,
    },

    #[error("Tensor data error: {0}")]
    TensorData(String),

    #[error("Data loader stopped: {0}")]
    Loader(String),
}

impl From<burn::record::RecorderError> for Error {
    fn from(err: burn::record::RecorderError) -> Self {
        Error::Recorder(format!("{err:?}"))
    }
}

impl From<burn::config::ConfigError> for Error {
    fn from(err: burn::config::ConfigError) -> Self {
        Error::Config(format!("{err:?}"))
    }
}

impl From<burn::tensor::DataError> for Error {
    fn from(err: burn::tensor::DataError) -> Self {
        Error::TensorData(format!("{err:?}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
