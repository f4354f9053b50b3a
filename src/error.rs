//! Error types for vq-voice-swap.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Schedule name not recognized by the factory.
    #[error("unknown schedule: {0}")]
    UnknownSchedule(String),

    /// Encoder name not recognized by the factory.
    #[error("unknown encoder: {0}")]
    UnknownEncoder(String),

    /// Predictor name not recognized by the factory.
    #[error("unknown predictor: {0}")]
    UnknownPredictor(String),

    /// Invalid or unsupported configuration.
    #[error("config: {0}")]
    Config(String),

    /// Tensor shape does not satisfy a call-boundary contract.
    #[error("shape: {0}")]
    Shape(String),

    /// A latent code outside the codebook was passed to `embed`.
    #[error("code index {index} out of range for codebook of size {codebook_size}")]
    CodeOutOfRange { index: u32, codebook_size: usize },

    /// Checkpoint label count disagrees with the caller's configuration.
    #[error("label count mismatch: expected {expected}, checkpoint has {found}")]
    LabelMismatch { expected: usize, found: usize },

    /// Malformed or incomplete checkpoint.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// safetensors (de)serialization error.
    #[error("safetensors: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// Audio processing error (WAV I/O).
    #[error("audio: {0}")]
    Audio(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}
