//! Error types for vision-mamba.

/// Errors raised while building, running or loading a [`VisionMamba`](crate::VisionMamba).
#[derive(Debug, thiserror::Error)]
pub enum VimError {
    /// A tensor does not have the shape an operation requires.
    #[error("shape error: {0}")]
    Shape(String),

    /// Invalid model configuration, detected at construction.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed or unsupported checkpoint file.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Inference cache misuse (batch mismatch or exhausted sequence budget).
    #[error("cache error: {0}")]
    Cache(String),

    /// Invalid nucleotide input or EOS index.
    #[error("dna error: {0}")]
    Dna(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<safetensors::SafeTensorError> for VimError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        VimError::Checkpoint(e.to_string())
    }
}

/// Result type alias for vision-mamba operations.
pub type Result<T> = std::result::Result<T, VimError>;
