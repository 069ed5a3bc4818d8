use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = DdpmError> = core::result::Result<T, E>;

/// Errors raised by the training stack.
#[derive(Error, Debug)]
pub enum DdpmError {
    /// Unsupported or inconsistent configuration value. Fatal before training starts.
    #[error("invalid configuration for `{field}`: {message}")]
    Config {
        /// Name of the offending option.
        field: &'static str,
        /// Human readable reason, including the rejected value.
        message: String,
    },

    /// A checkpoint could not be restored.
    #[error("cannot resume from checkpoint `{checkpoint}`: {reason}")]
    Resume {
        /// Checkpoint identifier as given by the user or found on disk.
        checkpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// EMA store/copy/restore called out of order.
    #[error("EMA swap protocol violated: {0}")]
    EmaProtocol(&'static str),

    /// Shape or index errors on tensors handed to the diffusion process.
    #[error("tensor error: {0}")]
    Tensor(String),

    /// Dataset could not be read or decoded.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Experiment tracker failure.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// Safetensors snapshot failure.
    #[error("snapshot store error: {0}")]
    Store(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Burn record (de)serialization errors.
    #[error("record error: {0}")]
    Record(#[from] burn::record::RecorderError),

    /// Image decode/encode errors.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl DdpmError {
    /// Shorthand for a configuration error.
    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }
}
