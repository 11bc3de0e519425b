//! Error type for weight transport and persistence.

use thiserror::Error;

/// Result type alias for weight operations.
pub type Result<T> = std::result::Result<T, WeightsError>;

/// Errors raised while fetching, decoding or persisting weight blobs.
#[derive(Error, Debug)]
pub enum WeightsError {
    /// Non-success HTTP status or a failed read while streaming the body.
    #[error("network failure: {0}")]
    Network(String),

    /// The local store holds no entry.
    #[error("no cached weights found")]
    CacheMiss,

    /// The local store holds an entry that could not be read.
    #[error("failed to read cached weights: {0}")]
    CacheRead(String),

    /// Persisting the weights failed.
    #[error("failed to write cached weights: {0}")]
    CacheWrite(String),

    /// Byte payload cannot be reinterpreted as 32-bit floats.
    #[error("payload of {len} bytes is not a whole number of f32 values")]
    MisalignedPayload { len: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
