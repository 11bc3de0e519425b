//! Error types for GPT-2 inference.

use gpt2_weights::WeightsError;
use thiserror::Error;

/// Result type alias for inference operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading or running the model.
#[derive(Error, Debug)]
pub enum Error {
    /// No usable GPU compute capability.
    #[error("GPU device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A GPU dispatch failed after the device was acquired.
    #[error("GPU dispatch failed: {0}")]
    Dispatch(String),

    /// Matrix shapes violate an operation's contract.
    #[error("dimension mismatch in {op}: {left:?} vs {right:?}")]
    DimensionMismatch {
        op: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },

    /// Raw weight stream length does not match the fixed layout.
    #[error("corrupt weight stream: expected {expected} floats, got {actual}")]
    CorruptWeightStream { expected: usize, actual: usize },

    /// Invalid model or runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tokenizer data or lookup failure.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Download or cache failure.
    #[error(transparent)]
    Weights(#[from] WeightsError),
}
