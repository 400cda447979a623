//! Error types for weight persistence and sample ingestion
//!
//! Contract violations inside the cost model (too many stages, non-positive
//! runtimes, NaN predictions) are not represented here: they indicate a bug in
//! the caller or in feature extraction and abort with a diagnostic instead.
//! Everything in this module is recoverable, so callers can chain fallbacks
//! (binary file, then legacy directory, then random weights).

use std::path::PathBuf;
use thiserror::Error;

use crate::network::WeightId;

/// Errors that can occur while reading or writing model weights
#[derive(Error, Debug)]
pub enum WeightsError {
    /// The stream does not start with the weights magic number
    #[error("Bad magic number: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    /// The file holds a different number of tensors than the architecture
    #[error("Wrong tensor count: expected {expected}, found {found}")]
    TensorCount { expected: u32, found: u32 },

    /// A tensor's rank disagrees with the architecture
    #[error("Tensor {tensor}: expected {expected} dimensions, found {found}")]
    DimensionCount {
        tensor: WeightId,
        expected: usize,
        found: usize,
    },

    /// A tensor's extent disagrees with the architecture
    #[error("Tensor {tensor}: dimension {dim} should have extent {expected}, found {found}")]
    Extent {
        tensor: WeightId,
        dim: usize,
        expected: usize,
        found: usize,
    },

    /// A headerless tensor dump has the wrong size
    #[error("{}: expected {expected} bytes, found {found}", .path.display())]
    ByteLength {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    /// I/O error when reading/writing files (includes short reads)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Allow WeightsError to be converted to String for CLI plumbing
impl From<WeightsError> for String {
    fn from(err: WeightsError) -> Self {
        err.to_string()
    }
}

/// Reasons a `.sample` file is skipped during retraining
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Not a .sample file: {}", .0.display())]
    NotASample(PathBuf),

    #[error("Too-large sample: {} ({floats} floats)", .path.display())]
    TooLarge { path: PathBuf, floats: usize },

    #[error("Truncated sample: {} ({floats} floats)", .path.display())]
    Truncated { path: PathBuf, floats: usize },

    #[error("Implausible runtime in ms: {runtime} ({})", .path.display())]
    ImplausibleRuntime { path: PathBuf, runtime: f32 },

    #[error(
        "Negative or implausibly large schedule feature {feature} at stage {stage}: {value} ({})",
        .path.display()
    )]
    BadScheduleFeature {
        path: PathBuf,
        stage: usize,
        feature: usize,
        value: f32,
    },

    #[error("I/O error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
