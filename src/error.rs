//! Error types for the vehicle condition pipeline.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CarStateError>;

#[derive(Error, Debug)]
pub enum CarStateError {
    /// Parameters missing or incompatible with the current architecture.
    #[error("model not loaded: {0}")]
    ModelUnavailable(String),

    #[error("no samples found under {}", .0.display())]
    EmptyDataset(PathBuf),

    /// Samples were found but none of them decoded.
    #[error("none of the samples under {} could be decoded", .0.display())]
    NoUsableSamples(PathBuf),

    #[error("failed to decode image {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Zero usable views were handed to the aggregator.
    #[error("no images provided")]
    NoInput,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sample index {index} out of range (dataset has {len} samples)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("training diverged at epoch {epoch}: loss is {loss}")]
    Diverged { epoch: usize, loss: f64 },

    #[error("failed to persist model: {0}")]
    Persistence(String),

    #[error("tensor readback failed: {0}")]
    Tensor(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
