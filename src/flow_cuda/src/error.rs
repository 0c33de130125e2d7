//! Error types for flow matching.
//!
//! Every error is raised once per call, before any pixel is processed.
//! Invalid depth, empty search windows and unmatched pixels are data
//! states, not errors.

use thiserror::Error;

/// Errors from flow matching operations.
#[derive(Error, Debug)]
pub enum FlowError {
    /// A configuration value is out of range (negative kernel size or threshold).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An input array does not have exactly four dimensions.
    #[error("{name} must be 4-dimensional, got {rank} dimensions")]
    InvalidRank { name: &'static str, rank: usize },

    /// Input dimensions disagree with each other or with the data length.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The GPU backend failed after validation succeeded.
    #[error("backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

impl FlowError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlowError>;
