//! Matching configuration shared by the forward and backward passes.

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Execution backend for the per-pixel loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Single thread, pixel order.
    Sequential,
    /// Rayon thread pool.
    #[default]
    Parallel,
    /// CubeCL CUDA kernels. Requires the `cuda` feature and an `f32` element
    /// type; otherwise falls back to [`Backend::Parallel`].
    Cuda,
}

/// Configuration for flow matching.
///
/// The same values must be used for a forward call and the backward call
/// that consumes its points, or the reconstructed matches will differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Search window half-width in pixels. The window is `(2K+1)^2` pixels
    /// before clipping; `0` checks only the pixel's own location.
    pub kernel_size: i32,

    /// Matches require a Euclidean distance strictly below this value.
    pub threshold: f32,

    pub backend: Backend,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            kernel_size: 1,
            threshold: 0.1,
            backend: Backend::Parallel,
        }
    }
}

impl FlowConfig {
    pub fn new(kernel_size: i32, threshold: f32) -> Self {
        Self {
            kernel_size,
            threshold,
            ..Self::default()
        }
    }

    /// Reject negative values and a NaN threshold. An infinite threshold
    /// accepts the nearest valid candidate in the window.
    pub fn validate(&self) -> Result<()> {
        if self.kernel_size < 0 {
            return Err(FlowError::invalid_argument(format!(
                "kernel_size must be non-negative, got {}",
                self.kernel_size
            )));
        }
        if self.threshold.is_nan() || self.threshold < 0.0 {
            return Err(FlowError::invalid_argument(format!(
                "threshold must be non-negative, got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    /// Window half-width as an index offset. Only meaningful after [`validate`](Self::validate).
    pub fn radius(&self) -> usize {
        self.kernel_size.max(0) as usize
    }
}

/// Builder for [`FlowConfig`].
#[derive(Debug, Clone, Default)]
pub struct FlowConfigBuilder {
    config: FlowConfig,
}

impl FlowConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the search window half-width.
    pub fn kernel_size(mut self, kernel_size: i32) -> Self {
        self.config.kernel_size = kernel_size;
        self
    }

    /// Set the match distance threshold.
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.config.threshold = threshold;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<FlowConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
