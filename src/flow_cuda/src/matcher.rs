//! High-level flow matching API.
//!
//! [`FlowMatcher`] holds a validated configuration and, when the CUDA
//! backend is requested and available, a GPU runtime. Calls that cannot use
//! the GPU (no device, `f64` elements) run on the parallel CPU path.
//!
//! # Example
//!
//! ```ignore
//! use flow_cuda::{Backend, FlowConfigBuilder, FlowMatcher};
//!
//! let config = FlowConfigBuilder::new()
//!     .kernel_size(2)
//!     .threshold(0.05)
//!     .backend(Backend::Cuda)
//!     .build()?;
//! let matcher = FlowMatcher::new(config)?;
//!
//! let out = matcher.forward(&data, &previous, &depth, &cameras)?;
//! let grad_data = matcher.backward(&previous, &out.points, &grad)?;
//! ```

use tracing::warn;

use crate::backward::{backward_cpu, validate_backward_inputs};
use crate::camera::CameraMeta;
use crate::config::{Backend, FlowConfig};
use crate::dispatch::Strategy;
use crate::error::{FlowError, Result};
use crate::forward::{forward_cpu, validate_forward_inputs, FlowOutput};
use crate::matching::{compute_matches, MatchMap, MatchParams};
use crate::points::PointGrid;
use crate::scalar::FlowScalar;
use crate::tensor::Tensor4;

#[cfg(feature = "cuda")]
use crate::gpu::{is_cuda_available, GpuFlowRuntime};

/// Flow matcher bound to one configuration.
pub struct FlowMatcher {
    config: FlowConfig,

    /// GPU runtime (None unless the CUDA backend was requested and initialized).
    #[cfg(feature = "cuda")]
    gpu: Option<GpuFlowRuntime>,
}

impl FlowMatcher {
    /// Validate `config` and set up the requested backend.
    pub fn new(config: FlowConfig) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "cuda")]
        let gpu = if config.backend == Backend::Cuda {
            Self::init_gpu()
        } else {
            None
        };

        #[cfg(not(feature = "cuda"))]
        if config.backend == Backend::Cuda {
            warn!("flow_cuda built without the `cuda` feature, using the parallel CPU backend");
        }

        Ok(Self {
            config,
            #[cfg(feature = "cuda")]
            gpu,
        })
    }

    #[cfg(feature = "cuda")]
    fn init_gpu() -> Option<GpuFlowRuntime> {
        if !is_cuda_available() {
            warn!("CUDA device not available, using the parallel CPU backend");
            return None;
        }
        match GpuFlowRuntime::new() {
            Ok(runtime) => {
                tracing::debug!("GPU flow runtime initialized");
                Some(runtime)
            }
            Err(e) => {
                warn!("Failed to initialize GPU runtime ({e:#}), using the parallel CPU backend");
                None
            }
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Backend that calls with `f32` elements will actually run on.
    pub fn backend(&self) -> Backend {
        match self.config.backend {
            Backend::Cuda if self.has_gpu() => Backend::Cuda,
            Backend::Cuda => Backend::Parallel,
            other => other,
        }
    }

    #[cfg(feature = "cuda")]
    pub fn has_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    #[cfg(not(feature = "cuda"))]
    pub fn has_gpu(&self) -> bool {
        false
    }

    fn strategy(&self) -> Strategy {
        Strategy::for_backend(self.config.backend)
    }

    #[cfg(feature = "cuda")]
    fn gpu_for<T: FlowScalar>(&self) -> Option<&GpuFlowRuntime> {
        let gpu = self.gpu.as_ref()?;
        if !T::GPU_NATIVE {
            warn!("CUDA kernels only support f32, using the parallel CPU backend");
            return None;
        }
        Some(gpu)
    }

    /// Back-project `depth`, match against `previous` and carry `data` forward.
    pub fn forward<T: FlowScalar>(
        &self,
        data: &Tensor4<T>,
        previous: &PointGrid<T>,
        depth: &Tensor4<T>,
        cameras: &[CameraMeta<T>],
    ) -> Result<FlowOutput<T>> {
        validate_forward_inputs(data, previous, depth, cameras)?;

        #[cfg(feature = "cuda")]
        if let Some(gpu) = self.gpu_for::<T>() {
            let params = MatchParams::from_config(&self.config);
            return Ok(gpu.forward(data, previous, depth, cameras, &params)?);
        }

        Ok(forward_cpu(
            data,
            previous,
            depth,
            cameras,
            &self.config,
            self.strategy(),
        ))
    }

    /// [`FlowMatcher::forward`] with cameras parsed from an `(N, 1, 1, >=42)`
    /// metadata tensor.
    pub fn forward_meta<T: FlowScalar>(
        &self,
        data: &Tensor4<T>,
        previous: &PointGrid<T>,
        depth: &Tensor4<T>,
        meta: &Tensor4<T>,
    ) -> Result<FlowOutput<T>> {
        let batch = depth.shape().batch;
        if meta.shape().batch != batch {
            return Err(FlowError::shape_mismatch(format!(
                "meta data shape {} does not match batch size {batch}",
                meta.shape()
            )));
        }
        let cameras = CameraMeta::from_meta_tensor(meta)?;
        self.forward(data, previous, depth, &cameras)
    }

    /// Gradient with respect to the forward data input, given the upstream
    /// gradient `grad` on the forward data output.
    pub fn backward<T: FlowScalar>(
        &self,
        previous: &PointGrid<T>,
        current: &PointGrid<T>,
        grad: &Tensor4<T>,
    ) -> Result<Tensor4<T>> {
        validate_backward_inputs(previous, current, grad)?;

        #[cfg(feature = "cuda")]
        if let Some(gpu) = self.gpu_for::<T>() {
            let params = MatchParams::from_config(&self.config);
            return Ok(gpu.backward(previous, current, grad, &params)?);
        }

        Ok(backward_cpu(
            previous,
            current,
            grad,
            &self.config,
            self.strategy(),
        ))
    }

    /// Match of every `current` point in `previous`, as recomputed by the
    /// backward pass.
    pub fn matches<T: FlowScalar>(
        &self,
        previous: &PointGrid<T>,
        current: &PointGrid<T>,
    ) -> Result<MatchMap> {
        if !previous.shape().same_grid(&current.shape()) {
            return Err(FlowError::shape_mismatch(format!(
                "previous points shape {} does not match current points shape {}",
                previous.shape(),
                current.shape()
            )));
        }

        let params = MatchParams::from_config(&self.config);

        #[cfg(feature = "cuda")]
        if let Some(gpu) = self.gpu_for::<T>() {
            return Ok(gpu.matches(previous, current, &params)?);
        }

        Ok(compute_matches(previous, current, &params, self.strategy()))
    }
}
