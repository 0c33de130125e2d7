//! CUDA backend (feature `cuda`).
//!
//! Kernels only run for `f32` elements. The f32 rounding of a device
//! computation may differ from the host in the last bit where the compiler
//! fuses multiply-adds, so world points can differ by an ulp or so from the
//! CPU path while match decisions away from the threshold do not.

pub mod kernels;
pub mod runtime;

pub use runtime::{is_cuda_available, GpuFlowRuntime};
