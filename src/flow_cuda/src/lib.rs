//! Dense per-pixel flow matching between consecutive RGB-D frames.
//!
//! Each pixel of the current frame is back-projected into world space with
//! its camera, matched to the nearest previously observed world point within
//! a pixel window and a distance threshold, and receives the data vector
//! stored at that previous pixel. The backward pass routes a gradient on the
//! carried-forward data back to the pixels it was copied from.
//!
//! # Architecture
//!
//! - [`camera`]: per-frame intrinsics/pose and back-projection
//! - [`matching`]: windowed nearest-neighbor search
//! - [`forward`] / [`backward`]: the two passes on the CPU
//! - [`dispatch`]: sequential or rayon execution of per-pixel functions
//! - `gpu`: CubeCL CUDA kernels (feature `cuda`)
//! - [`matcher`]: high-level API choosing the backend
//!
//! # Usage
//!
//! ```ignore
//! use flow_cuda::{flow_backward, flow_forward, FlowConfig};
//!
//! let config = FlowConfig::new(1, 0.05);
//! let out = flow_forward(&data, &previous, &depth, &cameras, &config)?;
//! println!("matched {} of {} pixels", out.stats.matched, out.stats.pixels);
//!
//! let grad_data = flow_backward(&previous, &out.points, &grad_out, &config)?;
//! ```

pub mod backward;
pub mod camera;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward;
#[cfg(feature = "cuda")]
pub mod gpu;
pub mod matcher;
pub mod matching;
pub mod points;
pub mod scalar;
pub mod tensor;
pub mod test_utils;
pub mod timing;

pub use backward::flow_backward;
pub use camera::CameraMeta;
pub use config::{Backend, FlowConfig, FlowConfigBuilder};
pub use error::{FlowError, Result};
pub use forward::{flow_forward, flow_forward_meta, FlowOutput, FlowStats};
pub use matching::{compute_matches, MatchMap, MatchParams, PixelMatch};
pub use points::{PointGrid, WorldPoint};
pub use scalar::FlowScalar;
pub use tensor::{Shape4, Tensor4};
pub use timing::FlowTiming;

// High-level API
pub use matcher::FlowMatcher;

#[cfg(feature = "cuda")]
pub use gpu::{is_cuda_available, GpuFlowRuntime};

/// `println!` that only prints with the `test-verbose` feature.
#[macro_export]
#[doc(hidden)]
macro_rules! test_println {
    ($($arg:tt)*) => {
        #[cfg(feature = "test-verbose")]
        {
            println!($($arg)*);
        }
    };
}
