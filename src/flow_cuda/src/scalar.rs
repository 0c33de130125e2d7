//! Element types accepted by the flow operators.
//!
//! The CPU path runs on `f32` and `f64`. The CUDA kernels are compiled for
//! `f32` only; `f64` inputs always take the CPU path.

use nalgebra::RealField;

mod private {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Floating-point element type of depth, data and point arrays.
pub trait FlowScalar: RealField + Copy + Send + Sync + private::Sealed {
    /// Whether the CUDA kernels can consume this type without conversion.
    const GPU_NATIVE: bool;

    /// Convert a literal.
    fn cast_f64(value: f64) -> Self;

    /// Convert a pixel coordinate.
    fn cast_index(value: usize) -> Self;

    /// The NaN marker used by flat point arrays for missing points.
    fn nan_sentinel() -> Self;

    fn is_nan_sentinel(self) -> bool;

    /// Narrow to the GPU element type.
    fn to_gpu(self) -> f32;

    /// Widen from the GPU element type.
    fn from_gpu(value: f32) -> Self;
}

impl FlowScalar for f32 {
    const GPU_NATIVE: bool = true;

    #[inline]
    fn cast_f64(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn cast_index(value: usize) -> Self {
        value as f32
    }

    #[inline]
    fn nan_sentinel() -> Self {
        f32::NAN
    }

    #[inline]
    fn is_nan_sentinel(self) -> bool {
        self.is_nan()
    }

    #[inline]
    fn to_gpu(self) -> f32 {
        self
    }

    #[inline]
    fn from_gpu(value: f32) -> Self {
        value
    }
}

impl FlowScalar for f64 {
    const GPU_NATIVE: bool = false;

    #[inline]
    fn cast_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn cast_index(value: usize) -> Self {
        value as f64
    }

    #[inline]
    fn nan_sentinel() -> Self {
        f64::NAN
    }

    #[inline]
    fn is_nan_sentinel(self) -> bool {
        self.is_nan()
    }

    #[inline]
    fn to_gpu(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_gpu(value: f32) -> Self {
        value as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_sentinel_roundtrip() {
        assert!(f32::nan_sentinel().is_nan_sentinel());
        assert!(f64::nan_sentinel().is_nan_sentinel());
        assert!(!0.0f32.is_nan_sentinel());
    }

    #[test]
    fn test_gpu_native() {
        assert!(<f32 as FlowScalar>::GPU_NATIVE);
        assert!(!<f64 as FlowScalar>::GPU_NATIVE);
    }
}
