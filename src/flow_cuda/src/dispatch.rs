//! CPU execution strategies for per-pixel work.
//!
//! Every pixel task is a pure function of its index, so the sequential and
//! parallel strategies produce identical results.

use rayon::prelude::*;

use crate::config::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    Parallel,
}

impl Strategy {
    /// CPU strategy for a backend. CUDA falls back to the parallel path.
    pub fn for_backend(backend: Backend) -> Self {
        match backend {
            Backend::Sequential => Self::Sequential,
            Backend::Parallel | Backend::Cuda => Self::Parallel,
        }
    }
}

/// Evaluate `f` for every index in `0..count`, collecting results in index order.
pub fn map_pixels<R, F>(strategy: Strategy, count: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Sync + Send,
{
    match strategy {
        Strategy::Sequential => (0..count).map(f).collect(),
        Strategy::Parallel => (0..count).into_par_iter().map(f).collect(),
    }
}

/// Hand each `stride`-sized chunk of `out` to `f` together with its chunk index.
///
/// A zero stride means there is nothing to write.
pub fn for_each_chunk<T, F>(strategy: Strategy, out: &mut [T], stride: usize, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync + Send,
{
    if stride == 0 {
        return;
    }
    match strategy {
        Strategy::Sequential => out
            .chunks_mut(stride)
            .enumerate()
            .for_each(|(index, chunk)| f(index, chunk)),
        Strategy::Parallel => out
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(index, chunk)| f(index, chunk)),
    }
}
