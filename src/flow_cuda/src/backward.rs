//! Backward pass: route the gradient of the carried-forward data back to the
//! previous-frame pixels it was copied from.
//!
//! Matches are recomputed from the point clouds rather than cached, so the
//! configuration must equal the one used by the forward call. The gradient
//! of target pixel `t` is the sum of `grad[s]` over every source pixel `s`
//! whose match is `t`. Since a match always lies inside the source's search
//! window, the candidate sources of `t` are exactly the pixels in `t`'s own
//! window. Each output pixel is owned by one task and its sources are summed
//! in pixel order, so the result equals a sequential scatter-add bit for bit.

use tracing::debug;

use crate::config::FlowConfig;
use crate::dispatch::{for_each_chunk, Strategy};
use crate::error::{FlowError, Result};
use crate::matcher::FlowMatcher;
use crate::matching::{compute_matches, MatchMap, MatchParams, PixelMatch, SearchWindow};
use crate::points::PointGrid;
use crate::scalar::FlowScalar;
use crate::tensor::{Shape4, Tensor4};
use crate::timing::TimingCollector;

pub(crate) fn validate_backward_inputs<T: FlowScalar>(
    previous: &PointGrid<T>,
    current: &PointGrid<T>,
    grad: &Tensor4<T>,
) -> Result<Shape4> {
    let grad_shape = grad.shape();
    if !previous.shape().same_grid(&current.shape()) {
        return Err(FlowError::shape_mismatch(format!(
            "previous points shape {} does not match current points shape {}",
            previous.shape(),
            current.shape()
        )));
    }
    if !grad_shape.same_grid(&current.shape()) {
        return Err(FlowError::shape_mismatch(format!(
            "gradient shape {grad_shape} does not match current points shape {}",
            current.shape()
        )));
    }
    Ok(grad_shape)
}

/// Accumulate the gradient of target pixel `(n, ty, tx)` into `out`.
#[inline]
pub fn gather_pixel<T: FlowScalar>(
    grad: &Tensor4<T>,
    matches: &MatchMap,
    n: usize,
    ty: usize,
    tx: usize,
    radius: usize,
    out: &mut [T],
) {
    let shape = grad.shape();
    let target = PixelMatch { x: tx, y: ty };
    let window = SearchWindow::around(tx, ty, radius, shape.width, shape.height);

    for sy in window.rows.clone() {
        for sx in window.columns.clone() {
            if matches.get(n, sy, sx) != Some(target) {
                continue;
            }
            let source = grad.pixel(n, sy, sx);
            for (acc, &g) in out.iter_mut().zip(source) {
                *acc += g;
            }
        }
    }
}

/// Route `grad` back through `matches`.
pub fn gather_gradient<T: FlowScalar>(
    grad: &Tensor4<T>,
    matches: &MatchMap,
    radius: usize,
    strategy: Strategy,
) -> Tensor4<T> {
    let shape = grad.shape();
    let mut out = Tensor4::zeros(shape);
    for_each_chunk(strategy, out.as_mut_slice(), shape.channels, |index, chunk| {
        let (n, ty, tx) = shape.pixel_coords(index);
        gather_pixel(grad, matches, n, ty, tx, radius, chunk);
    });
    out
}

/// CPU backward pass. Inputs must already be validated.
pub(crate) fn backward_cpu<T: FlowScalar>(
    previous: &PointGrid<T>,
    current: &PointGrid<T>,
    grad: &Tensor4<T>,
    config: &FlowConfig,
    strategy: Strategy,
) -> Tensor4<T> {
    let mut collector = TimingCollector::new();
    collector.start();

    let params = MatchParams::from_config(config);
    let matches = crate::time_phase!(collector, crate::timing::PHASE_MATCH, {
        compute_matches(previous, current, &params, strategy)
    });
    let out = crate::time_phase!(collector, crate::timing::PHASE_TRANSFER, {
        gather_gradient(grad, &matches, params.radius, strategy)
    });

    let timing = collector.finish();
    debug!(
        ?strategy,
        pixels = grad.shape().pixels(),
        matched = matches.num_matched(),
        total_ms = timing.total_ms,
        "flow backward"
    );
    out
}

/// Gradient of the forward data output with respect to the forward data input.
///
/// * `previous` - previous world points, `(N, H, W)`
/// * `current` - world points returned by the forward call
/// * `grad` - upstream gradient, `(N, H, W, C)`
pub fn flow_backward<T: FlowScalar>(
    previous: &PointGrid<T>,
    current: &PointGrid<T>,
    grad: &Tensor4<T>,
    config: &FlowConfig,
) -> Result<Tensor4<T>> {
    FlowMatcher::new(config.clone())?.backward(previous, current, grad)
}
