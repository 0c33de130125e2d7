//! Forward pass: back-project the current depth map and carry data forward
//! from the nearest previous-frame point.
//!
//! The pass runs in three phases, each a pure per-pixel function:
//! 1. back-project every pixel into world space,
//! 2. match every valid point against the previous cloud,
//! 3. copy the channel vector of the matched previous pixel.

use nalgebra::Scalar;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::camera::CameraMeta;
use crate::config::FlowConfig;
use crate::dispatch::{for_each_chunk, map_pixels, Strategy};
use crate::error::{FlowError, Result};
use crate::matcher::FlowMatcher;
use crate::matching::{compute_matches, MatchMap, MatchParams};
use crate::points::PointGrid;
use crate::scalar::FlowScalar;
use crate::tensor::{Shape4, Tensor4};
use crate::timing::{FlowTiming, TimingCollector};

/// Per-call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    pub pixels: usize,
    /// Pixels with positive depth.
    pub valid_points: usize,
    /// Pixels that found a previous-frame match.
    pub matched: usize,
}

impl FlowStats {
    pub fn collect<T: FlowScalar>(points: &PointGrid<T>, matches: &MatchMap) -> Self {
        Self {
            pixels: points.points().len(),
            valid_points: points.num_valid(),
            matched: matches.num_matched(),
        }
    }
}

/// Result of a forward call.
#[derive(Debug, Clone)]
pub struct FlowOutput<T: Scalar> {
    /// World point of every current pixel.
    pub points: PointGrid<T>,
    /// Carried-forward data, zero where no match was found.
    pub data: Tensor4<T>,
    pub matches: MatchMap,
    pub stats: FlowStats,
    pub timing: FlowTiming,
}

/// Check that data, previous points, depth and cameras describe the same
/// batch and image grid. Returns the data shape.
pub(crate) fn validate_forward_inputs<T: FlowScalar>(
    data: &Tensor4<T>,
    previous: &PointGrid<T>,
    depth: &Tensor4<T>,
    cameras: &[CameraMeta<T>],
) -> Result<Shape4> {
    let data_shape = data.shape();
    let depth_shape = depth.shape();

    if depth_shape.channels != 1 {
        return Err(FlowError::shape_mismatch(format!(
            "depth must have 1 channel, got shape {depth_shape}"
        )));
    }
    if !data_shape.same_grid(&depth_shape) {
        return Err(FlowError::shape_mismatch(format!(
            "data shape {data_shape} does not match depth shape {depth_shape}"
        )));
    }
    if !previous.shape().same_grid(&depth_shape) {
        return Err(FlowError::shape_mismatch(format!(
            "previous points shape {} does not match depth shape {depth_shape}",
            previous.shape()
        )));
    }
    if cameras.len() != depth_shape.batch {
        return Err(FlowError::shape_mismatch(format!(
            "{} cameras for a batch of {}",
            cameras.len(),
            depth_shape.batch
        )));
    }
    Ok(data_shape)
}

/// Back-project every pixel of an `(N, H, W, 1)` depth map.
pub fn back_project_grid<T: FlowScalar>(
    depth: &Tensor4<T>,
    cameras: &[CameraMeta<T>],
    strategy: Strategy,
) -> PointGrid<T> {
    let shape = depth.shape();
    let depths = depth.as_slice();
    let points = map_pixels(strategy, shape.pixels(), |index| {
        let (n, h, w) = shape.pixel_coords(index);
        cameras[n].back_project(w, h, depths[index])
    });
    PointGrid::from_points_unchecked(shape.batch, shape.height, shape.width, points)
}

/// Copy `data[n, match.y, match.x, :]` into every matched pixel; unmatched
/// pixels stay zero.
pub fn copy_matched_data<T: FlowScalar>(
    data: &Tensor4<T>,
    matches: &MatchMap,
    strategy: Strategy,
) -> Tensor4<T> {
    let shape = data.shape();
    let mut out = Tensor4::zeros(shape);
    let per_pixel = matches.as_slice();

    for_each_chunk(strategy, out.as_mut_slice(), shape.channels, |index, chunk| {
        if let Some(m) = per_pixel[index] {
            let (n, _, _) = shape.pixel_coords(index);
            chunk.copy_from_slice(data.pixel(n, m.y, m.x));
        }
    });
    out
}

/// CPU forward pass. Inputs must already be validated.
pub(crate) fn forward_cpu<T: FlowScalar>(
    data: &Tensor4<T>,
    previous: &PointGrid<T>,
    depth: &Tensor4<T>,
    cameras: &[CameraMeta<T>],
    config: &FlowConfig,
    strategy: Strategy,
) -> FlowOutput<T> {
    let mut collector = TimingCollector::new();
    collector.start();

    let params = MatchParams::from_config(config);
    let points = crate::time_phase!(collector, crate::timing::PHASE_GEOMETRY, {
        back_project_grid(depth, cameras, strategy)
    });
    let matches = crate::time_phase!(collector, crate::timing::PHASE_MATCH, {
        compute_matches(previous, &points, &params, strategy)
    });
    let out = crate::time_phase!(collector, crate::timing::PHASE_TRANSFER, {
        copy_matched_data(data, &matches, strategy)
    });

    let stats = FlowStats::collect(&points, &matches);
    debug!(
        ?strategy,
        pixels = stats.pixels,
        valid_points = stats.valid_points,
        matched = stats.matched,
        "flow forward"
    );

    FlowOutput {
        points,
        data: out,
        matches,
        stats,
        timing: collector.finish(),
    }
}

/// Compute world points for the current frame and carry data forward from
/// the previous frame.
///
/// * `data` - previous per-pixel data, `(N, H, W, C)`
/// * `previous` - previous world points, `(N, H, W)`
/// * `depth` - current depth, `(N, H, W, 1)`
/// * `cameras` - one camera per batch element
pub fn flow_forward<T: FlowScalar>(
    data: &Tensor4<T>,
    previous: &PointGrid<T>,
    depth: &Tensor4<T>,
    cameras: &[CameraMeta<T>],
    config: &FlowConfig,
) -> Result<FlowOutput<T>> {
    FlowMatcher::new(config.clone())?.forward(data, previous, depth, cameras)
}

/// [`flow_forward`] with cameras given as an `(N, 1, 1, >=42)` metadata tensor.
pub fn flow_forward_meta<T: FlowScalar>(
    data: &Tensor4<T>,
    previous: &PointGrid<T>,
    depth: &Tensor4<T>,
    meta: &Tensor4<T>,
    config: &FlowConfig,
) -> Result<FlowOutput<T>> {
    FlowMatcher::new(config.clone())?.forward_meta(data, previous, depth, meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, FlowConfigBuilder};
    use crate::matching::PixelMatch;
    use crate::points::WorldPoint;
    use crate::test_utils::{
        constant_depth, identity_camera, make_random_frame, previous_from_depth, ramp_data,
    };
    use nalgebra::Point3;

    fn sequential(kernel_size: i32, threshold: f32) -> FlowConfig {
        FlowConfigBuilder::new()
            .kernel_size(kernel_size)
            .threshold(threshold)
            .backend(Backend::Sequential)
            .build()
            .unwrap()
    }

    #[test]
    fn test_end_to_end_center_match() {
        // 3x3 frame at depth 1; only the center of the previous cloud is
        // valid and it coincides with the current center point.
        let depth = constant_depth::<f32>(1, 3, 3, 1.0);
        let cameras = vec![identity_camera::<f32>()];
        let mut previous = PointGrid::invalid(1, 3, 3);
        previous.set(0, 1, 1, cameras[0].back_project(1, 1, 1.0));
        let data = ramp_data::<f32>(1, 3, 3, 2);

        let out = flow_forward(&data, &previous, &depth, &cameras, &sequential(1, 0.5)).unwrap();

        assert_eq!(out.data.pixel(0, 1, 1), data.pixel(0, 1, 1));
        assert_eq!(out.matches.get(0, 1, 1), Some(PixelMatch { x: 1, y: 1 }));
        // Identity camera: neighbors are exactly 1 unit away, beyond the threshold.
        for h in 0..3 {
            for w in 0..3 {
                if (h, w) != (1, 1) {
                    assert_eq!(out.data.pixel(0, h, w), &[0.0, 0.0]);
                }
            }
        }
        assert_eq!(
            out.stats,
            FlowStats {
                pixels: 9,
                valid_points: 9,
                matched: 1
            }
        );
    }

    #[test]
    fn test_invalid_depth_produces_invalid_point_and_zero_data() {
        let mut depth = constant_depth::<f64>(1, 2, 2, 1.0);
        depth.pixel_mut(0, 0, 1)[0] = 0.0;
        depth.pixel_mut(0, 1, 0)[0] = -3.0;
        depth.pixel_mut(0, 1, 1)[0] = f64::NAN;
        let cameras = vec![identity_camera::<f64>()];
        let previous = previous_from_depth(&constant_depth(1, 2, 2, 1.0), &cameras);
        let data = ramp_data::<f64>(1, 2, 2, 3);

        let out = flow_forward(&data, &previous, &depth, &cameras, &sequential(1, 10.0)).unwrap();

        assert!(out.points.get(0, 0, 0).is_valid());
        for (h, w) in [(0, 1), (1, 0), (1, 1)] {
            assert_eq!(out.points.get(0, h, w), &WorldPoint::Invalid);
            assert_eq!(out.data.pixel(0, h, w), &[0.0, 0.0, 0.0]);
        }
        let flat = out.points.to_flat();
        assert!(flat.pixel(0, 1, 1).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_no_cross_batch_influence() {
        let depth = constant_depth::<f32>(2, 2, 2, 1.0);
        let cameras = vec![identity_camera::<f32>(); 2];
        let mut previous = previous_from_depth(&depth, &cameras);
        let data = ramp_data::<f32>(2, 2, 2, 1);

        let before = flow_forward(&data, &previous, &depth, &cameras, &sequential(1, 0.5)).unwrap();

        // Wipe batch element 1's previous cloud; element 0 must be unaffected.
        for h in 0..2 {
            for w in 0..2 {
                previous.set(1, h, w, WorldPoint::Invalid);
            }
        }
        let after = flow_forward(&data, &previous, &depth, &cameras, &sequential(1, 0.5)).unwrap();

        let per_image = 4;
        assert_eq!(
            &before.data.as_slice()[..per_image],
            &after.data.as_slice()[..per_image]
        );
        assert!(after.data.as_slice()[per_image..].iter().all(|&v| v == 0.0));
        // Element 1 copies its own data, not element 0's.
        assert_eq!(before.data.pixel(1, 0, 0), data.pixel(1, 0, 0));
    }

    #[test]
    fn test_kernel_size_zero_checks_own_pixel_only() {
        let depth = constant_depth::<f32>(1, 1, 3, 1.0);
        let cameras = vec![identity_camera::<f32>()];
        let mut previous = PointGrid::invalid(1, 1, 3);
        // Previous point of pixel 0 sits right on top of current pixel 1.
        previous.set(0, 0, 0, WorldPoint::Valid(Point3::new(1.0, 0.0, 1.0)));
        let data = ramp_data::<f32>(1, 1, 3, 1);

        let wide = flow_forward(&data, &previous, &depth, &cameras, &sequential(1, 0.5)).unwrap();
        assert_eq!(wide.matches.get(0, 0, 1), Some(PixelMatch { x: 0, y: 0 }));

        let narrow = flow_forward(&data, &previous, &depth, &cameras, &sequential(0, 0.5)).unwrap();
        assert_eq!(narrow.matches.num_matched(), 0);
    }

    #[test]
    fn test_infinite_threshold_matches_nearest() {
        let depth = constant_depth::<f32>(1, 1, 1, 1.0);
        let cameras = vec![identity_camera::<f32>()];
        let previous = previous_from_depth(&depth, &cameras);
        let data = ramp_data::<f32>(1, 1, 1, 2);

        let config = FlowConfig::new(1, f32::INFINITY);
        let out = flow_forward(&data, &previous, &depth, &cameras, &config).unwrap();
        assert_eq!(out.matches.get(0, 0, 0), Some(PixelMatch { x: 0, y: 0 }));
        assert_eq!(out.data, data);

        // Far candidates match too, as long as they are the nearest in the window.
        let depth = constant_depth::<f32>(1, 1, 3, 1.0);
        let mut previous = PointGrid::invalid(1, 1, 3);
        previous.set(0, 0, 2, WorldPoint::Valid(Point3::new(40.0, 0.0, 1.0)));
        let out = flow_forward(
            &ramp_data::<f32>(1, 1, 3, 1),
            &previous,
            &depth,
            &cameras,
            &sequential(2, f32::INFINITY),
        )
        .unwrap();
        assert_eq!(out.matches.num_matched(), 3);
        assert_eq!(out.data.as_slice(), &[3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_zero_channels() {
        let depth = constant_depth::<f32>(1, 2, 2, 1.0);
        let cameras = vec![identity_camera::<f32>()];
        let previous = previous_from_depth(&depth, &cameras);
        let data = Tensor4::zeros(Shape4::new(1, 2, 2, 0));

        let out = flow_forward(&data, &previous, &depth, &cameras, &sequential(1, 0.5)).unwrap();
        assert!(out.data.as_slice().is_empty());
        assert_eq!(out.stats.matched, 4);
    }

    #[test]
    fn test_shape_validation() {
        let depth = constant_depth::<f32>(1, 2, 2, 1.0);
        let cameras = vec![identity_camera::<f32>()];
        let previous = PointGrid::invalid(1, 2, 2);
        let config = sequential(1, 0.5);

        let wrong_grid = ramp_data::<f32>(1, 2, 3, 1);
        let err = flow_forward(&wrong_grid, &previous, &depth, &cameras, &config).unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch(_)));

        let two_channel_depth = ramp_data::<f32>(1, 2, 2, 2);
        let data = ramp_data::<f32>(1, 2, 2, 1);
        let err =
            flow_forward(&data, &previous, &two_channel_depth, &cameras, &config).unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch(_)));

        let err = flow_forward(&data, &previous, &depth, &[], &config).unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch(_)));

        let bad_previous = PointGrid::invalid(1, 3, 2);
        let err = flow_forward(&data, &bad_previous, &depth, &cameras, &config).unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch(_)));
    }

    #[test]
    fn test_negative_config_rejected() {
        let depth = constant_depth::<f32>(1, 1, 1, 1.0);
        let cameras = vec![identity_camera::<f32>()];
        let previous = PointGrid::invalid(1, 1, 1);
        let data = ramp_data::<f32>(1, 1, 1, 1);

        let config = FlowConfig::new(-1, 0.5);
        let err = flow_forward(&data, &previous, &depth, &cameras, &config).unwrap_err();
        assert!(matches!(err, FlowError::InvalidArgument(_)));

        let config = FlowConfig::new(1, -0.5);
        let err = flow_forward(&data, &previous, &depth, &cameras, &config).unwrap_err();
        assert!(matches!(err, FlowError::InvalidArgument(_)));
    }

    #[test]
    fn test_meta_tensor_matches_cameras() {
        let depth = constant_depth::<f32>(1, 3, 3, 2.0);
        let cameras = vec![identity_camera::<f32>()];
        let previous = previous_from_depth(&depth, &cameras);
        let data = ramp_data::<f32>(1, 3, 3, 2);
        let config = sequential(1, 0.5);

        let block = cameras[0].to_block();
        let meta = Tensor4::from_dims("meta", &[1, 1, 1, block.len()], block).unwrap();

        let direct = flow_forward(&data, &previous, &depth, &cameras, &config).unwrap();
        let via_meta = flow_forward_meta(&data, &previous, &depth, &meta, &config).unwrap();
        assert_eq!(direct.data, via_meta.data);
        assert_eq!(direct.points, via_meta.points);

        let short = Tensor4::from_dims("meta", &[1, 1, 1, 41], vec![0.0f32; 41]).unwrap();
        assert!(flow_forward_meta(&data, &previous, &depth, &short, &config).is_err());
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let frame = make_random_frame::<f32>(2, 17, 23, 4, 0x5eed);
        let sequential_config = sequential(2, 0.3);
        let parallel_config = FlowConfig {
            backend: Backend::Parallel,
            ..sequential_config.clone()
        };

        let a = flow_forward(
            &frame.data,
            &frame.previous,
            &frame.depth,
            &frame.cameras,
            &sequential_config,
        )
        .unwrap();
        let b = flow_forward(
            &frame.data,
            &frame.previous,
            &frame.depth,
            &frame.cameras,
            &parallel_config,
        )
        .unwrap();

        assert_eq!(a.matches, b.matches);
        assert_eq!(a.points, b.points);
        assert_eq!(a.data, b.data);
        assert!(a.stats.matched > 0);
        crate::test_println!("random frame stats: {:?}", a.stats);
    }

    #[test]
    fn test_f64_matches_f32_decisions() {
        let frame32 = make_random_frame::<f32>(1, 9, 11, 2, 7);
        let frame64 = make_random_frame::<f64>(1, 9, 11, 2, 7);
        let config = sequential(1, 0.3);

        let a = flow_forward(
            &frame32.data,
            &frame32.previous,
            &frame32.depth,
            &frame32.cameras,
            &config,
        )
        .unwrap();
        let b = flow_forward(
            &frame64.data,
            &frame64.previous,
            &frame64.depth,
            &frame64.cameras,
            &config,
        )
        .unwrap();
        assert_eq!(a.stats.valid_points, b.stats.valid_points);
        assert!(b.stats.matched > 0);
    }
}
