//! Synthetic frames and cameras with known geometry.

use nalgebra::{Matrix3, Vector3};

use crate::camera::{pose_from_parts, CameraMeta};
use crate::dispatch::Strategy;
use crate::forward::back_project_grid;
use crate::points::PointGrid;
use crate::scalar::FlowScalar;
use crate::tensor::{Shape4, Tensor4};

/// Identity intrinsics and pose: pixel `(w, h)` at depth `z` lands on `(z*w, z*h, z)`.
pub fn identity_camera<T: FlowScalar>() -> CameraMeta<T> {
    CameraMeta::new(
        Matrix3::identity(),
        pose_from_parts(&Matrix3::identity(), &Vector3::zeros()),
    )
}

/// Pinhole camera with focal lengths `(fx, fy)`, principal point `(cx, cy)`
/// and a camera-to-world translation.
pub fn pinhole_camera<T: FlowScalar>(
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    translation: [f64; 3],
) -> CameraMeta<T> {
    let c = T::cast_f64;
    let zero = T::zero();
    let one = T::one();
    let k = Matrix3::new(c(fx), zero, c(cx), zero, c(fy), c(cy), zero, zero, one);
    let inv_k = Matrix3::new(
        c(1.0 / fx),
        zero,
        c(-cx / fx),
        zero,
        c(1.0 / fy),
        c(-cy / fy),
        zero,
        zero,
        one,
    );
    let t = Vector3::new(c(translation[0]), c(translation[1]), c(translation[2]));

    CameraMeta {
        intrinsics: Some(k),
        ..CameraMeta::new(inv_k, pose_from_parts(&Matrix3::identity(), &t))
    }
}

/// `(N, H, W, 1)` depth map with the same depth everywhere.
pub fn constant_depth<T: FlowScalar>(
    batch: usize,
    height: usize,
    width: usize,
    depth: f64,
) -> Tensor4<T> {
    Tensor4::filled(Shape4::new(batch, height, width, 1), T::cast_f64(depth))
}

/// `(N, H, W, C)` data whose element at flat offset `i` is `i + 1`.
pub fn ramp_data<T: FlowScalar>(
    batch: usize,
    height: usize,
    width: usize,
    channels: usize,
) -> Tensor4<T> {
    let shape = Shape4::new(batch, height, width, channels);
    let data = (0..shape.len()).map(|i| T::cast_index(i + 1)).collect();
    Tensor4::from_vec_unchecked(shape, data)
}

/// Point cloud a previous forward call would have produced from `depth`.
pub fn previous_from_depth<T: FlowScalar>(
    depth: &Tensor4<T>,
    cameras: &[CameraMeta<T>],
) -> PointGrid<T> {
    back_project_grid(depth, cameras, Strategy::Sequential)
}

/// Inputs for one forward call.
#[derive(Debug, Clone)]
pub struct SyntheticFrame<T: FlowScalar> {
    pub data: Tensor4<T>,
    pub previous: PointGrid<T>,
    pub depth: Tensor4<T>,
    pub cameras: Vec<CameraMeta<T>>,
}

/// Random frame whose previous cloud is a noisy re-observation of the
/// current depth, so most valid pixels find a match.
///
/// Values are drawn in `f64` and cast, so the same seed gives the same scene
/// for `f32` and `f64`.
#[cfg(test)]
pub fn make_random_frame<T: FlowScalar>(
    batch: usize,
    height: usize,
    width: usize,
    channels: usize,
    seed: u64,
) -> SyntheticFrame<T> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let focal = width.max(height) as f64;

    let cameras: Vec<CameraMeta<T>> = (0..batch)
        .map(|n| {
            pinhole_camera(
                focal,
                focal,
                (width as f64 - 1.0) / 2.0,
                (height as f64 - 1.0) / 2.0,
                [0.1 * n as f64, -0.05 * n as f64, 0.0],
            )
        })
        .collect();

    let shape = Shape4::new(batch, height, width, 1);
    let mut current = Vec::with_capacity(shape.len());
    let mut previous = Vec::with_capacity(shape.len());
    for _ in 0..shape.len() {
        let depth: f64 = rng.gen_range(1.0..3.0);
        let noise: f64 = rng.gen_range(-0.05..0.05);
        current.push(if rng.gen_bool(0.1) { 0.0 } else { depth });
        previous.push(if rng.gen_bool(0.15) { 0.0 } else { depth + noise });
    }

    let to_tensor = |values: Vec<f64>| {
        Tensor4::from_vec_unchecked(shape, values.into_iter().map(T::cast_f64).collect())
    };
    let depth = to_tensor(current);
    let previous = previous_from_depth(&to_tensor(previous), &cameras);

    let data_shape = shape.with_channels(channels);
    let data = (0..data_shape.len())
        .map(|_| T::cast_f64(rng.gen_range(-10.0..10.0)))
        .collect();

    SyntheticFrame {
        data: Tensor4::from_vec_unchecked(data_shape, data),
        previous,
        depth,
        cameras,
    }
}
