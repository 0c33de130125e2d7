//! Per-frame camera parameters and pixel back-projection.
//!
//! Each batch element carries its own inverse intrinsic matrix and
//! camera-to-world pose. The legacy flat metadata block (48 scalars per
//! batch element, at least 42 required) can be parsed with
//! [`CameraMeta::from_block`]:
//!
//! | Offset   | Content                                   |
//! |----------|-------------------------------------------|
//! | 0..9     | intrinsic 3x3 (carried, unused)           |
//! | 9..18    | inverse intrinsic 3x3, row-major          |
//! | 18..30   | world-to-camera 3x4 (carried, unused)     |
//! | 30..42   | camera-to-world 3x4, row-major            |
//! | 42..45   | voxel step (carried, unused)              |
//! | 45..48   | voxel minimum (carried, unused)           |

use nalgebra::{Matrix3, Matrix3x4, Point3, Scalar, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::points::WorldPoint;
use crate::scalar::FlowScalar;
use crate::tensor::Tensor4;

pub const INTRINSIC_OFFSET: usize = 0;
pub const INV_INTRINSIC_OFFSET: usize = 9;
pub const WORLD_TO_CAMERA_OFFSET: usize = 18;
pub const CAMERA_TO_WORLD_OFFSET: usize = 30;
pub const VOXEL_STEP_OFFSET: usize = 42;
pub const VOXEL_MIN_OFFSET: usize = 45;

/// Smallest metadata block that carries everything back-projection needs.
pub const META_BLOCK_MIN_LEN: usize = 42;
/// Metadata block length including the voxel fields.
pub const META_BLOCK_LEN: usize = 48;

/// Number of scalars per camera in the GPU parameter buffer
/// (inverse intrinsic 3x3 followed by camera-to-world 3x4, both row-major).
pub const KERNEL_PARAMS_LEN: usize = 21;

/// Camera parameters for one batch element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Scalar + Serialize",
    deserialize = "T: Scalar + Deserialize<'de>"
))]
pub struct CameraMeta<T: Scalar> {
    /// Maps a homogeneous pixel `(w, h, 1)` to a camera-space ray.
    pub inv_intrinsics: Matrix3<T>,
    /// Camera-to-world rigid transform `[R | t]`.
    pub camera_to_world: Matrix3x4<T>,
    pub intrinsics: Option<Matrix3<T>>,
    pub world_to_camera: Option<Matrix3x4<T>>,
    pub voxel_step: Option<Vector3<T>>,
    pub voxel_min: Option<Vector3<T>>,
}

impl<T: FlowScalar> CameraMeta<T> {
    pub fn new(inv_intrinsics: Matrix3<T>, camera_to_world: Matrix3x4<T>) -> Self {
        Self {
            inv_intrinsics,
            camera_to_world,
            intrinsics: None,
            world_to_camera: None,
            voxel_step: None,
            voxel_min: None,
        }
    }

    /// Build from a forward intrinsic matrix, inverting it.
    pub fn from_intrinsics(intrinsics: Matrix3<T>, camera_to_world: Matrix3x4<T>) -> Result<Self> {
        let inv_intrinsics = intrinsics
            .try_inverse()
            .ok_or_else(|| FlowError::invalid_argument("intrinsic matrix is singular"))?;
        Ok(Self {
            intrinsics: Some(intrinsics),
            ..Self::new(inv_intrinsics, camera_to_world)
        })
    }

    /// Parse one legacy metadata block.
    pub fn from_block(block: &[T]) -> Result<Self> {
        if block.len() < META_BLOCK_MIN_LEN {
            return Err(FlowError::shape_mismatch(format!(
                "metadata block needs at least {META_BLOCK_MIN_LEN} values, got {}",
                block.len()
            )));
        }

        let mat3 = |offset: usize| Matrix3::from_row_slice(&block[offset..offset + 9]);
        let mat3x4 = |offset: usize| Matrix3x4::from_row_slice(&block[offset..offset + 12]);

        let mut meta = Self::new(
            mat3(INV_INTRINSIC_OFFSET),
            mat3x4(CAMERA_TO_WORLD_OFFSET),
        );
        meta.intrinsics = Some(mat3(INTRINSIC_OFFSET));
        meta.world_to_camera = Some(mat3x4(WORLD_TO_CAMERA_OFFSET));
        if block.len() >= META_BLOCK_LEN {
            meta.voxel_step = Some(Vector3::from_row_slice(
                &block[VOXEL_STEP_OFFSET..VOXEL_STEP_OFFSET + 3],
            ));
            meta.voxel_min = Some(Vector3::from_row_slice(
                &block[VOXEL_MIN_OFFSET..VOXEL_MIN_OFFSET + 3],
            ));
        }
        Ok(meta)
    }

    /// Parse an `(N, 1, 1, M)` metadata tensor into one camera per batch element.
    pub fn from_meta_tensor(meta: &Tensor4<T>) -> Result<Vec<Self>> {
        let shape = meta.shape();
        if shape.height != 1 || shape.width != 1 {
            return Err(FlowError::shape_mismatch(format!(
                "meta data must have shape (N, 1, 1, M), got {shape}"
            )));
        }
        (0..shape.batch)
            .map(|n| Self::from_block(meta.pixel(n, 0, 0)))
            .collect()
    }

    /// Serialize to the legacy 48-value block. Absent optional fields are zero.
    pub fn to_block(&self) -> Vec<T> {
        let mut block = vec![T::zero(); META_BLOCK_LEN];

        // The transpose's column-major storage is the row-major layout.
        if let Some(k) = &self.intrinsics {
            block[INTRINSIC_OFFSET..INTRINSIC_OFFSET + 9].copy_from_slice(k.transpose().as_slice());
        }
        block[INV_INTRINSIC_OFFSET..INV_INTRINSIC_OFFSET + 9]
            .copy_from_slice(self.inv_intrinsics.transpose().as_slice());
        if let Some(p) = &self.world_to_camera {
            block[WORLD_TO_CAMERA_OFFSET..WORLD_TO_CAMERA_OFFSET + 12]
                .copy_from_slice(p.transpose().as_slice());
        }
        block[CAMERA_TO_WORLD_OFFSET..CAMERA_TO_WORLD_OFFSET + 12]
            .copy_from_slice(self.camera_to_world.transpose().as_slice());
        if let Some(v) = &self.voxel_step {
            block[VOXEL_STEP_OFFSET..VOXEL_STEP_OFFSET + 3].copy_from_slice(v.as_slice());
        }
        if let Some(v) = &self.voxel_min {
            block[VOXEL_MIN_OFFSET..VOXEL_MIN_OFFSET + 3].copy_from_slice(v.as_slice());
        }
        block
    }

    /// Parameters in the order the GPU kernels read them.
    pub fn kernel_params(&self) -> [f32; KERNEL_PARAMS_LEN] {
        let mut params = [0.0f32; KERNEL_PARAMS_LEN];
        for r in 0..3 {
            for c in 0..3 {
                params[r * 3 + c] = self.inv_intrinsics[(r, c)].to_gpu();
            }
            for c in 0..4 {
                params[9 + r * 4 + c] = self.camera_to_world[(r, c)].to_gpu();
            }
        }
        params
    }

    /// Back-project pixel `(w, h)` observed at `depth` into world space.
    ///
    /// Depth `<= 0` (or NaN) yields [`WorldPoint::Invalid`]. The arithmetic
    /// is spelled out term by term so every backend rounds identically.
    #[inline]
    pub fn back_project(&self, w: usize, h: usize, depth: T) -> WorldPoint<T> {
        if !(depth > T::zero()) {
            return WorldPoint::Invalid;
        }

        let k = &self.inv_intrinsics;
        let fw = T::cast_index(w);
        let fh = T::cast_index(h);

        // Ray through the pixel in camera coordinates.
        let rx = k[(0, 0)] * fw + k[(0, 1)] * fh + k[(0, 2)];
        let ry = k[(1, 0)] * fw + k[(1, 1)] * fh + k[(1, 2)];
        let rz = k[(2, 0)] * fw + k[(2, 1)] * fh + k[(2, 2)];

        let cx = depth * rx;
        let cy = depth * ry;
        let cz = depth * rz;

        let p = &self.camera_to_world;
        WorldPoint::Valid(Point3::new(
            p[(0, 0)] * cx + p[(0, 1)] * cy + p[(0, 2)] * cz + p[(0, 3)],
            p[(1, 0)] * cx + p[(1, 1)] * cy + p[(1, 2)] * cz + p[(1, 3)],
            p[(2, 0)] * cx + p[(2, 1)] * cy + p[(2, 2)] * cz + p[(2, 3)],
        ))
    }
}

/// Camera-to-world transform from a rotation and a translation.
pub fn pose_from_parts<T: FlowScalar>(
    rotation: &Matrix3<T>,
    translation: &Vector3<T>,
) -> Matrix3x4<T> {
    let mut pose = Matrix3x4::zeros();
    pose.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    pose.set_column(3, translation);
    pose
}
