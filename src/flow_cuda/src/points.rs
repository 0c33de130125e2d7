//! Per-pixel world-space point clouds.
//!
//! A pixel either carries a complete `(x, y, z)` triple or nothing at all.
//! Flat `(N, H, W, 3)` arrays mark missing points with NaN in every channel;
//! that encoding only exists at the [`PointGrid::from_flat`] /
//! [`PointGrid::to_flat`] boundary.

use nalgebra::{Point3, Scalar};

use crate::error::{FlowError, Result};
use crate::scalar::FlowScalar;
use crate::tensor::{Shape4, Tensor4};

/// World-space point observed at one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum WorldPoint<T: Scalar> {
    Valid(Point3<T>),
    /// No depth was observed at this pixel.
    #[default]
    Invalid,
}

impl<T: FlowScalar> WorldPoint<T> {
    /// Decode a flat triple. Any NaN channel makes the whole point invalid.
    pub fn from_xyz(x: T, y: T, z: T) -> Self {
        if x.is_nan_sentinel() || y.is_nan_sentinel() || z.is_nan_sentinel() {
            Self::Invalid
        } else {
            Self::Valid(Point3::new(x, y, z))
        }
    }

    /// Encode as a flat triple, NaN in all channels when invalid.
    pub fn to_xyz(&self) -> [T; 3] {
        match self {
            Self::Valid(p) => [p.x, p.y, p.z],
            Self::Invalid => [T::nan_sentinel(); 3],
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn point(&self) -> Option<&Point3<T>> {
        match self {
            Self::Valid(p) => Some(p),
            Self::Invalid => None,
        }
    }
}

/// An `(N, H, W)` grid of world points.
#[derive(Debug, Clone, PartialEq)]
pub struct PointGrid<T: Scalar> {
    batch: usize,
    height: usize,
    width: usize,
    points: Vec<WorldPoint<T>>,
}

impl<T: FlowScalar> PointGrid<T> {
    /// A grid with no valid points.
    pub fn invalid(batch: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            height,
            width,
            points: vec![WorldPoint::Invalid; batch * height * width],
        }
    }

    pub fn from_points(
        batch: usize,
        height: usize,
        width: usize,
        points: Vec<WorldPoint<T>>,
    ) -> Result<Self> {
        if points.len() != batch * height * width {
            return Err(FlowError::shape_mismatch(format!(
                "{} points cannot fill a {batch}x{height}x{width} grid",
                points.len()
            )));
        }
        Ok(Self {
            batch,
            height,
            width,
            points,
        })
    }

    pub(crate) fn from_points_unchecked(
        batch: usize,
        height: usize,
        width: usize,
        points: Vec<WorldPoint<T>>,
    ) -> Self {
        debug_assert_eq!(points.len(), batch * height * width);
        Self {
            batch,
            height,
            width,
            points,
        }
    }

    /// Decode a flat NaN-marked `(N, H, W, 3)` array.
    pub fn from_flat(name: &'static str, dims: &[usize], data: &[T]) -> Result<Self> {
        let shape = Shape4::from_dims(name, dims)?;
        if shape.channels != 3 {
            return Err(FlowError::shape_mismatch(format!(
                "{name} must have 3 channels, got shape {shape}"
            )));
        }
        if data.len() != shape.len() {
            return Err(FlowError::shape_mismatch(format!(
                "{name} holds {} elements but shape {shape} needs {}",
                data.len(),
                shape.len()
            )));
        }

        let points = data
            .chunks_exact(3)
            .map(|p| WorldPoint::from_xyz(p[0], p[1], p[2]))
            .collect();

        Ok(Self {
            batch: shape.batch,
            height: shape.height,
            width: shape.width,
            points,
        })
    }

    /// Encode as a flat NaN-marked `(N, H, W, 3)` array.
    pub fn to_flat(&self) -> Tensor4<T> {
        let data: Vec<T> = self.points.iter().flat_map(|p| p.to_xyz()).collect();
        Tensor4::from_vec_unchecked(self.shape(), data)
    }

    /// Flat coordinates plus a validity mask, the layout the GPU kernels read.
    ///
    /// Invalid points contribute zeros to the coordinate buffer.
    pub fn to_coords_and_mask(&self) -> (Vec<f32>, Vec<u32>) {
        let mut coords = Vec::with_capacity(self.points.len() * 3);
        let mut mask = Vec::with_capacity(self.points.len());
        for point in &self.points {
            match point {
                WorldPoint::Valid(p) => {
                    coords.extend_from_slice(&[p.x.to_gpu(), p.y.to_gpu(), p.z.to_gpu()]);
                    mask.push(1);
                }
                WorldPoint::Invalid => {
                    coords.extend_from_slice(&[0.0, 0.0, 0.0]);
                    mask.push(0);
                }
            }
        }
        (coords, mask)
    }

    /// Inverse of [`PointGrid::to_coords_and_mask`].
    pub fn from_coords_and_mask(
        batch: usize,
        height: usize,
        width: usize,
        coords: &[f32],
        mask: &[u32],
    ) -> Result<Self> {
        if coords.len() != mask.len() * 3 {
            return Err(FlowError::shape_mismatch(format!(
                "{} coordinates for {} mask entries",
                coords.len(),
                mask.len()
            )));
        }
        let points = coords
            .chunks_exact(3)
            .zip(mask)
            .map(|(c, &valid)| {
                if valid != 0 {
                    WorldPoint::Valid(Point3::new(
                        T::from_gpu(c[0]),
                        T::from_gpu(c[1]),
                        T::from_gpu(c[2]),
                    ))
                } else {
                    WorldPoint::Invalid
                }
            })
            .collect();
        Self::from_points(batch, height, width, points)
    }

    /// Shape of the flat encoding, `(N, H, W, 3)`.
    pub fn shape(&self) -> Shape4 {
        Shape4::new(self.batch, self.height, self.width, 3)
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, n: usize, h: usize, w: usize) -> &WorldPoint<T> {
        &self.points[self.shape().pixel_index(n, h, w)]
    }

    pub fn set(&mut self, n: usize, h: usize, w: usize, point: WorldPoint<T>) {
        let index = self.shape().pixel_index(n, h, w);
        self.points[index] = point;
    }

    /// All points of batch element `n`, row-major.
    pub fn image(&self, n: usize) -> &[WorldPoint<T>] {
        let per_image = self.height * self.width;
        &self.points[n * per_image..(n + 1) * per_image]
    }

    pub fn points(&self) -> &[WorldPoint<T>] {
        &self.points
    }

    pub fn num_valid(&self) -> usize {
        self.points.iter().filter(|p| p.is_valid()).count()
    }
}
