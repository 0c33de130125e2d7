//! Dense (batch, row, column, channel) arrays.
//!
//! All per-pixel arrays in this crate use the NHWC layout with the channel
//! index varying fastest. The element at `(n, h, w, c)` lives at
//! `((n * H + h) * W + w) * C + c`.

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::scalar::FlowScalar;

/// Shape of a 4-dimensional NHWC array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape4 {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl Shape4 {
    pub fn new(batch: usize, height: usize, width: usize, channels: usize) -> Self {
        Self {
            batch,
            height,
            width,
            channels,
        }
    }

    /// Build a shape from a dimension list, rejecting anything that is not rank 4.
    ///
    /// `name` identifies the offending input in the error message.
    pub fn from_dims(name: &'static str, dims: &[usize]) -> Result<Self> {
        match *dims {
            [batch, height, width, channels] => Ok(Self::new(batch, height, width, channels)),
            _ => Err(FlowError::InvalidRank {
                name,
                rank: dims.len(),
            }),
        }
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.height, self.width, self.channels]
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.pixels() * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pixels across the whole batch.
    pub fn pixels(&self) -> usize {
        self.batch * self.pixels_per_image()
    }

    pub fn pixels_per_image(&self) -> usize {
        self.height * self.width
    }

    /// Flat pixel index of `(n, h, w)`.
    #[inline]
    pub fn pixel_index(&self, n: usize, h: usize, w: usize) -> usize {
        (n * self.height + h) * self.width + w
    }

    /// Inverse of [`Shape4::pixel_index`]: `(n, h, w)`.
    #[inline]
    pub fn pixel_coords(&self, index: usize) -> (usize, usize, usize) {
        let per_image = self.pixels_per_image();
        let n = index / per_image;
        let rem = index % per_image;
        (n, rem / self.width, rem % self.width)
    }

    /// Same batch size and image grid, ignoring channels.
    pub fn same_grid(&self, other: &Shape4) -> bool {
        self.batch == other.batch && self.height == other.height && self.width == other.width
    }

    /// Same grid with a different channel count.
    pub fn with_channels(&self, channels: usize) -> Self {
        Self { channels, ..*self }
    }
}

impl std::fmt::Display for Shape4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.batch, self.height, self.width, self.channels
        )
    }
}

/// Owned dense NHWC array.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor4<T> {
    shape: Shape4,
    data: Vec<T>,
}

impl<T: Copy> Tensor4<T> {
    /// Wrap a flat buffer, checking that its length matches the shape.
    pub fn from_vec(shape: Shape4, data: Vec<T>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(FlowError::shape_mismatch(format!(
                "buffer holds {} elements but shape {shape} needs {}",
                data.len(),
                shape.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Wrap a buffer whose length is known to match by construction.
    pub(crate) fn from_vec_unchecked(shape: Shape4, data: Vec<T>) -> Self {
        debug_assert_eq!(data.len(), shape.len());
        Self { shape, data }
    }

    /// Wrap a flat buffer described by an arbitrary dimension list.
    ///
    /// Fails with [`FlowError::InvalidRank`] unless `dims` has four entries.
    pub fn from_dims(name: &'static str, dims: &[usize], data: Vec<T>) -> Result<Self> {
        Self::from_vec(Shape4::from_dims(name, dims)?, data)
    }

    pub fn filled(shape: Shape4, value: T) -> Self {
        Self {
            shape,
            data: vec![value; shape.len()],
        }
    }

    pub fn shape(&self) -> Shape4 {
        self.shape
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Channel vector of pixel `(n, h, w)`.
    pub fn pixel(&self, n: usize, h: usize, w: usize) -> &[T] {
        let c = self.shape.channels;
        let start = self.shape.pixel_index(n, h, w) * c;
        &self.data[start..start + c]
    }

    pub fn pixel_mut(&mut self, n: usize, h: usize, w: usize) -> &mut [T] {
        let c = self.shape.channels;
        let start = self.shape.pixel_index(n, h, w) * c;
        &mut self.data[start..start + c]
    }

    /// Channel vector at a flat pixel index.
    #[inline]
    pub fn pixel_at(&self, index: usize) -> &[T] {
        let c = self.shape.channels;
        &self.data[index * c..(index + 1) * c]
    }

    pub fn get(&self, n: usize, h: usize, w: usize, c: usize) -> T {
        self.pixel(n, h, w)[c]
    }
}

impl<T: FlowScalar> Tensor4<T> {
    pub fn zeros(shape: Shape4) -> Self {
        Self::filled(shape, T::zero())
    }

    /// Sum of all elements, accumulated in pixel order.
    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &v| acc + v)
    }
}
