//! Windowed nearest-neighbor search against the previous point cloud.
//!
//! For a query point observed at pixel `(x, y)`, the candidates are the
//! previous-frame points at pixels within `radius` of `(x, y)` in both
//! directions, clipped to the image. Candidates are scanned column by column
//! (`x` outer, `y` inner); a candidate replaces the current best only when
//! its distance is strictly smaller, so the first minimum in scan order wins
//! ties. The best candidate is a match when its distance is strictly below
//! the threshold.

use std::ops::Range;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::config::FlowConfig;
use crate::dispatch::{map_pixels, Strategy};
use crate::error::{FlowError, Result};
use crate::points::{PointGrid, WorldPoint};
use crate::scalar::FlowScalar;

/// Initial running minimum. Candidates at this distance or further are never
/// selected, even when the threshold is larger.
pub const SENTINEL_DISTANCE: f64 = 1000.0;

/// Previous-frame pixel selected as a match, within the same batch element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelMatch {
    /// Column.
    pub x: usize,
    /// Row.
    pub y: usize,
}

/// Pixel ranges covered by a search window after clipping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchWindow {
    pub columns: Range<usize>,
    pub rows: Range<usize>,
}

impl SearchWindow {
    pub fn around(x: usize, y: usize, radius: usize, width: usize, height: usize) -> Self {
        let span = radius.saturating_add(1);
        Self {
            columns: x.saturating_sub(radius)..x.saturating_add(span).min(width),
            rows: y.saturating_sub(radius)..y.saturating_add(span).min(height),
        }
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        self.columns.contains(&x) && self.rows.contains(&y)
    }
}

/// Search parameters converted to the element type.
#[derive(Debug, Clone, Copy)]
pub struct MatchParams<T> {
    pub radius: usize,
    pub threshold: T,
}

impl<T: FlowScalar> MatchParams<T> {
    pub fn new(radius: usize, threshold: T) -> Self {
        Self { radius, threshold }
    }

    pub fn from_config(config: &FlowConfig) -> Self {
        Self {
            radius: config.radius(),
            threshold: T::cast_f64(f64::from(config.threshold)),
        }
    }
}

/// Euclidean distance with a fixed evaluation order.
#[inline]
pub fn distance<T: FlowScalar>(a: &Point3<T>, b: &Point3<T>) -> T {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let dz = a.z - b.z;
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Find the match of `query`, observed at `(x, y)`, among the points of one
/// previous image laid out row-major as `height x width`.
///
/// Returns `None` when no valid candidate lies in the window or the nearest
/// one is not strictly closer than the threshold.
pub fn find_match<T: FlowScalar>(
    query: &Point3<T>,
    prev_image: &[WorldPoint<T>],
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    params: &MatchParams<T>,
) -> Option<PixelMatch> {
    let window = SearchWindow::around(x, y, params.radius, width, height);

    let mut best_distance = T::cast_f64(SENTINEL_DISTANCE);
    let mut best = None;
    for fx in window.columns.clone() {
        for fy in window.rows.clone() {
            let WorldPoint::Valid(candidate) = &prev_image[fy * width + fx] else {
                continue;
            };
            let d = distance(query, candidate);
            if d < best_distance {
                best_distance = d;
                best = Some(PixelMatch { x: fx, y: fy });
            }
        }
    }

    best.filter(|_| best_distance < params.threshold)
}

/// Match of every pixel of a point grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchMap {
    batch: usize,
    height: usize,
    width: usize,
    matches: Vec<Option<PixelMatch>>,
}

impl MatchMap {
    pub fn new(
        batch: usize,
        height: usize,
        width: usize,
        matches: Vec<Option<PixelMatch>>,
    ) -> Result<Self> {
        if matches.len() != batch * height * width {
            return Err(FlowError::shape_mismatch(format!(
                "{} matches for a {batch}x{height}x{width} grid",
                matches.len()
            )));
        }
        Ok(Self {
            batch,
            height,
            width,
            matches,
        })
    }

    /// Decode per-pixel in-image indices (`y * W + x`, negative for no match)
    /// as written by the GPU kernels.
    pub fn from_indices(
        batch: usize,
        height: usize,
        width: usize,
        indices: &[i32],
    ) -> Result<Self> {
        let per_image = height * width;
        let mut matches = Vec::with_capacity(indices.len());
        for &index in indices {
            let m = match usize::try_from(index) {
                Ok(i) if i < per_image => Some(PixelMatch {
                    x: i % width,
                    y: i / width,
                }),
                Ok(i) => {
                    return Err(FlowError::shape_mismatch(format!(
                        "match index {i} outside a {height}x{width} image"
                    )))
                }
                Err(_) => None,
            };
            matches.push(m);
        }
        Self::new(batch, height, width, matches)
    }

    /// Inverse of [`MatchMap::from_indices`].
    pub fn to_indices(&self) -> Vec<i32> {
        self.matches
            .iter()
            .map(|m| match m {
                Some(m) => (m.y * self.width + m.x) as i32,
                None => -1,
            })
            .collect()
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

    pub fn get(&self, n: usize, h: usize, w: usize) -> Option<PixelMatch> {
        self.matches[(n * self.height + h) * self.width + w]
    }

    /// Matches in flat pixel order.
    pub fn as_slice(&self) -> &[Option<PixelMatch>] {
        &self.matches
    }

    pub fn num_matched(&self) -> usize {
        self.matches.iter().filter(|m| m.is_some()).count()
    }
}

/// Match every valid point of `current` against `previous`.
///
/// Both grids must have the same dimensions; callers validate this.
pub fn compute_matches<T: FlowScalar>(
    previous: &PointGrid<T>,
    current: &PointGrid<T>,
    params: &MatchParams<T>,
    strategy: Strategy,
) -> MatchMap {
    let shape = current.shape();
    let (height, width) = (shape.height, shape.width);

    let matches = map_pixels(strategy, shape.pixels(), |index| {
        let (n, h, w) = shape.pixel_coords(index);
        current.points()[index]
            .point()
            .and_then(|query| find_match(query, previous.image(n), width, height, w, h, params))
    });

    MatchMap {
        batch: shape.batch,
        height,
        width,
        matches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(x: f32, y: f32, z: f32) -> WorldPoint<f32> {
        WorldPoint::Valid(Point3::new(x, y, z))
    }

    #[test]
    fn test_window_clipping() {
        let window = SearchWindow::around(0, 4, 2, 5, 6);
        assert_eq!(window.columns, 0..3);
        assert_eq!(window.rows, 2..6);
        assert!(window.contains(2, 5));
        assert!(!window.contains(3, 5));

        let single = SearchWindow::around(3, 3, 0, 5, 5);
        assert_eq!(single.columns, 3..4);
        assert_eq!(single.rows, 3..4);
    }

    #[test]
    fn test_unbounded_radius_covers_image() {
        let window = SearchWindow::around(2, 1, usize::MAX, 5, 4);
        assert_eq!(window.columns, 0..5);
        assert_eq!(window.rows, 0..4);

        let prev = vec![valid(9.0, 0.0, 0.0), valid(0.1, 0.0, 0.0), valid(4.0, 0.0, 0.0)];
        let params = MatchParams::new(usize::MAX, 1.0f32);
        assert_eq!(
            find_match(&Point3::origin(), &prev, 3, 1, 0, 0, &params),
            Some(PixelMatch { x: 1, y: 0 })
        );
    }

    #[test]
    fn test_infinite_threshold_takes_nearest() {
        let prev = vec![valid(3.0, 0.0, 0.0), valid(0.0, 2.0, 0.0), WorldPoint::Invalid];
        let params = MatchParams::new(1, f32::INFINITY);
        assert_eq!(
            find_match(&Point3::origin(), &prev, 3, 1, 2, 0, &params),
            Some(PixelMatch { x: 1, y: 0 })
        );

        let empty = vec![WorldPoint::<f32>::Invalid; 3];
        assert_eq!(find_match(&Point3::origin(), &empty, 3, 1, 1, 0, &params), None);
    }

    #[test]
    fn test_strict_threshold() {
        let prev = vec![valid(0.0, 0.0, 0.5)];
        let query = Point3::new(0.0, 0.0, 0.0);

        // Distance exactly 0.5 is not a match.
        let at = MatchParams::new(0, 0.5f32);
        assert_eq!(find_match(&query, &prev, 1, 1, 0, 0, &at), None);

        let above = MatchParams::new(0, 0.5001f32);
        assert_eq!(
            find_match(&query, &prev, 1, 1, 0, 0, &above),
            Some(PixelMatch { x: 0, y: 0 })
        );
    }

    #[test]
    fn test_outside_window_never_selected() {
        // 1x4 image; the exact match sits two columns away with radius 1.
        let prev = vec![
            valid(0.0, 0.0, 0.0),
            valid(5.0, 0.0, 0.0),
            valid(0.3, 0.0, 0.0),
            valid(9.0, 0.0, 0.0),
        ];
        let query = Point3::new(0.0, 0.0, 0.0);
        let params = MatchParams::new(1, 1.0f32);
        assert_eq!(
            find_match(&query, &prev, 4, 1, 2, 0, &params),
            Some(PixelMatch { x: 2, y: 0 })
        );
    }

    #[test]
    fn test_ties_resolve_column_major() {
        // 2x2 image, every candidate at distance 1 from the query.
        let prev = vec![
            valid(1.0, 0.0, 0.0),
            valid(-1.0, 0.0, 0.0),
            valid(0.0, 1.0, 0.0),
            valid(0.0, -1.0, 0.0),
        ];
        let query = Point3::new(0.0, 0.0, 0.0);
        let params = MatchParams::new(1, 2.0f32);
        assert_eq!(
            find_match(&query, &prev, 2, 2, 1, 1, &params),
            Some(PixelMatch { x: 0, y: 0 })
        );

        // Drop (0, 0): column 0 is still scanned before column 1, so (x=0, y=1) wins.
        let mut prev = prev;
        prev[0] = WorldPoint::Invalid;
        assert_eq!(
            find_match(&query, &prev, 2, 2, 1, 1, &params),
            Some(PixelMatch { x: 0, y: 1 })
        );
    }

    #[test]
    fn test_empty_window_is_no_match() {
        let prev = vec![WorldPoint::<f64>::Invalid; 9];
        let params = MatchParams::new(1, 5000.0);
        assert_eq!(
            find_match(&Point3::origin(), &prev, 3, 3, 1, 1, &params),
            None
        );
    }

    #[test]
    fn test_sentinel_caps_large_thresholds() {
        let prev = vec![WorldPoint::Valid(Point3::new(2000.0f64, 0.0, 0.0))];
        let params = MatchParams::new(0, 5000.0);
        assert_eq!(find_match(&Point3::origin(), &prev, 1, 1, 0, 0, &params), None);
    }

    #[test]
    fn test_match_indices_roundtrip() {
        let map = MatchMap::from_indices(1, 2, 3, &[-1, 0, 5, 4, -1, 2]).unwrap();
        assert_eq!(map.get(0, 0, 0), None);
        assert_eq!(map.get(0, 0, 2), Some(PixelMatch { x: 2, y: 1 }));
        assert_eq!(map.num_matched(), 4);
        assert_eq!(map.to_indices(), vec![-1, 0, 5, 4, -1, 2]);

        assert!(MatchMap::from_indices(1, 2, 3, &[6, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_compute_matches_stays_in_batch() {
        let mut previous = PointGrid::<f32>::invalid(2, 1, 2);
        previous.set(0, 0, 0, valid(0.0, 0.0, 1.0));
        let mut current = PointGrid::<f32>::invalid(2, 1, 2);
        current.set(0, 0, 1, valid(0.0, 0.0, 1.0));
        current.set(1, 0, 1, valid(0.0, 0.0, 1.0));

        let params = MatchParams::new(1, 0.1);
        let map = compute_matches(&previous, &current, &params, Strategy::Sequential);
        assert_eq!(map.get(0, 0, 1), Some(PixelMatch { x: 0, y: 0 }));
        // Batch 1 has no previous points even though batch 0 does.
        assert_eq!(map.get(1, 0, 1), None);
        assert_eq!(map.num_matched(), 1);
    }
}
