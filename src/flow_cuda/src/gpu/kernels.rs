//! CubeCL kernels for flow matching.
//!
//! One thread per pixel (or per output element for the data kernels).
//! Arithmetic is written term by term in the same order as the CPU path.
//! Match indices are in-image pixel offsets `y * W + x`, `-1` for no match.
//!
//! Camera buffer layout per batch element (21 values): inverse intrinsic
//! 3x3 row-major, then camera-to-world 3x4 row-major.

use cubecl::prelude::*;

use crate::camera::KERNEL_PARAMS_LEN;

/// Values per camera in the camera buffer.
pub const CAMERA_STRIDE: u32 = KERNEL_PARAMS_LEN as u32;

/// Nearest valid previous point within the clipped window around `(w, h)`.
///
/// Scans columns outer, rows inner, and keeps the first strictly smaller
/// distance. Returns the in-image index of the match or -1.
#[cube]
#[allow(clippy::too_many_arguments)]
fn nearest_in_window<F: Float>(
    qx: F,
    qy: F,
    qz: F,
    prev_points: &Array<F>,
    prev_valid: &Array<u32>,
    image_base: u32,
    w: u32,
    h: u32,
    width: u32,
    height: u32,
    radius: u32,
    threshold: F,
) -> i32 {
    let mut x0 = 0u32;
    if w > radius {
        x0 = w - radius;
    }
    let mut x1 = w + radius + 1u32;
    if x1 > width {
        x1 = width;
    }
    let mut y0 = 0u32;
    if h > radius {
        y0 = h - radius;
    }
    let mut y1 = h + radius + 1u32;
    if y1 > height {
        y1 = height;
    }

    let mut best = F::new(1000.0);
    let mut best_idx = -1_i32;

    for fx in x0..x1 {
        for fy in y0..y1 {
            let local = fy * width + fx;
            let cand = image_base + local;
            if prev_valid[cand] != 0u32 {
                let cbase = cand * 3;
                let dx = qx - prev_points[cbase];
                let dy = qy - prev_points[cbase + 1];
                let dz = qz - prev_points[cbase + 2];
                let d = F::sqrt(dx * dx + dy * dy + dz * dz);

                if d < best {
                    best = d;
                    best_idx = local as i32;
                }
            }
        }
    }

    let mut result = -1_i32;
    if best_idx >= 0_i32 && best < threshold {
        result = best_idx;
    }
    result
}

/// Back-project every pixel and match it against the previous cloud.
#[cube(launch_unchecked)]
#[allow(clippy::too_many_arguments)]
pub fn flow_forward_match_kernel<F: Float>(
    // Depth [N * H * W]
    depth: &Array<F>,
    // Camera parameters [N * 21]
    cameras: &Array<F>,
    // Previous points [N * H * W * 3] and validity [N * H * W]
    prev_points: &Array<F>,
    prev_valid: &Array<u32>,
    width: u32,
    height: u32,
    num_pixels: u32,
    radius: u32,
    threshold: F,
    // Outputs: current points [N * H * W * 3], validity and match index [N * H * W]
    points: &mut Array<F>,
    valid: &mut Array<u32>,
    matches: &mut Array<i32>,
) {
    let idx = ABSOLUTE_POS;

    if idx >= num_pixels {
        terminate!();
    }

    let per_image = width * height;
    let n = idx / per_image;
    let rem = idx % per_image;
    let h = rem / width;
    let w = rem % width;

    let z = depth[idx];
    let base = idx * 3;

    if z > F::new(0.0) {
        let cam = n * CAMERA_STRIDE;
        let fw = F::cast_from(w);
        let fh = F::cast_from(h);

        let rx = cameras[cam] * fw + cameras[cam + 1] * fh + cameras[cam + 2];
        let ry = cameras[cam + 3] * fw + cameras[cam + 4] * fh + cameras[cam + 5];
        let rz = cameras[cam + 6] * fw + cameras[cam + 7] * fh + cameras[cam + 8];

        let cx = z * rx;
        let cy = z * ry;
        let cz = z * rz;

        let px = cameras[cam + 9] * cx
            + cameras[cam + 10] * cy
            + cameras[cam + 11] * cz
            + cameras[cam + 12];
        let py = cameras[cam + 13] * cx
            + cameras[cam + 14] * cy
            + cameras[cam + 15] * cz
            + cameras[cam + 16];
        let pz = cameras[cam + 17] * cx
            + cameras[cam + 18] * cy
            + cameras[cam + 19] * cz
            + cameras[cam + 20];

        points[base] = px;
        points[base + 1] = py;
        points[base + 2] = pz;
        valid[idx] = 1u32;
        matches[idx] = nearest_in_window::<F>(
            px,
            py,
            pz,
            prev_points,
            prev_valid,
            n * per_image,
            w,
            h,
            width,
            height,
            radius,
            threshold,
        );
    } else {
        points[base] = F::new(0.0);
        points[base + 1] = F::new(0.0);
        points[base + 2] = F::new(0.0);
        valid[idx] = 0u32;
        matches[idx] = -1_i32;
    }
}

/// Match already back-projected points (backward pass, phase 1).
#[cube(launch_unchecked)]
#[allow(clippy::too_many_arguments)]
pub fn flow_match_points_kernel<F: Float>(
    cur_points: &Array<F>,
    cur_valid: &Array<u32>,
    prev_points: &Array<F>,
    prev_valid: &Array<u32>,
    width: u32,
    height: u32,
    num_pixels: u32,
    radius: u32,
    threshold: F,
    matches: &mut Array<i32>,
) {
    let idx = ABSOLUTE_POS;

    if idx >= num_pixels {
        terminate!();
    }

    let mut result = -1_i32;
    if cur_valid[idx] != 0u32 {
        let per_image = width * height;
        let n = idx / per_image;
        let rem = idx % per_image;
        let base = idx * 3;

        result = nearest_in_window::<F>(
            cur_points[base],
            cur_points[base + 1],
            cur_points[base + 2],
            prev_points,
            prev_valid,
            n * per_image,
            rem % width,
            rem / width,
            width,
            height,
            radius,
            threshold,
        );
    }
    matches[idx] = result;
}

/// Copy the matched channel vector for every output element; zero when unmatched.
#[cube(launch_unchecked)]
pub fn copy_matched_data_kernel<F: Float>(
    data: &Array<F>,
    matches: &Array<i32>,
    channels: u32,
    per_image: u32,
    num_elements: u32,
    output: &mut Array<F>,
) {
    let idx = ABSOLUTE_POS;

    if idx >= num_elements {
        terminate!();
    }

    let pixel = idx / channels;
    let c = idx % channels;
    let m = matches[pixel];

    if m >= 0_i32 {
        let n = pixel / per_image;
        let src = (n * per_image + m as u32) * channels + c;
        output[idx] = data[src];
    } else {
        output[idx] = F::new(0.0);
    }
}

/// Sum the gradient of every source pixel matched to this output element's
/// pixel. Sources are visited row by row, column by column.
#[cube(launch_unchecked)]
#[allow(clippy::too_many_arguments)]
pub fn gather_gradient_kernel<F: Float>(
    grad: &Array<F>,
    matches: &Array<i32>,
    width: u32,
    height: u32,
    channels: u32,
    radius: u32,
    num_elements: u32,
    output: &mut Array<F>,
) {
    let idx = ABSOLUTE_POS;

    if idx >= num_elements {
        terminate!();
    }

    let per_image = width * height;
    let pixel = idx / channels;
    let c = idx % channels;
    let n = pixel / per_image;
    let target = pixel % per_image;
    let ty = target / width;
    let tx = target % width;
    let image_base = n * per_image;

    let mut x0 = 0u32;
    if tx > radius {
        x0 = tx - radius;
    }
    let mut x1 = tx + radius + 1u32;
    if x1 > width {
        x1 = width;
    }
    let mut y0 = 0u32;
    if ty > radius {
        y0 = ty - radius;
    }
    let mut y1 = ty + radius + 1u32;
    if y1 > height {
        y1 = height;
    }

    let mut acc = F::new(0.0);
    for sy in y0..y1 {
        for sx in x0..x1 {
            let source = image_base + sy * width + sx;
            if matches[source] == target as i32 {
                acc += grad[source * channels + c];
            }
        }
    }
    output[idx] = acc;
}
