//! GPU runtime for flow matching on CUDA through CubeCL.
//!
//! Inputs are narrowed to `f32`, uploaded, processed by the kernels in
//! [`super::kernels`] and read back into the typed structures the CPU path
//! returns.

use anyhow::{Context, Result};
use cubecl::client::ComputeClient;
use cubecl::cuda::{CudaDevice, CudaRuntime};
use cubecl::prelude::*;
use cubecl::server::Handle;

use super::kernels::{
    copy_matched_data_kernel, flow_forward_match_kernel, flow_match_points_kernel,
    gather_gradient_kernel,
};
use crate::camera::CameraMeta;
use crate::forward::{FlowOutput, FlowStats};
use crate::matching::{MatchMap, MatchParams};
use crate::points::PointGrid;
use crate::scalar::FlowScalar;
use crate::tensor::{Shape4, Tensor4};
use crate::timing::TimingCollector;

/// Type alias for CUDA compute client
type CudaClient = ComputeClient<<CudaRuntime as Runtime>::Server>;

const BLOCK_SIZE: u32 = 256;

fn cube_count(num_threads: usize) -> CubeCount {
    CubeCount::Static(num_threads.div_ceil(BLOCK_SIZE as usize) as u32, 1, 1)
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("{what} ({value}) exceeds the GPU index range"))
}

fn narrow<T: FlowScalar>(values: &[T]) -> Vec<f32> {
    values.iter().map(|v| v.to_gpu()).collect()
}

/// Grid dimensions shared by every kernel launch of one call.
struct LaunchGrid {
    width: u32,
    height: u32,
    num_pixels: u32,
    radius: u32,
}

impl LaunchGrid {
    fn new(shape: Shape4, radius: usize) -> Result<Self> {
        // Windows wider than the image clip to the same pixels.
        let radius = radius.min(shape.width.max(shape.height));
        to_u32(shape.pixels() * 3, "point buffer length")?;
        Ok(Self {
            width: to_u32(shape.width, "image width")?,
            height: to_u32(shape.height, "image height")?,
            num_pixels: to_u32(shape.pixels(), "pixel count")?,
            radius: to_u32(radius, "kernel size")?,
        })
    }
}

/// GPU runtime for flow matching.
pub struct GpuFlowRuntime {
    /// CUDA device (kept alive for runtime lifetime)
    #[allow(dead_code)]
    device: CudaDevice,
    client: CudaClient,
}

impl GpuFlowRuntime {
    /// Create a runtime on the default CUDA device.
    pub fn new() -> Result<Self> {
        Self::with_device_id(0)
    }

    pub fn with_device_id(device_id: usize) -> Result<Self> {
        let device = CudaDevice::new(device_id);
        let client = CudaRuntime::client(&device);

        Ok(Self { device, client })
    }

    /// Forward pass on the GPU. Inputs must already be validated.
    pub fn forward<T: FlowScalar>(
        &self,
        data: &Tensor4<T>,
        previous: &PointGrid<T>,
        depth: &Tensor4<T>,
        cameras: &[CameraMeta<T>],
        params: &MatchParams<T>,
    ) -> Result<FlowOutput<T>> {
        let shape = data.shape();
        let pixels = shape.pixels();
        let mut collector = TimingCollector::new();
        collector.start();

        if pixels == 0 {
            let points = PointGrid::invalid(shape.batch, shape.height, shape.width);
            let matches = MatchMap::new(shape.batch, shape.height, shape.width, Vec::new())?;
            return Ok(FlowOutput {
                stats: FlowStats::collect(&points, &matches),
                points,
                data: Tensor4::zeros(shape),
                matches,
                timing: collector.finish(),
            });
        }

        let grid = LaunchGrid::new(shape, params.radius)?;
        let (prev_coords, prev_mask) = previous.to_coords_and_mask();
        let camera_params: Vec<f32> = cameras.iter().flat_map(|c| c.kernel_params()).collect();

        let depth_gpu = self.client.create(f32::as_bytes(&narrow(depth.as_slice())));
        let cameras_gpu = self.client.create(f32::as_bytes(&camera_params));
        let prev_points_gpu = self.client.create(f32::as_bytes(&prev_coords));
        let prev_valid_gpu = self.client.create(u32::as_bytes(&prev_mask));
        let points_gpu = self.client.empty(pixels * 3 * std::mem::size_of::<f32>());
        let valid_gpu = self.client.empty(pixels * std::mem::size_of::<u32>());
        let matches_gpu = self.client.empty(pixels * std::mem::size_of::<i32>());

        crate::time_phase!(collector, crate::timing::PHASE_MATCH, unsafe {
            flow_forward_match_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                cube_count(pixels),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&depth_gpu, pixels, 1),
                ArrayArg::from_raw_parts::<f32>(&cameras_gpu, camera_params.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&prev_points_gpu, pixels * 3, 1),
                ArrayArg::from_raw_parts::<u32>(&prev_valid_gpu, pixels, 1),
                ScalarArg::new(grid.width),
                ScalarArg::new(grid.height),
                ScalarArg::new(grid.num_pixels),
                ScalarArg::new(grid.radius),
                ScalarArg::new(params.threshold.to_gpu()),
                ArrayArg::from_raw_parts::<f32>(&points_gpu, pixels * 3, 1),
                ArrayArg::from_raw_parts::<u32>(&valid_gpu, pixels, 1),
                ArrayArg::from_raw_parts::<i32>(&matches_gpu, pixels, 1),
            );
        });

        let channels = shape.channels;
        let out_data = crate::time_phase!(collector, crate::timing::PHASE_TRANSFER, {
            if channels == 0 {
                Vec::new()
            } else {
                self.copy_matched(data, &matches_gpu, shape)?
            }
        });

        let coords = f32::from_bytes(&self.client.read_one(points_gpu)).to_vec();
        let mask = u32::from_bytes(&self.client.read_one(valid_gpu)).to_vec();
        let indices = i32::from_bytes(&self.client.read_one(matches_gpu)).to_vec();

        let points = PointGrid::from_coords_and_mask(
            shape.batch,
            shape.height,
            shape.width,
            &coords,
            &mask,
        )?;
        let matches = MatchMap::from_indices(shape.batch, shape.height, shape.width, &indices)?;
        let data = Tensor4::from_vec(shape, out_data.into_iter().map(T::from_gpu).collect())?;
        let stats = FlowStats::collect(&points, &matches);

        tracing::debug!(
            pixels = stats.pixels,
            valid_points = stats.valid_points,
            matched = stats.matched,
            "flow forward (cuda)"
        );

        Ok(FlowOutput {
            points,
            data,
            matches,
            stats,
            timing: collector.finish(),
        })
    }

    fn copy_matched<T: FlowScalar>(
        &self,
        data: &Tensor4<T>,
        matches_gpu: &Handle,
        shape: Shape4,
    ) -> Result<Vec<f32>> {
        let num_elements = shape.len();
        let data_gpu = self.client.create(f32::as_bytes(&narrow(data.as_slice())));
        let output_gpu = self.client.empty(num_elements * std::mem::size_of::<f32>());

        unsafe {
            copy_matched_data_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                cube_count(num_elements),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&data_gpu, num_elements, 1),
                ArrayArg::from_raw_parts::<i32>(matches_gpu, shape.pixels(), 1),
                ScalarArg::new(to_u32(shape.channels, "channel count")?),
                ScalarArg::new(to_u32(shape.pixels_per_image(), "image size")?),
                ScalarArg::new(to_u32(num_elements, "data length")?),
                ArrayArg::from_raw_parts::<f32>(&output_gpu, num_elements, 1),
            );
        }

        Ok(f32::from_bytes(&self.client.read_one(output_gpu)).to_vec())
    }

    /// Upload both clouds and launch the matching kernel, returning the
    /// device handle of the match indices.
    fn launch_matches<T: FlowScalar>(
        &self,
        previous: &PointGrid<T>,
        current: &PointGrid<T>,
        params: &MatchParams<T>,
    ) -> Result<Handle> {
        let shape = current.shape();
        let pixels = shape.pixels();
        let grid = LaunchGrid::new(shape, params.radius)?;

        let (cur_coords, cur_mask) = current.to_coords_and_mask();
        let (prev_coords, prev_mask) = previous.to_coords_and_mask();

        let cur_points_gpu = self.client.create(f32::as_bytes(&cur_coords));
        let cur_valid_gpu = self.client.create(u32::as_bytes(&cur_mask));
        let prev_points_gpu = self.client.create(f32::as_bytes(&prev_coords));
        let prev_valid_gpu = self.client.create(u32::as_bytes(&prev_mask));
        let matches_gpu = self.client.empty(pixels * std::mem::size_of::<i32>());

        unsafe {
            flow_match_points_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                cube_count(pixels),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&cur_points_gpu, pixels * 3, 1),
                ArrayArg::from_raw_parts::<u32>(&cur_valid_gpu, pixels, 1),
                ArrayArg::from_raw_parts::<f32>(&prev_points_gpu, pixels * 3, 1),
                ArrayArg::from_raw_parts::<u32>(&prev_valid_gpu, pixels, 1),
                ScalarArg::new(grid.width),
                ScalarArg::new(grid.height),
                ScalarArg::new(grid.num_pixels),
                ScalarArg::new(grid.radius),
                ScalarArg::new(params.threshold.to_gpu()),
                ArrayArg::from_raw_parts::<i32>(&matches_gpu, pixels, 1),
            );
        }

        Ok(matches_gpu)
    }

    /// Match every current point against the previous cloud.
    pub fn matches<T: FlowScalar>(
        &self,
        previous: &PointGrid<T>,
        current: &PointGrid<T>,
        params: &MatchParams<T>,
    ) -> Result<MatchMap> {
        let shape = current.shape();
        if shape.pixels() == 0 {
            return Ok(MatchMap::new(shape.batch, shape.height, shape.width, Vec::new())?);
        }

        let matches_gpu = self.launch_matches(previous, current, params)?;
        let indices = i32::from_bytes(&self.client.read_one(matches_gpu)).to_vec();
        Ok(MatchMap::from_indices(
            shape.batch,
            shape.height,
            shape.width,
            &indices,
        )?)
    }

    /// Backward pass on the GPU. Inputs must already be validated.
    pub fn backward<T: FlowScalar>(
        &self,
        previous: &PointGrid<T>,
        current: &PointGrid<T>,
        grad: &Tensor4<T>,
        params: &MatchParams<T>,
    ) -> Result<Tensor4<T>> {
        let shape = grad.shape();
        if shape.is_empty() {
            return Ok(Tensor4::zeros(shape));
        }

        let mut collector = TimingCollector::new();
        collector.start();

        let grid = LaunchGrid::new(shape, params.radius)?;
        let matches_gpu = crate::time_phase!(collector, crate::timing::PHASE_MATCH, {
            self.launch_matches(previous, current, params)?
        });

        let num_elements = shape.len();
        let grad_gpu = self.client.create(f32::as_bytes(&narrow(grad.as_slice())));
        let output_gpu = self.client.empty(num_elements * std::mem::size_of::<f32>());

        crate::time_phase!(collector, crate::timing::PHASE_TRANSFER, unsafe {
            gather_gradient_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                cube_count(num_elements),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&grad_gpu, num_elements, 1),
                ArrayArg::from_raw_parts::<i32>(&matches_gpu, shape.pixels(), 1),
                ScalarArg::new(grid.width),
                ScalarArg::new(grid.height),
                ScalarArg::new(to_u32(shape.channels, "channel count")?),
                ScalarArg::new(grid.radius),
                ScalarArg::new(to_u32(num_elements, "gradient length")?),
                ArrayArg::from_raw_parts::<f32>(&output_gpu, num_elements, 1),
            );
        });

        let out = f32::from_bytes(&self.client.read_one(output_gpu)).to_vec();
        let timing = collector.finish();
        tracing::debug!(
            pixels = shape.pixels(),
            total_ms = timing.total_ms,
            "flow backward (cuda)"
        );

        Ok(Tensor4::from_vec(
            shape,
            out.into_iter().map(T::from_gpu).collect(),
        )?)
    }
}

/// Check if CUDA is available on this system.
pub fn is_cuda_available() -> bool {
    std::panic::catch_unwind(|| {
        let _device = CudaDevice::new(0);
    })
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backward::gather_gradient;
    use crate::config::{Backend, FlowConfig};
    use crate::dispatch::Strategy;
    use crate::forward::flow_forward;
    use crate::matching::{compute_matches, PixelMatch};
    use crate::test_utils::make_random_frame;

    macro_rules! require_cuda {
        () => {
            if !is_cuda_available() {
                crate::test_println!("Skipping test: CUDA not available");
                return;
            }
        };
    }

    #[test]
    fn test_cuda_availability() {
        let _available = is_cuda_available();
        crate::test_println!("CUDA available: {_available}");
    }

    /// The device compiler contracts `a * b + c` into fused multiply-adds,
    /// so coordinates can differ from the CPU in the last bits. A match
    /// decision may only flip where the two candidates (or a candidate and
    /// the threshold) are within that rounding of each other.
    #[test]
    fn test_forward_gpu_vs_cpu_up_to_fma_rounding() {
        require_cuda!();

        let runtime = GpuFlowRuntime::new().expect("Failed to create GPU runtime");
        let frame = make_random_frame::<f32>(2, 24, 32, 3, 7);
        let config = FlowConfig {
            backend: Backend::Sequential,
            ..FlowConfig::new(2, 0.3)
        };
        let params = MatchParams::from_config(&config);

        let cpu = flow_forward(
            &frame.data,
            &frame.previous,
            &frame.depth,
            &frame.cameras,
            &config,
        )
        .unwrap();
        let gpu = runtime
            .forward(
                &frame.data,
                &frame.previous,
                &frame.depth,
                &frame.cameras,
                &params,
            )
            .unwrap();

        assert_eq!(gpu.stats.valid_points, cpu.stats.valid_points);
        for (g, c) in gpu.points.points().iter().zip(cpu.points.points()) {
            match (g.point(), c.point()) {
                (Some(g), Some(c)) => assert!((g - c).norm() < 1e-4),
                (None, None) => {}
                _ => panic!("validity differs between GPU and CPU"),
            }
        }

        let shape = frame.data.shape();
        let distance_to = |n: usize, h: usize, w: usize, m: Option<PixelMatch>| -> f32 {
            let query = cpu.points.get(n, h, w).point().copied();
            match (query, m) {
                (Some(q), Some(m)) => frame
                    .previous
                    .get(n, m.y, m.x)
                    .point()
                    .map_or(f32::INFINITY, |p| (q - p).norm()),
                _ => params.threshold,
            }
        };
        let mut differing = 0;
        for (index, (g, c)) in gpu
            .matches
            .as_slice()
            .iter()
            .zip(cpu.matches.as_slice())
            .enumerate()
        {
            if g == c {
                continue;
            }
            differing += 1;
            let (n, h, w) = shape.pixel_coords(index);
            let dg = distance_to(n, h, w, *g);
            let dc = distance_to(n, h, w, *c);
            assert!(
                (dg - dc).abs() < 1e-4,
                "pixel ({n}, {h}, {w}): GPU {g:?} at {dg}, CPU {c:?} at {dc}"
            );
        }
        crate::test_println!(
            "GPU matched {} / CPU matched {}, {differing} near-tie decisions differ",
            gpu.stats.matched,
            cpu.stats.matched
        );
    }

    #[test]
    fn test_backward_gpu_vs_cpu() {
        require_cuda!();

        let runtime = GpuFlowRuntime::new().expect("Failed to create GPU runtime");
        let frame = make_random_frame::<f32>(1, 20, 20, 2, 8);
        let config = FlowConfig::new(1, 0.3);
        let params = MatchParams::from_config(&config);
        let current = crate::test_utils::previous_from_depth(&frame.depth, &frame.cameras);

        // Same points on both sides, so the match maps must agree exactly.
        let gpu_matches = runtime.matches(&frame.previous, &current, &params).unwrap();
        let cpu_matches = compute_matches(&frame.previous, &current, &params, Strategy::Parallel);
        assert_eq!(gpu_matches, cpu_matches);

        let grad = Tensor4::filled(frame.data.shape(), 0.5f32);
        let gpu = runtime
            .backward(&frame.previous, &current, &grad, &params)
            .unwrap();
        let cpu = gather_gradient(&grad, &cpu_matches, params.radius, Strategy::Sequential);
        assert_eq!(gpu, cpu);
    }

    #[test]
    fn test_empty_inputs() {
        require_cuda!();

        let runtime = GpuFlowRuntime::new().expect("Failed to create GPU runtime");
        let params = MatchParams::new(1, 0.5f32);
        let empty = PointGrid::<f32>::invalid(0, 4, 4);
        let grad = Tensor4::<f32>::zeros(Shape4::new(0, 4, 4, 2));

        assert_eq!(runtime.matches(&empty, &empty, &params).unwrap().num_matched(), 0);
        assert!(runtime
            .backward(&empty, &empty, &grad, &params)
            .unwrap()
            .as_slice()
            .is_empty());
    }
}
