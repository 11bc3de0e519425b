#[cfg(test)]
#[path = "../tests/unit/engine_test.rs"]
mod tests;

use crate::compute::{ComputeContext, KernelTemplate};
use crate::error::{Error, Result};
use crate::tensor::{Matrix, cpu_matmul};
use log::{debug, warn};

/// Products with fewer output elements than this are always computed on the CPU.
pub const GPU_MIN_OUTPUT_ELEMENTS: usize = 4000;

/// Where a multiplication was (or would be) executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cpu,
    Gpu,
}

/// WGSL kernel computing one output element of `A (rows_a x cols_a) * B (cols_a x cols_b)` per invocation.
#[derive(Debug, Clone, Copy)]
pub struct MatmulKernel {
    pub cols_a: usize,
    pub cols_b: usize,
}

impl KernelTemplate for MatmulKernel {
    fn render(&self, workgroup_size: u32) -> String {
        let Self { cols_a, cols_b } = *self;
        format!(
            r#"
@group(0) @binding(0)
var<storage, read> input0: array<f32>;
@group(0) @binding(1)
var<storage, read> input1: array<f32>;
@group(0) @binding(2)
var<storage, read_write> output: array<f32>;

@compute @workgroup_size({workgroup_size})
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {{
    if (global_id.x >= arrayLength(&output)) {{
        return;
    }}
    let row = global_id.x / {cols_b}u;
    let col = global_id.x % {cols_b}u;
    var sum = 0.0;
    for (var i = 0u; i < {cols_a}u; i = i + 1u) {{
        sum = sum + input0[row * {cols_a}u + i] * input1[i * {cols_b}u + col];
    }}
    output[global_id.x] = sum;
}}
"#
        )
    }
}

/// Dense matrix algebra with a per-call choice between CPU and GPU.
///
/// Both paths compute the same product; the choice only affects speed.
#[derive(Debug)]
pub struct MatrixEngine {
    compute: ComputeContext,
    gpu_min_output: usize,
}

impl MatrixEngine {
    pub fn new(compute: ComputeContext) -> Self {
        Self { compute, gpu_min_output: GPU_MIN_OUTPUT_ELEMENTS }
    }

    /// An engine that never dispatches to the GPU.
    pub fn cpu() -> Self {
        Self::new(ComputeContext::cpu_only())
    }

    /// Overrides the output size below which the CPU is used.
    pub fn with_gpu_threshold(mut self, min_output_elements: usize) -> Self {
        self.gpu_min_output = min_output_elements;
        self
    }

    pub fn compute(&self) -> &ComputeContext {
        &self.compute
    }

    /// Picks the backend for `a * b` without running it.
    pub fn plan(&self, a: &Matrix, b: &Matrix) -> Backend {
        let output_len = a.rows() * b.cols();
        if output_len < self.gpu_min_output {
            return Backend::Cpu;
        }

        match self.compute.device() {
            Ok(device) if device.fits(&[a.len(), b.len()], output_len) => Backend::Gpu,
            Ok(_) => {
                debug!("{:?} x {:?} exceeds device limits, using CPU", a.shape(), b.shape());
                Backend::Cpu
            }
            Err(_) => Backend::Cpu,
        }
    }

    /// Multiplies `a (m x k)` by `b (k x n)`.
    pub fn multiply(&self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        if a.cols() != b.rows() {
            return Err(Error::DimensionMismatch { op: "multiply", left: a.shape(), right: b.shape() });
        }

        match self.plan(a, b) {
            Backend::Cpu => cpu_matmul(a, b),
            Backend::Gpu => self.gpu_multiply(a, b),
        }
    }

    fn gpu_multiply(&self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        let kernel = MatmulKernel { cols_a: a.cols(), cols_b: b.cols() };
        let output_len = a.rows() * b.cols();

        match self.compute.dispatch(&[a, b], &kernel, output_len)? {
            Some(flat) => Matrix::from_flat(a.rows(), b.cols(), flat),
            None => {
                warn!("GPU returned no output, recomputing on CPU");
                cpu_matmul(a, b)
            }
        }
    }

    /// Transposes on the CPU; the cost is linear so it is never dispatched.
    pub fn transpose(&self, m: &Matrix) -> Matrix {
        m.transpose()
    }
}
