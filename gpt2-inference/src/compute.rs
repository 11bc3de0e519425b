//! GPU compute backend built on wgpu.
//!
//! A [`ComputeContext`] is created once by the driver and tries to acquire a device exactly once.
//! When that fails the reason is kept and every later dispatch request is answered with
//! [`Error::DeviceUnavailable`] without touching the driver again, so callers can fall back to
//! the CPU cheaply.
//!
//! Each dispatch owns its buffers: inputs are uploaded, the kernel is compiled and run, the
//! output is copied to a staging buffer and read back, and all buffers are destroyed before
//! returning. Nothing is cached across calls.

use crate::error::{Error, Result};
use crate::tensor::Matrix;
use log::{debug, info, warn};
use pollster::block_on;
use std::sync::mpsc;
use wgpu::util::DeviceExt;

/// Invocations per workgroup, passed to every kernel template.
pub const WORKGROUP_SIZE: u32 = 64;

/// Storage binding size needed for the token embedding table (50257 x 768 f32 values).
pub const REQUIRED_STORAGE_BINDING_SIZE: u32 = 154_389_504;

const F32_SIZE: u64 = std::mem::size_of::<f32>() as u64;

/// Source of a WGSL compute kernel, generated for a given workgroup size.
///
/// The kernel must declare one read-only storage buffer per input at bindings `0..n`,
/// the output buffer at binding `n`, and an entry point named `main`.
pub trait KernelTemplate {
    fn render(&self, workgroup_size: u32) -> String;
}

impl<F> KernelTemplate for F
where
    F: Fn(u32) -> String,
{
    fn render(&self, workgroup_size: u32) -> String {
        self(workgroup_size)
    }
}

/// Information about the acquired adapter.
#[derive(Debug, Clone)]
pub struct GpuDeviceInfo {
    pub name: String,
    pub backend: String,
}

/// An acquired wgpu device and its queue.
pub struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: wgpu::Limits,
    info: GpuDeviceInfo,
}

impl GpuDevice {
    /// Requests a high-performance adapter and a device with elevated storage limits.
    pub fn acquire() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| Error::DeviceUnavailable("no compatible GPU adapter found".to_string()))?;

        let mut required_limits = wgpu::Limits::downlevel_defaults();
        required_limits.max_storage_buffer_binding_size = REQUIRED_STORAGE_BINDING_SIZE;
        required_limits.max_buffer_size = required_limits.max_buffer_size.max(REQUIRED_STORAGE_BINDING_SIZE as u64);

        if !required_limits.check_limits(&adapter.limits()) {
            return Err(Error::DeviceUnavailable(format!(
                "adapter cannot bind {REQUIRED_STORAGE_BINDING_SIZE} byte storage buffers"
            )));
        }

        let adapter_info = adapter.get_info();
        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gpt2 compute device"),
                required_features: wgpu::Features::empty(),
                required_limits: required_limits.clone(),
            },
            None,
        ))
        .map_err(|e| Error::DeviceUnavailable(format!("couldn't request logical device: {e}")))?;

        let info = GpuDeviceInfo { name: adapter_info.name, backend: format!("{:?}", adapter_info.backend) };
        info!("🖥️ Using GPU {} ({})", info.name, info.backend);

        Ok(Self { device, queue, limits: required_limits, info })
    }

    /// Whether a dispatch with these input lengths and output length is within device limits.
    pub fn fits(&self, input_lens: &[usize], output_len: usize) -> bool {
        let max_binding = self.limits.max_storage_buffer_binding_size as u64;
        let buffer_ok = |len: usize| len > 0 && len as u64 * F32_SIZE <= max_binding;

        input_lens.len() < self.limits.max_storage_buffers_per_shader_stage as usize
            && input_lens.iter().all(|&len| buffer_ok(len))
            && buffer_ok(output_len)
            && workgroup_count(output_len) <= self.limits.max_compute_workgroups_per_dimension
    }

    /// Runs `kernel` over `inputs` and returns `output_len` values, or `None` when there are no inputs.
    pub fn dispatch(
        &self,
        inputs: &[&[f32]],
        kernel: &dyn KernelTemplate,
        output_len: usize,
    ) -> Result<Option<Vec<f32>>> {
        if inputs.is_empty() {
            warn!("No inputs provided, skipping dispatch");
            return Ok(None);
        }
        if output_len == 0 {
            return Ok(Some(Vec::new()));
        }
        if inputs.iter().any(|input| input.is_empty()) {
            return Err(Error::Dispatch("cannot bind an empty input buffer".to_string()));
        }

        let output_size = output_len as u64 * F32_SIZE;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader_module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("kernel"),
            source: wgpu::ShaderSource::Wgsl(kernel.render(WORKGROUP_SIZE).into()),
        });

        let input_buffers: Vec<wgpu::Buffer> = inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(&format!("input{index}")),
                    contents: bytemuck::cast_slice::<f32, u8>(input),
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                })
            })
            .collect();

        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let output_binding = input_buffers.len() as u32;
        let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = (0..input_buffers.len() as u32)
            .map(|binding| storage_layout_entry(binding, true))
            .chain(std::iter::once(storage_layout_entry(output_binding, false)))
            .collect();

        let bind_group_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel_layout"),
            entries: &layout_entries,
        });

        let bind_entries: Vec<wgpu::BindGroupEntry> = input_buffers
            .iter()
            .chain(std::iter::once(&output_buffer))
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_bind_group"),
            layout: &bind_group_layout,
            entries: &bind_entries,
        });

        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kernel_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("kernel_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: "main",
        });

        if let Some(error) = block_on(self.device.pop_error_scope()) {
            destroy_all(&input_buffers, &output_buffer, &staging_buffer);
            return Err(Error::Dispatch(format!("kernel validation failed: {error}")));
        }

        let workgroups = workgroup_count(output_len);
        debug!("Dispatching {workgroups} workgroups for {output_len} outputs");

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("kernel_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("kernel_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_size);
        self.queue.submit(Some(encoder.finish()));

        let result = self.read_back(&staging_buffer);
        destroy_all(&input_buffers, &output_buffer, &staging_buffer);
        result.map(Some)
    }

    fn read_back(&self, staging_buffer: &wgpu::Buffer) -> Result<Vec<f32>> {
        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| Error::Dispatch("failed to receive GPU map signal".to_string()))?
            .map_err(|e| Error::Dispatch(format!("failed to map staging buffer: {e}")))?;

        let data = buffer_slice.get_mapped_range();
        let values: Vec<f32> = bytemuck::cast_slice::<u8, f32>(&data).to_vec();
        drop(data);
        staging_buffer.unmap();

        Ok(values)
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice").field("info", &self.info).finish_non_exhaustive()
    }
}

fn workgroup_count(output_len: usize) -> u32 {
    output_len.div_ceil(WORKGROUP_SIZE as usize).try_into().unwrap_or(u32::MAX)
}

fn storage_layout_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn destroy_all(inputs: &[wgpu::Buffer], output: &wgpu::Buffer, staging: &wgpu::Buffer) {
    inputs.iter().for_each(wgpu::Buffer::destroy);
    output.destroy();
    staging.destroy();
}

/// Process-wide compute state: at most one device, acquired once.
#[derive(Debug)]
pub struct ComputeContext {
    device: std::result::Result<GpuDevice, String>,
}

impl ComputeContext {
    /// Tries to acquire a GPU. Failure is logged once and remembered.
    pub fn acquire() -> Self {
        let device = GpuDevice::acquire().map_err(|e| {
            warn!("⚠️ {e}. Falling back to CPU.");
            e.to_string()
        });
        Self { device }
    }

    /// A context that never uses the GPU.
    pub fn cpu_only() -> Self {
        Self { device: Err("GPU disabled".to_string()) }
    }

    /// Returns the acquired device or the cached reason it is unavailable.
    pub fn device(&self) -> Result<&GpuDevice> {
        self.device.as_ref().map_err(|reason| Error::DeviceUnavailable(reason.clone()))
    }

    pub fn is_gpu_available(&self) -> bool {
        self.device.is_ok()
    }

    /// Uploads every input as a linear buffer, runs `kernel` and returns `output_len` values.
    ///
    /// The result is flat; reshaping is up to the caller. `None` means there was nothing to dispatch.
    pub fn dispatch(
        &self,
        inputs: &[&Matrix],
        kernel: &dyn KernelTemplate,
        output_len: usize,
    ) -> Result<Option<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(None);
        }

        let device = self.device()?;
        let buffers: Vec<&[f32]> = inputs.iter().map(|m| m.as_slice()).collect();
        device.dispatch(&buffers, kernel, output_len)
    }
}
