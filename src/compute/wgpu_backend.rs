//! wgpu backend (feature `gpu`).
//!
//! Programs are WGSL. Build options are prepended as module-scope constants
//! (`const RR_RAY_MASK: i32 = 1;`). Kernel argument `i` binds to
//! `@group(0) @binding(i)` as a read-write storage buffer; scalar arguments
//! are uploaded into 4-byte storage buffers per launch.

use std::sync::mpsc;
use std::sync::Arc;

use super::{
    check_alloc, Buffer, BufferStorage, BufferType, BuildOptions, Device, DeviceSpec, Event,
    Executable, ExecutableKind, Function, FunctionEntry, KernelArg, MapType, Platform,
    ProgramSource, Queue, WorkSize,
};
use crate::util::{Error, Result};
use wgpu::util::DeviceExt as _;

/// A compiled WGSL module.
pub struct WgpuProgram {
    module: wgpu::ShaderModule,
    source: String,
}

impl WgpuProgram {
    pub(crate) fn has_entry_point(&self, name: &str) -> bool {
        self.source.contains(&format!("fn {}(", name)) || self.source.contains(&format!("fn {} (", name))
    }
}

/// Pipeline built on first launch for a given argument count.
pub(crate) struct PipelineCache {
    num_args: usize,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// GPU device behind wgpu.
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WgpuDevice({} / {:?})", self.info.name, self.info.backend)
    }
}

impl WgpuDevice {
    /// Open the default high-performance adapter.
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::UnsupportedPlatform(format!("no compatible GPU adapter: {e}")))?;

        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("wfpt-device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::UnsupportedPlatform(format!("request_device failed: {e}")))?;

        let info = adapter.get_info();
        tracing::info!(adapter = %info.name, backend = ?info.backend, "wgpu device opened");

        Ok(Self {
            device: Arc::new(device),
            queue,
            info,
            limits,
        })
    }

    fn raw<'a>(&self, buffer: &'a Buffer) -> Result<&'a wgpu::Buffer> {
        match buffer.storage() {
            BufferStorage::Wgpu(b) => Ok(b),
            BufferStorage::Host(_) => Err(Error::invalid(format!(
                "{:?} does not belong to the wgpu device",
                buffer
            ))),
        }
    }

    fn submitted(&self) -> Event {
        Event::Submitted(self.device.clone())
    }

    /// Copy a range into a staging buffer and map it.
    fn read_range(&self, buffer: &Buffer, offset: usize, size: usize) -> Result<Vec<u8>> {
        let raw = self.raw(buffer)?;
        let padded = size.div_ceil(4) * 4;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("wfpt_staging"),
            size: padded.max(4) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("wfpt_readback") });
        encoder.copy_buffer_to_buffer(raw, offset as u64, &staging, 0, padded as u64);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.submitted().wait()?;
        rx.recv()
            .map_err(|e| Error::state(format!("map_async recv failed: {e}")))?
            .map_err(|e| Error::state(format!("map_async failed: {e}")))?;

        let data = slice.get_mapped_range()[..size].to_vec();
        staging.unmap();
        Ok(data)
    }

    fn build_pipeline(&self, program: &WgpuProgram, entry: &str, num_args: usize) -> PipelineCache {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..num_args as u32)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(entry),
            entries: &entries,
        });

        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(entry),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry),
            layout: Some(&pipeline_layout),
            module: &program.module,
            entry_point: Some(entry),
            compilation_options: Default::default(),
            cache: None,
        });

        PipelineCache {
            num_args,
            layout,
            pipeline,
        }
    }
}

/// WGSL constants for each define; valueless defines become `1`.
fn prelude(options: &BuildOptions) -> String {
    let mut out = String::new();
    for (name, value) in options.defines() {
        let value = value.unwrap_or("1");
        let ty = if value.contains('.') { "f32" } else { "i32" };
        out.push_str(&format!("const {}: {} = {};\n", name, ty, value));
    }
    out
}

impl Device for WgpuDevice {
    fn platform(&self) -> Platform {
        Platform::Wgpu
    }

    fn spec(&self) -> DeviceSpec {
        DeviceSpec {
            name: self.info.name.clone(),
            vendor: format!("{:#06x}", self.info.vendor),
            max_alloc_size: self.limits.max_buffer_size,
            global_mem_size: self.limits.max_buffer_size,
        }
    }

    fn create_buffer(&self, size: usize, kind: BufferType, init: Option<&[u8]>) -> Result<Buffer> {
        check_alloc(size, self.limits.max_buffer_size)?;
        let padded = size.div_ceil(4).max(1) * 4;
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        let raw = match init {
            Some(data) => {
                let mut contents = data.to_vec();
                contents.resize(padded, 0);
                self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("wfpt_buffer"),
                    contents: &contents,
                    usage,
                })
            }
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("wfpt_buffer"),
                size: padded as u64,
                usage,
                mapped_at_creation: false,
            }),
        };
        Ok(Buffer::from_storage(size, kind, BufferStorage::Wgpu(raw)))
    }

    fn map_buffer(
        &self,
        buffer: &Buffer,
        _queue: Queue,
        offset: usize,
        size: usize,
        map: MapType,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<Event> {
        match map {
            MapType::Read => {
                let mut data = self.read_range(buffer, offset, size)?;
                f(&mut data);
                Ok(Event::Complete)
            }
            MapType::Write => {
                let mut data = vec![0u8; size];
                f(&mut data);
                self.write_buffer(buffer, 0, offset, &data)
            }
        }
    }

    fn read_buffer(&self, buffer: &Buffer, _queue: Queue, offset: usize, out: &mut [u8]) -> Result<()> {
        let data = self.read_range(buffer, offset, out.len())?;
        out.copy_from_slice(&data);
        Ok(())
    }

    fn write_buffer(&self, buffer: &Buffer, _queue: Queue, offset: usize, data: &[u8]) -> Result<Event> {
        let raw = self.raw(buffer)?;
        let mut padded = data.to_vec();
        padded.resize(data.len().div_ceil(4) * 4, 0);
        self.queue.write_buffer(raw, offset as u64, &padded);
        Ok(self.submitted())
    }

    fn fill_buffer(
        &self,
        buffer: &Buffer,
        queue: Queue,
        pattern: &[u8],
        offset: usize,
        size: usize,
    ) -> Result<Event> {
        if pattern.is_empty() || size % pattern.len() != 0 {
            return Err(Error::invalid("fill size is not a multiple of the pattern"));
        }
        if pattern.iter().all(|&b| b == 0) && offset % 4 == 0 && size % 4 == 0 {
            let raw = self.raw(buffer)?;
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("wfpt_fill") });
            encoder.clear_buffer(raw, offset as u64, Some(size as u64));
            self.queue.submit(Some(encoder.finish()));
            return Ok(self.submitted());
        }
        let data: Vec<u8> = pattern.iter().copied().cycle().take(size).collect();
        self.write_buffer(buffer, queue, offset, &data)
    }

    fn copy_buffer(
        &self,
        src: &Buffer,
        dst: &Buffer,
        _queue: Queue,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    ) -> Result<Event> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("wfpt_copy") });
        encoder.copy_buffer_to_buffer(
            self.raw(src)?,
            src_offset as u64,
            self.raw(dst)?,
            dst_offset as u64,
            size as u64,
        );
        self.queue.submit(Some(encoder.finish()));
        Ok(self.submitted())
    }

    fn compile_executable(&self, source: &ProgramSource, options: &BuildOptions) -> Result<Executable> {
        if let ProgramSource::Native(lib) = source {
            return Err(Error::compile(format!(
                "native library {} cannot run on the wgpu device",
                lib.name
            )));
        }
        let text = format!("{}{}", prelude(options), source.load_text()?);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("wfpt_program"),
            source: wgpu::ShaderSource::Wgsl(text.as_str().into()),
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::compile(err.to_string()));
        }

        Ok(Executable {
            kind: ExecutableKind::Wgpu(Arc::new(WgpuProgram { module, source: text })),
            options: Arc::new(options.clone()),
        })
    }

    fn execute(
        &self,
        function: &Function,
        queue: Queue,
        global: WorkSize,
        local: WorkSize,
        wait: Option<&Event>,
    ) -> Result<Event> {
        if let Some(event) = wait {
            event.wait()?;
        }
        let (program, cache) = match &function.entry {
            FunctionEntry::Wgpu(program, cache) => (program, cache),
            FunctionEntry::Native(_) => {
                return Err(Error::invalid(format!(
                    "{} was not compiled for the wgpu device",
                    function.name()
                )))
            }
        };

        let args = function.args_snapshot();
        let mut scalars: Vec<wgpu::Buffer> = Vec::new();
        let mut bound: Vec<(u32, Option<usize>, Option<&Buffer>)> = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let arg = arg.as_ref().ok_or_else(|| {
                Error::invalid(format!("{}: argument {} not set", function.name(), i))
            })?;
            let bytes = match arg {
                KernelArg::Buffer(b) => {
                    bound.push((i as u32, None, Some(b)));
                    continue;
                }
                KernelArg::Int(v) => v.to_ne_bytes(),
                KernelArg::Uint(v) => v.to_ne_bytes(),
                KernelArg::Float(v) => v.to_ne_bytes(),
            };
            scalars.push(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("wfpt_scalar"),
                contents: &bytes,
                usage: wgpu::BufferUsages::STORAGE,
            }));
            bound.push((i as u32, Some(scalars.len() - 1), None));
        }

        let mut guard = cache.lock();
        if guard.as_ref().map_or(true, |c| c.num_args != args.len()) {
            *guard = Some(self.build_pipeline(program, function.name(), args.len()));
        }
        let Some(cached) = guard.as_ref() else {
            return Err(Error::state("pipeline cache empty"));
        };

        let mut entries = Vec::with_capacity(bound.len());
        for (binding, scalar, buffer) in &bound {
            let resource = match (scalar, buffer) {
                (Some(s), _) => scalars[*s].as_entire_binding(),
                (None, Some(b)) => self.raw(b)?.as_entire_binding(),
                (None, None) => return Err(Error::state("unbound kernel argument")),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(function.name()),
            layout: &cached.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(function.name()) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(function.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&cached.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                global.x.div_ceil(local.x.max(1)) as u32,
                global.y.div_ceil(local.y.max(1)) as u32,
                1,
            );
        }
        self.queue.submit(Some(encoder.finish()));
        tracing::trace!(kernel = function.name(), queue, "dispatched");
        Ok(self.submitted())
    }

    fn finish(&self, _queue: Queue) -> Result<()> {
        self.submitted().wait()
    }

    fn flush(&self, _queue: Queue) -> Result<()> {
        self.queue.submit(std::iter::empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_constants() {
        let opts = BuildOptions::new().define("RR_RAY_MASK").define_value("SCALE", "0.5");
        let text = prelude(&opts);
        assert!(text.contains("const RR_RAY_MASK: i32 = 1;"));
        assert!(text.contains("const SCALE: f32 = 0.5;"));
    }
}
