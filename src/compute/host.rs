//! CPU reference backend.
//!
//! Kernels are plain Rust functions registered in a [`NativeLibrary`]. They
//! run to completion inside [`Device::execute`], so every returned event is
//! already complete and queue order is program order. Data-parallel work
//! inside a kernel uses rayon.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    check_alloc, ArgList, Buffer, BufferStorage, BufferType, BuildOptions, Device, DeviceSpec,
    Event, Executable, ExecutableKind, Function, FunctionEntry, KernelArg, MapType,
    ProgramSource, Queue, WorkSize,
};
use crate::util::{Error, Result};

/// Default per-allocation limit (1 GiB).
pub const DEFAULT_MAX_ALLOC_SIZE: u64 = 1 << 30;

/// CPU device.
#[derive(Debug)]
pub struct HostDevice {
    max_alloc_size: u64,
    buffers_created: AtomicU64,
    bytes_allocated: AtomicU64,
    dispatch_log: Mutex<Vec<String>>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_max_alloc_size(DEFAULT_MAX_ALLOC_SIZE)
    }

    /// Device with a custom allocation limit.
    pub fn with_max_alloc_size(max_alloc_size: u64) -> Self {
        Self {
            max_alloc_size,
            buffers_created: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            dispatch_log: Mutex::new(Vec::new()),
        }
    }

    /// Total buffers allocated so far.
    pub fn buffers_created(&self) -> u64 {
        self.buffers_created.load(Ordering::Relaxed)
    }

    /// Total bytes allocated so far (never decreases).
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Names of kernels executed since the last [`clear_dispatch_log`](Self::clear_dispatch_log).
    pub fn dispatch_log(&self) -> Vec<String> {
        self.dispatch_log.lock().clone()
    }

    pub fn clear_dispatch_log(&self) {
        self.dispatch_log.lock().clear();
    }

    fn words<'a>(&self, buffer: &'a Buffer) -> Result<&'a RwLock<Vec<u32>>> {
        buffer
            .host_words()
            .ok_or_else(|| Error::invalid(format!("{:?} does not belong to the host device", buffer)))
    }
}

fn check_range(buffer: &Buffer, offset: usize, size: usize) -> Result<()> {
    if offset.checked_add(size).map_or(true, |end| end > buffer.size()) {
        return Err(Error::invalid(format!(
            "range {}..{} out of bounds for {:?}",
            offset,
            offset.saturating_add(size),
            buffer
        )));
    }
    Ok(())
}

impl Device for HostDevice {
    fn platform(&self) -> super::Platform {
        super::Platform::Host
    }

    fn spec(&self) -> DeviceSpec {
        DeviceSpec {
            name: "Host CPU".to_string(),
            vendor: std::env::consts::ARCH.to_string(),
            max_alloc_size: self.max_alloc_size,
            global_mem_size: self.max_alloc_size.saturating_mul(4),
        }
    }

    fn create_buffer(&self, size: usize, kind: BufferType, init: Option<&[u8]>) -> Result<Buffer> {
        check_alloc(size, self.max_alloc_size)?;
        let mut words = vec![0u32; size.div_ceil(4)];
        if let Some(data) = init {
            if data.len() > size {
                return Err(Error::invalid(format!(
                    "initial data of {} bytes for a {} byte buffer",
                    data.len(),
                    size
                )));
            }
            bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..data.len()].copy_from_slice(data);
        }
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
        Ok(Buffer::from_storage(size, kind, BufferStorage::Host(RwLock::new(words))))
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
        check_range(buffer, offset, size)?;
        let words = self.words(buffer)?;
        match map {
            MapType::Write => {
                let mut guard = words.write();
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut guard);
                f(&mut bytes[offset..offset + size]);
            }
            MapType::Read => {
                // Read mappings hand out a copy; writes through it are dropped.
                let mut copy = bytemuck::cast_slice::<u32, u8>(&words.read())[offset..offset + size].to_vec();
                f(&mut copy);
            }
        }
        Ok(Event::Complete)
    }

    fn read_buffer(&self, buffer: &Buffer, _queue: Queue, offset: usize, out: &mut [u8]) -> Result<()> {
        check_range(buffer, offset, out.len())?;
        let words = self.words(buffer)?.read();
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn write_buffer(&self, buffer: &Buffer, _queue: Queue, offset: usize, data: &[u8]) -> Result<Event> {
        check_range(buffer, offset, data.len())?;
        let mut words = self.words(buffer)?.write();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(Event::Complete)
    }

    fn fill_buffer(
        &self,
        buffer: &Buffer,
        _queue: Queue,
        pattern: &[u8],
        offset: usize,
        size: usize,
    ) -> Result<Event> {
        if pattern.is_empty() || size % pattern.len() != 0 {
            return Err(Error::invalid(format!(
                "fill size {} is not a multiple of pattern size {}",
                size,
                pattern.len()
            )));
        }
        check_range(buffer, offset, size)?;
        let mut words = self.words(buffer)?.write();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        for chunk in bytes[offset..offset + size].chunks_exact_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }
        Ok(Event::Complete)
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
        check_range(src, src_offset, size)?;
        check_range(dst, dst_offset, size)?;
        if src.same_allocation(dst) {
            let mut words = self.words(dst)?.write();
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
            bytes.copy_within(src_offset..src_offset + size, dst_offset);
            return Ok(Event::Complete);
        }
        let src_words = self.words(src)?.read();
        let mut dst_words = self.words(dst)?.write();
        let src_bytes: &[u8] = bytemuck::cast_slice(&src_words);
        let dst_bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut dst_words);
        dst_bytes[dst_offset..dst_offset + size].copy_from_slice(&src_bytes[src_offset..src_offset + size]);
        Ok(Event::Complete)
    }

    fn compile_executable(&self, source: &ProgramSource, options: &BuildOptions) -> Result<Executable> {
        match source {
            ProgramSource::Native(lib) => {
                tracing::debug!(library = lib.name, options = %options, "host executable");
                Ok(Executable {
                    kind: ExecutableKind::Native(lib),
                    options: std::sync::Arc::new(options.clone()),
                })
            }
            ProgramSource::File { path, .. } => Err(Error::compile(format!(
                "host device runs native libraries only, got source file {}",
                path.display()
            ))),
            _ => Err(Error::compile("host device runs native libraries only")),
        }
    }

    fn execute(
        &self,
        function: &Function,
        _queue: Queue,
        global: WorkSize,
        local: WorkSize,
        wait: Option<&Event>,
    ) -> Result<Event> {
        if let Some(event) = wait {
            event.wait()?;
        }
        let kernel = match &function.entry {
            FunctionEntry::Native(k) => *k,
            #[cfg(feature = "gpu")]
            _ => {
                return Err(Error::invalid(format!(
                    "{} was not compiled for the host device",
                    function.name()
                )))
            }
        };
        let args = function.args_snapshot();
        self.dispatch_log.lock().push(function.name().to_string());
        let mut launch = HostLaunch {
            name: function.name(),
            args: &args,
            global,
            local,
            options: &function.options,
        };
        kernel(&mut launch)?;
        Ok(Event::Complete)
    }

    fn finish(&self, _queue: Queue) -> Result<()> {
        Ok(())
    }

    fn flush(&self, _queue: Queue) -> Result<()> {
        Ok(())
    }
}

/// Argument view handed to a native kernel.
pub struct HostLaunch<'a> {
    name: &'a str,
    args: &'a ArgList,
    global: WorkSize,
    local: WorkSize,
    options: &'a BuildOptions,
}

impl<'a> HostLaunch<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn global_size(&self) -> WorkSize {
        self.global
    }

    pub fn local_size(&self) -> WorkSize {
        self.local
    }

    /// Whether the program was built with `-D name`.
    pub fn is_defined(&self, name: &str) -> bool {
        self.options.is_defined(name)
    }

    pub fn arg(&self, index: usize) -> Result<&KernelArg> {
        self.args
            .get(index)
            .and_then(|a| a.as_ref())
            .ok_or_else(|| Error::invalid(format!("{}: argument {} not set", self.name, index)))
    }

    pub fn buffer(&self, index: usize) -> Result<&Buffer> {
        match self.arg(index)? {
            KernelArg::Buffer(b) => Ok(b),
            other => Err(self.mismatch(index, "buffer", other)),
        }
    }

    pub fn int(&self, index: usize) -> Result<i32> {
        match self.arg(index)? {
            KernelArg::Int(v) => Ok(*v),
            KernelArg::Uint(v) => Ok(*v as i32),
            other => Err(self.mismatch(index, "int", other)),
        }
    }

    pub fn uint(&self, index: usize) -> Result<u32> {
        match self.arg(index)? {
            KernelArg::Uint(v) => Ok(*v),
            KernelArg::Int(v) => Ok(*v as u32),
            other => Err(self.mismatch(index, "uint", other)),
        }
    }

    pub fn float(&self, index: usize) -> Result<f32> {
        match self.arg(index)? {
            KernelArg::Float(v) => Ok(*v),
            other => Err(self.mismatch(index, "float", other)),
        }
    }

    fn mismatch(&self, index: usize, expected: &str, got: &KernelArg) -> Error {
        Error::invalid(format!(
            "{}: argument {} expected {}, got {:?}",
            self.name, index, expected, got
        ))
    }

    fn words(&self, index: usize) -> Result<&'a RwLock<Vec<u32>>> {
        let buffer = match self.args.get(index).and_then(|a| a.as_ref()) {
            Some(KernelArg::Buffer(b)) => b,
            Some(other) => return Err(self.mismatch(index, "buffer", other)),
            None => {
                return Err(Error::invalid(format!(
                    "{}: argument {} not set",
                    self.name, index
                )))
            }
        };
        buffer
            .host_words()
            .ok_or_else(|| Error::invalid(format!("{}: argument {} is not a host buffer", self.name, index)))
    }

    /// Copy out the whole buffer as records of `T`.
    pub fn read<T: bytemuck::Pod>(&self, index: usize) -> Result<Vec<T>> {
        let size = self.buffer(index)?.size();
        let words = self.words(index)?.read();
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        let whole = size - size % std::mem::size_of::<T>();
        Ok(bytemuck::pod_collect_to_vec(&bytes[..whole]))
    }

    /// First scalar of a one-element buffer (counts passed by buffer).
    pub fn read_scalar<T: bytemuck::Pod>(&self, index: usize) -> Result<T> {
        self.read::<T>(index)?
            .first()
            .copied()
            .ok_or_else(|| Error::invalid(format!("{}: argument {} is empty", self.name, index)))
    }

    /// Borrow the buffer as `&[T]` without copying.
    pub fn view<T: bytemuck::Pod, R>(&self, index: usize, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        let size = self.buffer(index)?.size();
        let words = self.words(index)?.read();
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        let whole = size - size % std::mem::size_of::<T>();
        let typed: &[T] = bytemuck::try_cast_slice(&bytes[..whole])
            .map_err(|e| Error::invalid(format!("{}: argument {}: {}", self.name, index, e)))?;
        Ok(f(typed))
    }

    /// Borrow the buffer as `&mut [T]` without copying.
    pub fn update<T: bytemuck::Pod, R>(&self, index: usize, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let size = self.buffer(index)?.size();
        let mut words = self.words(index)?.write();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        let whole = size - size % std::mem::size_of::<T>();
        let typed: &mut [T] = bytemuck::try_cast_slice_mut(&mut bytes[..whole])
            .map_err(|e| Error::invalid(format!("{}: argument {}: {}", self.name, index, e)))?;
        Ok(f(typed))
    }

    /// Overwrite the start of a buffer.
    pub fn write<T: bytemuck::Pod>(&self, index: usize, data: &[T]) -> Result<()> {
        self.update::<T, ()>(index, |dst| {
            let n = data.len().min(dst.len());
            dst[..n].copy_from_slice(&data[..n]);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::DeviceExt;

    #[test]
    fn test_allocation_limit() {
        let device = HostDevice::with_max_alloc_size(1024);
        assert!(device.create_buffer(1024, BufferType::ReadWrite, None).is_ok());
        let err = device.create_buffer(1025, BufferType::ReadWrite, None).unwrap_err();
        assert!(matches!(err, Error::AllocationFailure { requested: 1025, max: 1024 }));
    }

    #[test]
    fn test_read_write_fill_copy() {
        let device = HostDevice::new();
        let a = device.create_buffer_from(BufferType::ReadWrite, &[1u32, 2, 3, 4]).unwrap();
        let b = device.create_buffer(16, BufferType::ReadWrite, None).unwrap();

        device.fill_buffer(&b, 0, &7u32.to_ne_bytes(), 0, 16).unwrap();
        assert_eq!(device.read_pod::<u32>(&b, 4).unwrap(), vec![7, 7, 7, 7]);

        device.copy_buffer(&a, &b, 0, 4, 0, 8).unwrap();
        assert_eq!(device.read_pod::<u32>(&b, 4).unwrap(), vec![2, 3, 7, 7]);

        device.write_pod(&a, &[9u32]).unwrap();
        assert_eq!(device.read_pod::<u32>(&a, 2).unwrap(), vec![9, 2]);
    }

    #[test]
    fn test_map_write() {
        let device = HostDevice::new();
        let buf = device.create_buffer(8, BufferType::ReadWrite, None).unwrap();
        let event = device
            .map_buffer(&buf, 0, 4, 4, MapType::Write, &mut |bytes| {
                bytes.copy_from_slice(&5u32.to_ne_bytes())
            })
            .unwrap();
        event.wait().unwrap();
        assert_eq!(device.read_pod::<u32>(&buf, 2).unwrap(), vec![0, 5]);
    }

    #[test]
    fn test_out_of_range() {
        let device = HostDevice::new();
        let buf = device.create_buffer(8, BufferType::ReadWrite, None).unwrap();
        let mut out = [0u8; 4];
        assert!(device.read_buffer(&buf, 0, 6, &mut out).is_err());
        assert!(device.fill_buffer(&buf, 0, &[0u8; 3], 0, 8).is_err());
    }

    #[test]
    fn test_rejects_text_programs() {
        let device = HostDevice::new();
        let err = device
            .compile_executable(&ProgramSource::Text("fn main() {}".into()), &BuildOptions::new())
            .unwrap_err();
        assert!(matches!(err, Error::ExecutableCompileFailure { .. }));
    }
}
