//! Compute-device abstraction.
//!
//! Everything above this module programs against [`Device`]: buffers are
//! ref-counted handles, programs compile into an [`Executable`], named
//! [`Function`]s carry positional arguments, and every submission returns an
//! [`Event`]. Two backends exist:
//!
//! - [`host::HostDevice`] runs native kernels on the CPU, synchronously and in
//!   queue order. Always available.
//! - `wgpu_backend::WgpuDevice` runs WGSL programs (feature `gpu`).
//!
//! ## Usage
//! ```ignore
//! let device = compute::create_device(Platform::Host)?;
//! let exe = device.compile_executable(&source, &BuildOptions::new())?;
//! let f = exe.create_function("AccumulateData")?;
//! f.set_arg(0, &input);
//! f.set_arg(1, n as i32);
//! f.set_arg(2, &accum);
//! device.execute(&f, 0, WorkSize::d1(align_up(n, 64)), WorkSize::d1(64), None)?;
//! ```

pub mod host;
pub mod primitives;
#[cfg(feature = "gpu")]
pub mod wgpu_backend;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::util::{Error, Result};

pub use host::{HostDevice, HostLaunch};
pub use primitives::ParallelPrimitives;

/// Queue index. Devices expose a single queue, index 0.
pub type Queue = u32;

/// Compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// CPU reference backend
    Host,
    /// wgpu (Vulkan / Metal / DX12)
    Wgpu,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Wgpu => write!(f, "wgpu"),
        }
    }
}

/// Device capabilities.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub name: String,
    pub vendor: String,
    pub max_alloc_size: u64,
    pub global_mem_size: u64,
}

/// Access mode a buffer is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    Read,
    Write,
    ReadWrite,
}

/// Map direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    Read,
    Write,
}

/// 1-D or 2-D launch extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSize {
    pub x: usize,
    pub y: usize,
}

impl WorkSize {
    pub const fn d1(x: usize) -> Self {
        Self { x, y: 1 }
    }

    pub const fn d2(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    pub fn total(&self) -> usize {
        self.x * self.y
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum BufferStorage {
    /// Word-backed so typed views of 4-byte records need no copy.
    Host(RwLock<Vec<u32>>),
    #[cfg(feature = "gpu")]
    Wgpu(wgpu::Buffer),
}

pub(crate) struct BufferInner {
    id: u64,
    size: usize,
    kind: BufferType,
    storage: BufferStorage,
}

/// Device buffer handle. Cloning shares the allocation; it is released when
/// the last handle drops.
#[derive(Clone)]
pub struct Buffer(Arc<BufferInner>);

impl Buffer {
    pub(crate) fn from_storage(size: usize, kind: BufferType, storage: BufferStorage) -> Self {
        Self(Arc::new(BufferInner {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            size,
            kind,
            storage,
        }))
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// Process-unique allocation id.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn kind(&self) -> BufferType {
        self.0.kind
    }

    /// Whether two handles refer to the same allocation.
    pub fn same_allocation(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles to this allocation.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub(crate) fn storage(&self) -> &BufferStorage {
        &self.0.storage
    }

    pub(crate) fn host_words(&self) -> Option<&RwLock<Vec<u32>>> {
        match &self.0.storage {
            BufferStorage::Host(words) => Some(words),
            #[cfg(feature = "gpu")]
            _ => None,
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer(#{}, {} bytes)", self.0.id, self.0.size)
    }
}

/// Completion token for a submission.
#[derive(Debug, Clone)]
pub enum Event {
    /// Work already finished (host backend).
    Complete,
    #[cfg(feature = "gpu")]
    Submitted(Arc<wgpu::Device>),
}

impl Event {
    /// Block until the submission completes.
    pub fn wait(&self) -> Result<()> {
        match self {
            Self::Complete => Ok(()),
            #[cfg(feature = "gpu")]
            Self::Submitted(device) => device
                .poll(wgpu::PollType::wait_indefinitely())
                .map(|_| ())
                .map_err(|e| Error::state(format!("device poll failed: {e}"))),
        }
    }
}

/// Preprocessor-style defines handed to the program compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOptions {
    defines: Vec<(String, Option<String>)>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(mut self, name: &str) -> Self {
        self.defines.push((name.to_string(), None));
        self
    }

    pub fn define_value(mut self, name: &str, value: impl ToString) -> Self {
        self.defines.push((name.to_string(), Some(value.to_string())));
        self
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.iter().any(|(n, _)| n == name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.defines
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn defines(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.defines.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.defines.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match value {
                Some(v) => write!(f, "-D {}={}", name, v)?,
                None => write!(f, "-D {}", name)?,
            }
        }
        Ok(())
    }
}

/// Host entry point signature.
pub type NativeKernel = fn(&mut HostLaunch<'_>) -> Result<()>;

/// A statically linked set of host kernels.
pub struct NativeLibrary {
    pub name: &'static str,
    pub kernels: &'static [(&'static str, NativeKernel)],
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("name", &self.name)
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

impl NativeLibrary {
    pub fn find(&self, name: &str) -> Option<NativeKernel> {
        self.kernels
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, k)| *k)
    }
}

/// Where a program comes from.
#[derive(Debug, Clone)]
pub enum ProgramSource {
    /// Source file plus headers prepended in order.
    File { path: PathBuf, headers: Vec<PathBuf> },
    Text(String),
    /// Source compiled into the binary.
    Embedded(&'static str),
    Native(&'static NativeLibrary),
}

impl ProgramSource {
    /// Resolve text sources, reading files from disk.
    pub fn load_text(&self) -> Result<String> {
        match self {
            Self::File { path, headers } => {
                let mut text = String::new();
                for h in headers {
                    text.push_str(&std::fs::read_to_string(h)?);
                    text.push('\n');
                }
                text.push_str(&std::fs::read_to_string(path)?);
                Ok(text)
            }
            Self::Text(s) => Ok(s.clone()),
            Self::Embedded(s) => Ok((*s).to_string()),
            Self::Native(lib) => Err(Error::invalid(format!(
                "native library {} has no text source",
                lib.name
            ))),
        }
    }
}

pub(crate) enum ExecutableKind {
    Native(&'static NativeLibrary),
    #[cfg(feature = "gpu")]
    Wgpu(Arc<wgpu_backend::WgpuProgram>),
}

/// A compiled program.
pub struct Executable {
    pub(crate) kind: ExecutableKind,
    pub(crate) options: Arc<BuildOptions>,
}

impl Executable {
    /// Look up a named entry point.
    pub fn create_function(&self, name: &str) -> Result<Function> {
        let entry = match &self.kind {
            ExecutableKind::Native(lib) => {
                let kernel = lib.find(name).ok_or_else(|| {
                    Error::compile(format!("entry point {} not found in {}", name, lib.name))
                })?;
                FunctionEntry::Native(kernel)
            }
            #[cfg(feature = "gpu")]
            ExecutableKind::Wgpu(program) => {
                if !program.has_entry_point(name) {
                    return Err(Error::compile(format!("entry point {} not found", name)));
                }
                FunctionEntry::Wgpu(program.clone(), Mutex::new(None))
            }
        };
        Ok(Function {
            name: name.to_string(),
            entry,
            options: self.options.clone(),
            args: Mutex::new(SmallVec::new()),
        })
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExecutableKind::Native(lib) => write!(f, "Executable(native {})", lib.name),
            #[cfg(feature = "gpu")]
            ExecutableKind::Wgpu(_) => write!(f, "Executable(wgsl)"),
        }
    }
}

/// Positional kernel argument.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(Buffer),
    Int(i32),
    Uint(u32),
    Float(f32),
}

impl From<&Buffer> for KernelArg {
    fn from(b: &Buffer) -> Self {
        Self::Buffer(b.clone())
    }
}

impl From<i32> for KernelArg {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for KernelArg {
    fn from(v: u32) -> Self {
        Self::Uint(v)
    }
}

impl From<f32> for KernelArg {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

pub(crate) enum FunctionEntry {
    Native(NativeKernel),
    #[cfg(feature = "gpu")]
    Wgpu(
        Arc<wgpu_backend::WgpuProgram>,
        Mutex<Option<wgpu_backend::PipelineCache>>,
    ),
}

pub(crate) type ArgList = SmallVec<[Option<KernelArg>; 32]>;

/// A named entry point with its bound arguments.
pub struct Function {
    name: String,
    pub(crate) entry: FunctionEntry,
    pub(crate) options: Arc<BuildOptions>,
    args: Mutex<ArgList>,
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind argument `index`. Arguments stay bound across launches.
    pub fn set_arg(&self, index: usize, arg: impl Into<KernelArg>) {
        let mut args = self.args.lock();
        if args.len() <= index {
            args.resize(index + 1, None);
        }
        args[index] = Some(arg.into());
    }

    pub(crate) fn args_snapshot(&self) -> ArgList {
        self.args.lock().clone()
    }

    pub fn num_args(&self) -> usize {
        self.args.lock().len()
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.name)
    }
}

/// A compute device with one in-order queue.
pub trait Device: Send + Sync + fmt::Debug {
    fn platform(&self) -> Platform;

    fn spec(&self) -> DeviceSpec;

    /// Allocate `size` bytes, zeroed unless `init` is given.
    fn create_buffer(&self, size: usize, kind: BufferType, init: Option<&[u8]>) -> Result<Buffer>;

    /// Map a byte range, hand it to `f`, then unmap.
    fn map_buffer(
        &self,
        buffer: &Buffer,
        queue: Queue,
        offset: usize,
        size: usize,
        map: MapType,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<Event>;

    /// Blocking read of `out.len()` bytes at `offset`.
    fn read_buffer(&self, buffer: &Buffer, queue: Queue, offset: usize, out: &mut [u8]) -> Result<()>;

    fn write_buffer(&self, buffer: &Buffer, queue: Queue, offset: usize, data: &[u8]) -> Result<Event>;

    /// Repeat `pattern` over `size` bytes at `offset`.
    fn fill_buffer(
        &self,
        buffer: &Buffer,
        queue: Queue,
        pattern: &[u8],
        offset: usize,
        size: usize,
    ) -> Result<Event>;

    fn copy_buffer(
        &self,
        src: &Buffer,
        dst: &Buffer,
        queue: Queue,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    ) -> Result<Event>;

    fn compile_executable(&self, source: &ProgramSource, options: &BuildOptions) -> Result<Executable>;

    fn execute(
        &self,
        function: &Function,
        queue: Queue,
        global: WorkSize,
        local: WorkSize,
        wait: Option<&Event>,
    ) -> Result<Event>;

    /// Block until all queued work completes.
    fn finish(&self, queue: Queue) -> Result<()>;

    /// Submit queued work without waiting.
    fn flush(&self, queue: Queue) -> Result<()>;
}

/// Typed helpers over [`Device`].
pub trait DeviceExt: Device {
    /// Buffer initialised from a slice of records.
    fn create_buffer_from<T: bytemuck::Pod>(&self, kind: BufferType, data: &[T]) -> Result<Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.create_buffer(bytes.len(), kind, Some(bytes))
    }

    /// Read the first `count` records of a buffer.
    fn read_pod<T: bytemuck::Pod>(&self, buffer: &Buffer, count: usize) -> Result<Vec<T>> {
        let size = count * std::mem::size_of::<T>();
        if size > buffer.size() {
            return Err(Error::invalid(format!(
                "read of {} bytes from {:?}",
                size, buffer
            )));
        }
        let mut bytes = vec![0u8; size];
        self.read_buffer(buffer, 0, 0, &mut bytes)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    fn write_pod<T: bytemuck::Pod>(&self, buffer: &Buffer, data: &[T]) -> Result<Event> {
        self.write_buffer(buffer, 0, 0, bytemuck::cast_slice(data))
    }
}

impl<D: Device + ?Sized> DeviceExt for D {}

/// Open a device for `platform`.
pub fn create_device(platform: Platform) -> Result<Arc<dyn Device>> {
    match platform {
        Platform::Host => Ok(Arc::new(HostDevice::new())),
        #[cfg(feature = "gpu")]
        Platform::Wgpu => Ok(Arc::new(wgpu_backend::WgpuDevice::new()?)),
        #[cfg(not(feature = "gpu"))]
        Platform::Wgpu => Err(Error::UnsupportedPlatform(
            "wgpu backend not compiled in (enable feature \"gpu\")".to_string(),
        )),
    }
}

/// Pick a program for `platform`: the native library on the host, otherwise
/// the embedded source when present or `file` under the kernel directory
/// (`WFPT_KERNEL_DIR`, default `kernels`).
pub fn select_source(
    platform: Platform,
    native: &'static NativeLibrary,
    file: &str,
    embedded: Option<&'static str>,
) -> ProgramSource {
    match platform {
        Platform::Host => ProgramSource::Native(native),
        Platform::Wgpu => match embedded {
            Some(text) if !text.is_empty() => ProgramSource::Embedded(text),
            _ => {
                let dir = std::env::var("WFPT_KERNEL_DIR").unwrap_or_else(|_| "kernels".to_string());
                ProgramSource::File {
                    path: PathBuf::from(dir).join(file),
                    headers: Vec::new(),
                }
            }
        },
    }
}

/// Reject allocations above the device limit.
pub(crate) fn check_alloc(size: usize, max: u64) -> Result<()> {
    if size as u64 > max {
        return Err(Error::AllocationFailure {
            requested: size as u64,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_options_display() {
        let opts = BuildOptions::new()
            .define("RR_RAY_MASK")
            .define_value("KERNEL_TYPE", 2);
        assert_eq!(opts.to_string(), "-D RR_RAY_MASK -D KERNEL_TYPE=2");
        assert!(opts.is_defined("RR_RAY_MASK"));
        assert!(!opts.is_defined("USE_SAFE_MATH"));
        assert_eq!(opts.value("KERNEL_TYPE"), Some("2"));
    }

    #[test]
    fn test_buffer_handles_share_allocation() {
        let device = HostDevice::new();
        let a = device.create_buffer(64, BufferType::ReadWrite, None).unwrap();
        let b = a.clone();
        assert!(a.same_allocation(&b));
        assert_eq!(a.handle_count(), 2);
        drop(b);
        assert_eq!(a.handle_count(), 1);
    }

    #[test]
    fn test_set_arg_grows() {
        let device = HostDevice::new();
        let exe = device
            .compile_executable(&ProgramSource::Native(&primitives::PRIMITIVES_LIBRARY), &BuildOptions::new())
            .unwrap();
        let f = exe.create_function("compact_int").unwrap();
        f.set_arg(3, 7i32);
        assert_eq!(f.num_args(), 4);
        assert!(exe.create_function("no_such_kernel").is_err());
    }

    #[test]
    #[cfg(not(feature = "gpu"))]
    fn test_wgpu_unsupported_without_feature() {
        let err = create_device(Platform::Wgpu).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlatform(_)));
    }
}
