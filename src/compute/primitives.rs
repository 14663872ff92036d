//! Parallel primitives over device buffers.
//!
//! Only stream compaction is needed by the renderer: given a predicate array
//! and an input array, write the inputs whose predicate is non-zero to the
//! output, in their original order, and store the survivor count.

use rayon::prelude::*;
use std::sync::Arc;

use super::{
    select_source, Buffer, BuildOptions, Device, Event, Function, HostLaunch, NativeLibrary,
    Queue, WorkSize,
};
use crate::util::{align_up, Result};

/// Launch group size for the primitives program.
pub const PRIMITIVES_GROUP_SIZE: usize = 64;

/// Host implementation of the primitives program.
pub static PRIMITIVES_LIBRARY: NativeLibrary = NativeLibrary {
    name: "parallel_primitives",
    kernels: &[("compact_int", compact_int)],
};

#[cfg(feature = "embed-kernels")]
const EMBEDDED: Option<&str> = Some(crate::embedded::PARALLEL_PRIMITIVES);
#[cfg(not(feature = "embed-kernels"))]
const EMBEDDED: Option<&str> = None;

/// Compaction driver bound to one device.
pub struct ParallelPrimitives {
    device: Arc<dyn Device>,
    compact: Function,
}

impl ParallelPrimitives {
    pub fn new(device: Arc<dyn Device>) -> Result<Self> {
        let source = select_source(
            device.platform(),
            &PRIMITIVES_LIBRARY,
            "parallel_primitives.wgsl",
            EMBEDDED,
        );
        let exe = device.compile_executable(&source, &BuildOptions::new())?;
        let compact = exe.create_function("compact_int")?;
        Ok(Self { device, compact })
    }

    /// Stable compaction of `input` by `predicate` into `output`; the number of
    /// survivors lands in `count[0]`. Element count is the predicate length.
    pub fn compact(
        &self,
        queue: Queue,
        predicate: &Buffer,
        input: &Buffer,
        output: &Buffer,
        count: &Buffer,
    ) -> Result<Event> {
        let n = predicate.size() / std::mem::size_of::<i32>();
        self.compact.set_arg(0, predicate);
        self.compact.set_arg(1, input);
        self.compact.set_arg(2, n as i32);
        self.compact.set_arg(3, output);
        self.compact.set_arg(4, count);
        self.device.execute(
            &self.compact,
            queue,
            WorkSize::d1(align_up(n.max(1), PRIMITIVES_GROUP_SIZE)),
            WorkSize::d1(PRIMITIVES_GROUP_SIZE),
            None,
        )
    }
}

/// (predicate, input, n, output, count)
fn compact_int(launch: &mut HostLaunch<'_>) -> Result<()> {
    let predicate: Vec<i32> = launch.read(0)?;
    let input: Vec<i32> = launch.read(1)?;
    let n = (launch.int(2)?.max(0) as usize).min(predicate.len()).min(input.len());

    let survivors: Vec<i32> = (0..n)
        .into_par_iter()
        .filter(|&i| predicate[i] != 0)
        .map(|i| input[i])
        .collect();

    let count = survivors.len() as i32;
    launch.write(3, &survivors)?;
    launch.write(4, &[count])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{BufferType, DeviceExt, HostDevice};

    #[test]
    fn test_compact_is_stable() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let pp = ParallelPrimitives::new(device.clone()).unwrap();

        let hits = [1, 0, 1, 1, 0, 0, 1, 0];
        let iota: Vec<i32> = (0..8).collect();
        let predicate = device.create_buffer_from(BufferType::ReadWrite, &hits).unwrap();
        let input = device.create_buffer_from(BufferType::Read, &iota).unwrap();
        let output = device.create_buffer(8 * 4, BufferType::ReadWrite, None).unwrap();
        let count = device.create_buffer(4, BufferType::ReadWrite, None).unwrap();

        pp.compact(0, &predicate, &input, &output, &count).unwrap();

        assert_eq!(device.read_pod::<i32>(&count, 1).unwrap(), vec![4]);
        assert_eq!(device.read_pod::<i32>(&output, 4).unwrap(), vec![0, 2, 3, 6]);
    }

    #[test]
    fn test_compact_none_alive() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let pp = ParallelPrimitives::new(device.clone()).unwrap();

        let predicate = device.create_buffer(16 * 4, BufferType::ReadWrite, None).unwrap();
        let iota: Vec<i32> = (0..16).collect();
        let input = device.create_buffer_from(BufferType::Read, &iota).unwrap();
        let output = device.create_buffer(16 * 4, BufferType::ReadWrite, None).unwrap();
        let count = device.create_buffer_from(BufferType::ReadWrite, &[99i32]).unwrap();

        pp.compact(0, &predicate, &input, &output, &count).unwrap();
        assert_eq!(device.read_pod::<i32>(&count, 1).unwrap(), vec![0]);
    }
}
