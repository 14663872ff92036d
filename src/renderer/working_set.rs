//! Per-pixel device buffers of the wavefront loop.

use rand::Rng;

use crate::api::{IntersectionApi, RayBuffer};
use crate::compute::{Buffer, BufferType, Device, DeviceExt};
use crate::ray::{Intersection, PathState, Ray};
use crate::util::Result;

/// Light samples traced per path vertex.
pub const MAX_LIGHT_SAMPLES: usize = 1;

/// Ray streams, path state and compaction scratch sized for one image.
#[derive(Debug)]
pub struct WorkingSet {
    pub width: u32,
    pub height: u32,

    pub rays: [Buffer; 2],
    pub hits: Buffer,
    pub intersections: Buffer,
    pub shadowrays: Buffer,
    pub shadowhits: Buffer,
    pub lightsamples: Buffer,
    pub paths: Buffer,
    pub random: Buffer,
    pub iota: Buffer,
    pub compacted_indices: Buffer,
    pub pixelindices: [Buffer; 2],
    pub hitcount: Buffer,

    // Intersection-engine views of the buffers above
    pub fr_rays: [RayBuffer; 2],
    pub fr_shadowrays: RayBuffer,
    pub fr_hits: RayBuffer,
    pub fr_shadowhits: RayBuffer,
    pub fr_intersections: RayBuffer,
    pub fr_hitcount: RayBuffer,

    /// Bytes held by the per-pixel buffers.
    pub vidmemws: usize,
}

impl WorkingSet {
    /// Allocate for `width x height` pixels. `random` is filled from `rng`.
    pub fn new(
        device: &dyn Device,
        api: &IntersectionApi,
        width: u32,
        height: u32,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let n = width as usize * height as usize;
        let mut vidmemws = 0usize;
        let mut alloc = |bytes: usize| -> Result<Buffer> {
            vidmemws += bytes;
            device.create_buffer(bytes, BufferType::ReadWrite, None)
        };

        let ray_size = std::mem::size_of::<Ray>();
        let int_size = std::mem::size_of::<i32>();

        let rays = [alloc(n * ray_size)?, alloc(n * ray_size)?];
        let hits = alloc(n * int_size)?;
        let intersections = alloc(n * std::mem::size_of::<Intersection>())?;
        let shadowrays = alloc(n * ray_size * MAX_LIGHT_SAMPLES)?;
        let shadowhits = alloc(n * int_size * MAX_LIGHT_SAMPLES)?;
        let lightsamples = alloc(n * std::mem::size_of::<[f32; 4]>() * MAX_LIGHT_SAMPLES)?;
        let paths = alloc(n * std::mem::size_of::<PathState>())?;
        let compacted_indices = alloc(n * int_size)?;
        let pixelindices = [alloc(n * int_size)?, alloc(n * int_size)?];

        let seeds: Vec<u32> = (0..n).map(|_| rng.gen()).collect();
        let random = device.create_buffer_from(BufferType::ReadWrite, &seeds)?;
        vidmemws += n * int_size;

        let iota_data: Vec<i32> = (0..n as i32).collect();
        let iota = device.create_buffer_from(BufferType::ReadWrite, &iota_data)?;
        vidmemws += n * int_size;

        let hitcount = device.create_buffer(int_size, BufferType::ReadWrite, None)?;

        tracing::info!(
            width,
            height,
            vidmemws_mb = vidmemws / (1024 * 1024),
            "working set allocated"
        );

        Ok(Self {
            width,
            height,
            fr_rays: [
                api.create_from_backend_buffer(&rays[0]),
                api.create_from_backend_buffer(&rays[1]),
            ],
            fr_shadowrays: api.create_from_backend_buffer(&shadowrays),
            fr_hits: api.create_from_backend_buffer(&hits),
            fr_shadowhits: api.create_from_backend_buffer(&shadowhits),
            fr_intersections: api.create_from_backend_buffer(&intersections),
            fr_hitcount: api.create_from_backend_buffer(&hitcount),
            rays,
            hits,
            intersections,
            shadowrays,
            shadowhits,
            lightsamples,
            paths,
            random,
            iota,
            compacted_indices,
            pixelindices,
            hitcount,
            vidmemws,
        })
    }

    /// Pixels the buffers hold.
    pub fn capacity(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether a `width x height` image fits.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.width >= width && self.height >= height
    }
}
