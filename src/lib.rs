//! # wavefront-pt
//!
//! Host-side orchestration of a wavefront path tracer.
//!
//! The renderer keeps every ray stream in device memory and advances all
//! pixels one bounce at a time through small kernels, compacting dead paths
//! out between bounces. Closest-hit and any-hit queries go through an
//! intersection engine that builds a BVH on the host, flattens it into
//! two-child "fat" nodes and traverses it with a short per-ray stack.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math types, accelerator options
//! - [`compute`] - Device abstraction (host reference and optional wgpu)
//! - [`bvh`] - Median / SAH / spatial-split builders and the fat-node layout
//! - [`world`] - Shapes as seen by the intersection engine
//! - [`ray`] - Device records: rays, intersections, path state
//! - [`intersector`] - Short-stack BVH intersector
//! - [`api`] - Intersection API facade
//! - [`scene`] - Scene description and the scene compiler
//! - [`renderer`] - Path-tracing driver, outputs and working set
//!
//! ## Example
//!
//! ```ignore
//! use wavefront_pt::prelude::*;
//!
//! let device = create_device(Platform::Host)?;
//! let mut renderer = PtRenderer::new(device, 5)?;
//! let out = renderer.create_output(320, 240)?;
//! renderer.set_output(OutputType::Color, out.clone())?;
//!
//! let scene = demo::cornell_box()?;
//! for _ in 0..16 {
//!     renderer.render(&scene)?;
//! }
//! let image = out.resolve(renderer.device().as_ref())?;
//! ```

pub mod util;
pub mod compute;
pub mod bvh;
pub mod world;
pub mod ray;
pub mod intersector;
pub mod api;
pub mod scene;
pub mod renderer;

/// Kernel sources compiled into the binary.
#[cfg(feature = "embed-kernels")]
pub mod embedded {
    include!(concat!(env!("OUT_DIR"), "/kernels.rs"));
}

pub use util::{Error, Result};

/// Build date stamped by the build script.
pub const BUILD_DATE: &str = env!("WFPT_BUILD_DATE");
/// Build time stamped by the build script.
pub const BUILD_TIME: &str = env!("WFPT_BUILD_TIME");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api::{IntersectionApi, RayBuffer};
    pub use crate::compute::{create_device, Device, DeviceExt, HostDevice, Platform};
    pub use crate::renderer::{BenchmarkStats, Output, OutputType, PtRenderer};
    pub use crate::scene::{demo, Camera, Light, Material, Scene, SceneMesh};
    pub use crate::util::{Error, Mat4, Result, Vec3};
}
