//! Short-stack BVH intersector.
//!
//! `process` turns a [`World`] into three device buffers: the fat-node blob
//! (nodes followed by the face table), world-space vertices and a traversal
//! stack. `intersect` / `occluded` launch `intersect_main` / `occluded_main`
//! over a batch of rays with arguments
//! `(nodes, vertices, rays, numrays, stack, hits)`.

pub mod kernels;

use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::Arc;

use crate::bvh::{BuildSettings, Bvh, BvhStats, Face, FatBvh};
use crate::compute::{
    select_source, Buffer, BufferType, BuildOptions, Device, Event, Function, MapType, Queue,
    WorkSize,
};
use crate::util::{align_up, BBox, Error, Result};
use crate::world::{Mesh, Shape, ShapeKind, World};

/// Launch group size.
pub const WORK_GROUP_SIZE: usize = 64;
/// Per-ray traversal stack depth; trees must be shallower than this.
pub const MAX_STACK_SIZE: usize = 48;
/// Rays per batch the initial stack is sized for.
pub const MAX_BATCH_SIZE: usize = 1 << 20;

const STACK_BYTES_PER_RAY: usize = MAX_STACK_SIZE * std::mem::size_of::<i32>();

#[cfg(feature = "embed-kernels")]
const EMBEDDED: Option<&str> = Some(crate::embedded::INTERSECT_SHORT_STACK);
#[cfg(not(feature = "embed-kernels"))]
const EMBEDDED: Option<&str> = None;

/// Compiler defines selected by cargo features.
pub fn default_build_options() -> BuildOptions {
    let mut opts = BuildOptions::new();
    if cfg!(feature = "ray-mask") {
        opts = opts.define("RR_RAY_MASK");
    }
    if cfg!(feature = "backface-cull") {
        opts = opts.define("RR_BACKFACE_CULL");
    }
    if cfg!(feature = "safe-math") {
        opts = opts.define("USE_SAFE_MATH");
    }
    opts
}

/// Device-resident acceleration data.
struct GpuData {
    nodes: Buffer,
    vertices: Buffer,
}

/// Fat-node BVH intersector with a per-ray short stack.
pub struct IntersectorShortStack {
    device: Arc<dyn Device>,
    gpu: Option<GpuData>,
    stack: Mutex<Option<Buffer>>,
    isect_func: Function,
    occlude_func: Function,
    stats: Option<BvhStats>,
}

impl std::fmt::Debug for IntersectorShortStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntersectorShortStack")
            .field("ready", &self.gpu.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Shapes reordered meshes-first with their face and vertex offsets.
pub(crate) struct ShapeLayout<'w> {
    pub shapes: Vec<&'w Shape>,
    /// Base mesh per entry (the mesh itself or the instanced mesh).
    pub meshes: Vec<&'w Mesh>,
    pub num_meshes: usize,
    pub faces_start: Vec<usize>,
    pub vertices_start: Vec<usize>,
    pub num_faces: usize,
    pub num_vertices: usize,
}

impl<'w> ShapeLayout<'w> {
    pub fn new(world: &'w World) -> Result<Self> {
        // Stable: meshes first, then instances, each in attach order
        let (mut shapes, instances): (Vec<&Shape>, Vec<&Shape>) =
            world.shapes().iter().partition(|s| !s.is_instance());
        let num_meshes = shapes.len();
        shapes.extend(instances);

        let mut meshes = Vec::with_capacity(shapes.len());
        let mut faces_start = Vec::with_capacity(shapes.len());
        let mut vertices_start = Vec::with_capacity(shapes.len());
        let mut num_faces = 0;
        let mut num_vertices = 0;

        for shape in &shapes {
            let mesh = match &shape.kind {
                ShapeKind::Mesh(m) => m,
                ShapeKind::Instance { base_shape_id, .. } => world
                    .shape(*base_shape_id)
                    .and_then(Shape::as_mesh)
                    .ok_or_else(|| {
                        Error::invalid(format!(
                            "instance {} refers to {} which is not a mesh",
                            shape.id, base_shape_id
                        ))
                    })?,
            };
            faces_start.push(num_faces);
            vertices_start.push(num_vertices);
            num_faces += mesh.num_faces();
            num_vertices += mesh.num_vertices();
            meshes.push(mesh);
        }

        Ok(Self {
            shapes,
            meshes,
            num_meshes,
            faces_start,
            vertices_start,
            num_faces,
            num_vertices,
        })
    }

    /// World-space bounds of every face, in layout order.
    pub fn face_bounds(&self) -> Vec<BBox> {
        let mut bounds = vec![BBox::EMPTY; self.num_faces];
        let mut chunks: Vec<&mut [BBox]> = Vec::with_capacity(self.shapes.len());
        let mut rest = bounds.as_mut_slice();
        for mesh in &self.meshes {
            let (head, tail) = rest.split_at_mut(mesh.num_faces());
            chunks.push(head);
            rest = tail;
        }

        chunks
            .into_par_iter()
            .enumerate()
            .for_each(|(i, out)| {
                let mesh = self.meshes[i];
                if i < self.num_meshes {
                    for (j, b) in out.iter_mut().enumerate() {
                        *b = mesh.face_bounds(j, false);
                    }
                } else {
                    // Instances: object-space bounds moved by the instance transform
                    let m = self.shapes[i].transform();
                    for (j, b) in out.iter_mut().enumerate() {
                        *b = mesh.face_bounds(j, true).transformed(&m);
                    }
                }
            });
        bounds
    }

    /// World-space vertices as `[x, y, z, 1]`, written into `out`.
    pub fn write_vertices(&self, out: &mut [[f32; 4]]) {
        let mut chunks: Vec<&mut [[f32; 4]]> = Vec::with_capacity(self.shapes.len());
        let mut rest = out;
        for mesh in &self.meshes {
            let (head, tail) = rest.split_at_mut(mesh.num_vertices());
            chunks.push(head);
            rest = tail;
        }

        chunks
            .into_par_iter()
            .enumerate()
            .for_each(|(i, out)| {
                let mesh = self.meshes[i];
                let m = self.shapes[i].transform();
                for (dst, v) in out.iter_mut().zip(&mesh.vertices) {
                    let p = m.transform_point3(*v);
                    *dst = [p.x, p.y, p.z, 1.0];
                }
            });
    }

    /// Face table for the builder's reordered primitive ids.
    pub fn face_table(&self, indices: &[u32]) -> Vec<Face> {
        indices
            .par_iter()
            .map(|&prim| {
                let prim = prim as usize;
                // Owning shape: last start index not greater than prim
                let shapeidx = self.faces_start.partition_point(|&start| start <= prim) - 1;
                let mesh = self.meshes[shapeidx];
                let faceidx = prim - self.faces_start[shapeidx];
                let base = self.vertices_start[shapeidx] as i32;
                let f = mesh.faces[faceidx];
                Face {
                    idx: [f[0] as i32 + base, f[1] as i32 + base, f[2] as i32 + base],
                    shapeidx: self.shapes[shapeidx].id,
                    id: faceidx as i32,
                    pad: [self.shapes[shapeidx].mask, 0, 0],
                }
            })
            .collect()
    }
}

impl IntersectorShortStack {
    /// Compile the intersector program with feature-derived defines.
    pub fn new(device: Arc<dyn Device>) -> Result<Self> {
        Self::with_options(device, &default_build_options())
    }

    pub fn with_options(device: Arc<dyn Device>, options: &BuildOptions) -> Result<Self> {
        let source = select_source(
            device.platform(),
            &kernels::INTERSECTOR_LIBRARY,
            "intersect_bvh2_short_stack.wgsl",
            EMBEDDED,
        );
        let executable = device.compile_executable(&source, options)?;
        let isect_func = executable.create_function("intersect_main")?;
        let occlude_func = executable.create_function("occluded_main")?;

        Ok(Self {
            device,
            gpu: None,
            stack: Mutex::new(None),
            isect_func,
            occlude_func,
            stats: None,
        })
    }

    /// Statistics of the last successful build.
    pub fn stats(&self) -> Option<&BvhStats> {
        self.stats.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.gpu.is_some()
    }

    /// Bytes currently held by the traversal stack.
    pub fn stack_size(&self) -> usize {
        self.stack.lock().as_ref().map_or(0, Buffer::size)
    }

    /// Rebuild device data if the world changed since the last call.
    #[tracing::instrument(skip_all, fields(shapes = world.shapes().len()))]
    pub fn process(&mut self, world: &World) -> Result<()> {
        if self.gpu.is_some() && !world.has_changed() && world.state_change().is_none() {
            return Ok(());
        }

        // Release old buffers before building new ones
        self.gpu = None;
        self.stats = None;

        let spec = self.device.spec();
        let required = (MAX_BATCH_SIZE * STACK_BYTES_PER_RAY) as u64;
        if spec.max_alloc_size <= required {
            return Err(Error::exhausted(
                "fatbvh accelerator can't allocate enough stack memory, try using bvh instead",
            ));
        }

        let layout = ShapeLayout::new(world)?;
        let bounds = layout.face_bounds();

        let settings = BuildSettings::from_options(world.options());
        let bvh = Bvh::build(&bounds, &settings);

        if bvh.height() as usize >= MAX_STACK_SIZE {
            return Err(Error::exhausted(format!(
                "fatbvh accelerator can cause stack overflow for this scene (height {}), try using bvh instead",
                bvh.height()
            )));
        }

        let mut fat = FatBvh::translate(&bvh);

        // World-space vertices through a write mapping
        let vertex_bytes = layout.num_vertices * std::mem::size_of::<[f32; 4]>();
        let vertices = self.device.create_buffer(vertex_bytes, BufferType::Read, None)?;
        let event = self.device.map_buffer(
            &vertices,
            0,
            0,
            vertex_bytes,
            MapType::Write,
            &mut |bytes| {
                let mut staged = vec![[0f32; 4]; layout.num_vertices];
                layout.write_vertices(&mut staged);
                bytes.copy_from_slice(bytemuck::cast_slice(&staged));
            },
        )?;
        event.wait()?;

        fat.inject_indices(layout.face_table(bvh.indices()))?;

        let blob = fat.to_blob();
        let nodes = self.device.create_buffer(blob.len(), BufferType::Read, Some(&blob))?;

        {
            let mut stack = self.stack.lock();
            *stack = None;
            *stack = Some(self.device.create_buffer(
                MAX_BATCH_SIZE * STACK_BYTES_PER_RAY,
                BufferType::Write,
                None,
            )?);
        }

        self.device.finish(0)?;

        let stats = bvh.stats(settings.traversal_cost);
        tracing::info!(
            builder = ?settings.builder,
            splits = settings.use_splits,
            faces = layout.num_faces,
            vertices = layout.num_vertices,
            nodes = stats.node_count,
            leaves = stats.leaf_count,
            height = stats.height,
            indices = stats.index_count,
            sah_cost = stats.sah_cost,
            "bvh rebuilt"
        );

        self.stats = Some(stats);
        self.gpu = Some(GpuData { nodes, vertices });
        Ok(())
    }

    /// Closest hit for the first `numrays[0]` rays; `maxrays` sizes the launch.
    pub fn intersect(
        &self,
        queue: Queue,
        rays: &Buffer,
        numrays: &Buffer,
        maxrays: u32,
        hits: &Buffer,
        wait: Option<&Event>,
    ) -> Result<Event> {
        self.launch(&self.isect_func, queue, rays, numrays, maxrays, hits, wait)
    }

    /// Any hit for the first `numrays[0]` rays; writes 1 (blocked) or -1 per ray.
    pub fn occluded(
        &self,
        queue: Queue,
        rays: &Buffer,
        numrays: &Buffer,
        maxrays: u32,
        hits: &Buffer,
        wait: Option<&Event>,
    ) -> Result<Event> {
        self.launch(&self.occlude_func, queue, rays, numrays, maxrays, hits, wait)
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        func: &Function,
        queue: Queue,
        rays: &Buffer,
        numrays: &Buffer,
        maxrays: u32,
        hits: &Buffer,
        wait: Option<&Event>,
    ) -> Result<Event> {
        let gpu = self
            .gpu
            .as_ref()
            .ok_or_else(|| Error::state("intersector used before process()"))?;

        let stack = {
            let mut guard = self.stack.lock();
            let required = maxrays as usize * STACK_BYTES_PER_RAY;
            if guard.as_ref().map_or(true, |s| required > s.size()) {
                *guard = None;
                *guard = Some(self.device.create_buffer(required, BufferType::Write, None)?);
            }
            guard
                .clone()
                .ok_or_else(|| Error::state("traversal stack missing"))?
        };

        func.set_arg(0, &gpu.nodes);
        func.set_arg(1, &gpu.vertices);
        func.set_arg(2, rays);
        func.set_arg(3, numrays);
        func.set_arg(4, &stack);
        func.set_arg(5, hits);

        let global = align_up(maxrays as usize, WORK_GROUP_SIZE);
        self.device.execute(
            func,
            queue,
            WorkSize::d1(global),
            WorkSize::d1(WORK_GROUP_SIZE),
            wait,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::HostDevice;
    use crate::util::{Mat4, Vec3};

    fn quad() -> Mesh {
        Mesh::new(
            vec![
                Vec3::new(-1.0, -1.0, 0.0),
                Vec3::new(1.0, -1.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(-1.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
    }

    fn world() -> World {
        let mut w = World::new();
        w.attach_shape(Shape::instance(5, 1, Mat4::from_translation(Vec3::new(0.0, 0.0, 4.0))));
        w.attach_shape(Shape::mesh(1, quad()));
        w.attach_shape(Shape::mesh(2, quad()));
        w
    }

    #[test]
    fn test_layout_meshes_first() {
        let w = world();
        let layout = ShapeLayout::new(&w).unwrap();
        let ids: Vec<i32> = layout.shapes.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 5]);
        assert_eq!(layout.num_meshes, 2);
        assert_eq!(layout.faces_start, vec![0, 2, 4]);
        assert_eq!(layout.vertices_start, vec![0, 4, 8]);
        assert_eq!(layout.num_faces, 6);
    }

    #[test]
    fn test_instance_bounds_and_vertices() {
        let w = world();
        let layout = ShapeLayout::new(&w).unwrap();
        let bounds = layout.face_bounds();
        assert_eq!(bounds[0].min.z, 0.0);
        assert_eq!(bounds[4].min.z, 4.0);

        let mut verts = vec![[0f32; 4]; layout.num_vertices];
        layout.write_vertices(&mut verts);
        assert_eq!(verts[8], [-1.0, -1.0, 4.0, 1.0]);
    }

    #[test]
    fn test_face_table_round_trip() {
        let w = world();
        let layout = ShapeLayout::new(&w).unwrap();
        let indices: Vec<u32> = vec![5, 0, 3, 1, 4, 2];
        let faces = layout.face_table(&indices);
        for (face, &prim) in faces.iter().zip(&indices) {
            let shape = w.shape(face.shapeidx).unwrap();
            let mesh = match &shape.kind {
                ShapeKind::Mesh(m) => m,
                ShapeKind::Instance { base_shape_id, .. } => w.shape(*base_shape_id).unwrap().as_mesh().unwrap(),
            };
            let local = mesh.faces[face.id as usize];
            let slot = layout.shapes.iter().position(|s| s.id == face.shapeidx).unwrap();
            let base = layout.vertices_start[slot] as i32;
            assert_eq!(face.idx, [local[0] as i32 + base, local[1] as i32 + base, local[2] as i32 + base]);
            assert_eq!(layout.faces_start[slot] + face.id as usize, prim as usize);
        }
        assert_eq!(faces[0].shapeidx, 5);
        assert_eq!(faces[0].id, 1);
    }

    #[test]
    fn test_dangling_instance() {
        let mut w = World::new();
        w.attach_shape(Shape::instance(0, 42, Mat4::IDENTITY));
        assert!(matches!(ShapeLayout::new(&w), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_small_device_is_rejected() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::with_max_alloc_size(64 << 20));
        let mut isect = IntersectorShortStack::new(device).unwrap();
        let err = isect.process(&world()).unwrap_err();
        match err {
            Error::ResourceExhausted(msg) => assert!(msg.contains("using bvh instead")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!isect.is_ready());
    }

    /// Slivers at x = 4^i: with two bins every SAH split peels off the
    /// farthest one, so the tree degenerates into a chain.
    fn chain_world(count: usize) -> World {
        let mut vertices = Vec::with_capacity(count * 3);
        let mut faces = Vec::with_capacity(count);
        for i in 0..count {
            let x = 4f32.powi(i as i32);
            let base = vertices.len() as u32;
            vertices.extend([Vec3::new(x, 0.0, 0.0), Vec3::new(x, 1.0, 0.0), Vec3::new(x, 0.0, 1.0)]);
            faces.push([base, base + 1, base + 2]);
        }
        let mut w = World::new();
        w.attach_shape(Shape::mesh(1, Mesh::new(vertices, faces)));
        let opts = w.options_mut();
        opts.set_string("bvh.builder", "sah");
        opts.set_float("bvh.sah.num_bins", 2.0);
        opts.set_float("bvh.sah.traversal_cost", 0.0);
        w
    }

    #[test]
    fn test_deep_tree_is_rejected() {
        let w = chain_world(50);
        let layout = ShapeLayout::new(&w).unwrap();
        let bvh = Bvh::build(&layout.face_bounds(), &BuildSettings::from_options(w.options()));
        assert!(bvh.height() as usize >= MAX_STACK_SIZE, "height {}", bvh.height());

        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let mut isect = IntersectorShortStack::new(device).unwrap();
        match isect.process(&w).unwrap_err() {
            Error::ResourceExhausted(msg) => assert!(msg.contains("stack overflow for this scene"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!isect.is_ready());
        assert!(isect.stats().is_none());
    }

    #[test]
    fn test_shallow_chain_is_accepted() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let mut isect = IntersectorShortStack::new(device).unwrap();
        isect.process(&chain_world(20)).unwrap();
        assert!(isect.is_ready());
        assert!((isect.stats().unwrap().height as usize) < MAX_STACK_SIZE);
    }

    #[test]
    fn test_rebuild_only_when_changed() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let mut isect = IntersectorShortStack::new(device).unwrap();
        let mut w = world();
        isect.process(&w).unwrap();
        assert!(isect.is_ready());
        assert_eq!(isect.stack_size(), MAX_BATCH_SIZE * MAX_STACK_SIZE * 4);
        let first = isect.gpu.as_ref().unwrap().nodes.id();

        w.on_commit();
        isect.process(&w).unwrap();
        assert_eq!(isect.gpu.as_ref().unwrap().nodes.id(), first);

        w.shape_mut(2).unwrap().set_transform(Mat4::from_translation(Vec3::X));
        isect.process(&w).unwrap();
        assert_ne!(isect.gpu.as_ref().unwrap().nodes.id(), first);
    }

    #[test]
    fn test_intersect_before_process() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let isect = IntersectorShortStack::new(device.clone()).unwrap();
        let buf = device.create_buffer(48, BufferType::ReadWrite, None).unwrap();
        let err = isect.intersect(0, &buf, &buf, 1, &buf, None).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
