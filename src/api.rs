//! Ray-query front end over the short-stack intersector.
//!
//! Owns the [`World`] and the accelerator. Callers build shapes, attach them,
//! `commit`, then query with buffers bridged from the compute device.
//!
//! ## Usage
//! ```ignore
//! let mut api = IntersectionApi::new(device.clone())?;
//! let mesh = api.create_mesh(&positions, &faces);
//! api.attach_shape(mesh);
//! api.commit()?;
//! let rays = api.create_from_backend_buffer(&ray_buffer);
//! api.query_intersection_count(&rays, n, &hits, None)?;
//! ```

use parking_lot::Mutex;
use std::sync::Arc;

use crate::bvh::BvhStats;
use crate::compute::{Buffer, BufferType, BuildOptions, Device, Event};
use crate::intersector::IntersectorShortStack;
use crate::util::{Error, Mat4, Result, Vec3};
use crate::world::{Mesh, Shape, World};

/// Intersection-engine view of a compute buffer.
///
/// Shares the allocation with the buffer it was created from; dropping both
/// releases it.
#[derive(Debug, Clone)]
pub struct RayBuffer {
    buffer: Buffer,
}

impl RayBuffer {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Whether this handle bridges `buffer`.
    pub fn is_bridge_of(&self, buffer: &Buffer) -> bool {
        self.buffer.same_allocation(buffer)
    }
}

pub struct IntersectionApi {
    device: Arc<dyn Device>,
    world: World,
    intersector: IntersectorShortStack,
    next_id: i32,
    /// One-int buffer for the plain-count query overloads.
    scratch_count: Mutex<Option<Buffer>>,
}

impl std::fmt::Debug for IntersectionApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntersectionApi")
            .field("shapes", &self.world.shapes().len())
            .field("intersector", &self.intersector)
            .finish()
    }
}

impl IntersectionApi {
    pub fn new(device: Arc<dyn Device>) -> Result<Self> {
        let intersector = IntersectorShortStack::new(device.clone())?;
        Ok(Self::from_parts(device, intersector))
    }

    /// Engine with explicit intersector build options.
    pub fn with_options(device: Arc<dyn Device>, options: &BuildOptions) -> Result<Self> {
        let intersector = IntersectorShortStack::with_options(device.clone(), options)?;
        Ok(Self::from_parts(device, intersector))
    }

    fn from_parts(device: Arc<dyn Device>, intersector: IntersectorShortStack) -> Self {
        Self {
            device,
            world: World::new(),
            intersector,
            next_id: 0,
            scratch_count: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Statistics of the last rebuild.
    pub fn bvh_stats(&self) -> Option<&BvhStats> {
        self.intersector.stats()
    }

    /// New unattached mesh with a fresh id.
    pub fn create_mesh(&mut self, vertices: &[Vec3], faces: &[[u32; 3]]) -> Shape {
        let id = self.allocate_id();
        Shape::mesh(id, Mesh::new(vertices.to_vec(), faces.to_vec()))
    }

    /// New unattached instance of `base`, which must be a mesh.
    pub fn create_instance(&mut self, base: &Shape) -> Result<Shape> {
        if base.is_instance() {
            return Err(Error::invalid(format!(
                "shape {} is an instance and cannot be instanced",
                base.id
            )));
        }
        let id = self.allocate_id();
        Ok(Shape::instance(id, base.id, Mat4::IDENTITY))
    }

    fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Attach a shape. A shape with the same id is replaced.
    pub fn attach_shape(&mut self, shape: Shape) {
        if shape.id >= self.next_id {
            self.next_id = shape.id + 1;
        }
        self.world.attach_shape(shape);
    }

    pub fn detach_shape(&mut self, id: i32) -> Option<Shape> {
        self.world.detach_shape(id)
    }

    pub fn detach_all(&mut self) {
        self.world.detach_all();
    }

    pub fn set_transform(&mut self, id: i32, transform: Mat4) -> Result<()> {
        self.world
            .shape_mut(id)
            .ok_or_else(|| Error::invalid(format!("no shape with id {}", id)))?
            .set_transform(transform);
        Ok(())
    }

    pub fn set_mask(&mut self, id: i32, mask: i32) -> Result<()> {
        self.world
            .shape_mut(id)
            .ok_or_else(|| Error::invalid(format!("no shape with id {}", id)))?
            .set_mask(mask);
        Ok(())
    }

    pub fn set_option(&mut self, name: &str, value: f32) {
        self.world.options_mut().set_float(name, value);
    }

    pub fn set_option_string(&mut self, name: &str, value: &str) {
        self.world.options_mut().set_string(name, value);
    }

    /// Bring the accelerator up to date with the world.
    pub fn commit(&mut self) -> Result<()> {
        self.intersector.process(&self.world)?;
        self.world.on_commit();
        Ok(())
    }

    /// Bridge a compute buffer; both handles share one allocation.
    pub fn create_from_backend_buffer(&self, buffer: &Buffer) -> RayBuffer {
        RayBuffer {
            buffer: buffer.clone(),
        }
    }

    /// Closest hit for `numrays[0]` rays; `maxrays` bounds the launch.
    pub fn query_intersection(
        &self,
        rays: &RayBuffer,
        numrays: &RayBuffer,
        maxrays: u32,
        hits: &RayBuffer,
        wait: Option<&Event>,
    ) -> Result<Event> {
        self.intersector
            .intersect(0, &rays.buffer, &numrays.buffer, maxrays, &hits.buffer, wait)
    }

    /// Closest hit for exactly `numrays` rays.
    pub fn query_intersection_count(
        &self,
        rays: &RayBuffer,
        numrays: u32,
        hits: &RayBuffer,
        wait: Option<&Event>,
    ) -> Result<Event> {
        let count = self.count_buffer(numrays, wait)?;
        self.intersector
            .intersect(0, &rays.buffer, &count, numrays, &hits.buffer, None)
    }

    /// Any hit for `numrays[0]` rays: 1 occluded, -1 clear.
    pub fn query_occlusion(
        &self,
        rays: &RayBuffer,
        numrays: &RayBuffer,
        maxrays: u32,
        hits: &RayBuffer,
        wait: Option<&Event>,
    ) -> Result<Event> {
        self.intersector
            .occluded(0, &rays.buffer, &numrays.buffer, maxrays, &hits.buffer, wait)
    }

    pub fn query_occlusion_count(
        &self,
        rays: &RayBuffer,
        numrays: u32,
        hits: &RayBuffer,
        wait: Option<&Event>,
    ) -> Result<Event> {
        let count = self.count_buffer(numrays, wait)?;
        self.intersector
            .occluded(0, &rays.buffer, &count, numrays, &hits.buffer, None)
    }

    fn count_buffer(&self, numrays: u32, wait: Option<&Event>) -> Result<Buffer> {
        if let Some(event) = wait {
            event.wait()?;
        }
        let mut guard = self.scratch_count.lock();
        let buffer = match guard.as_ref() {
            Some(b) => b.clone(),
            None => {
                let b = self.device.create_buffer(4, BufferType::Read, None)?;
                *guard = Some(b.clone());
                b
            }
        };
        self.device
            .write_buffer(&buffer, 0, 0, &(numrays as i32).to_ne_bytes())?
            .wait()?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{DeviceExt, HostDevice};
    use crate::ray::{Intersection, Ray};

    fn device() -> Arc<dyn Device> {
        Arc::new(HostDevice::new())
    }

    #[test]
    fn test_ids_are_unique() {
        let mut api = IntersectionApi::new(device()).unwrap();
        let a = api.create_mesh(&[Vec3::ZERO, Vec3::X, Vec3::Y], &[[0, 1, 2]]);
        let b = api.create_instance(&a).unwrap();
        assert_ne!(a.id, b.id);
        assert!(api.create_instance(&b).is_err());
        assert!(api.set_transform(a.id, Mat4::IDENTITY).is_err());
    }

    #[test]
    fn test_bridge_shares_allocation() {
        let device = device();
        let api = IntersectionApi::new(device.clone()).unwrap();
        let buf = device.create_buffer(48, BufferType::ReadWrite, None).unwrap();
        let bridged = api.create_from_backend_buffer(&buf);
        assert!(bridged.is_bridge_of(&buf));
        assert_eq!(buf.handle_count(), 2);
        drop(bridged);
        assert_eq!(buf.handle_count(), 1);
    }

    #[test]
    fn test_count_overload_matches_buffer_overload() {
        let device = device();
        let mut api = IntersectionApi::new(device.clone()).unwrap();
        let mesh = api.create_mesh(
            &[Vec3::new(1.0, -1.0, 2.0), Vec3::new(-1.0, -1.0, 2.0), Vec3::new(0.0, 1.0, 2.0)],
            &[[0, 1, 2]],
        );
        api.attach_shape(mesh);
        api.commit().unwrap();

        let rays = vec![
            Ray::new(Vec3::ZERO, Vec3::Z, 100.0),
            Ray::new(Vec3::new(5.0, 0.0, 0.0), Vec3::Z, 100.0),
        ];
        let ray_buf = device.create_buffer_from(BufferType::Read, &rays).unwrap();
        let hits_a = device.create_buffer(64, BufferType::Write, None).unwrap();
        let hits_b = device.create_buffer(64, BufferType::Write, None).unwrap();
        let count = device.create_buffer_from(BufferType::Read, &[2i32]).unwrap();

        let r = api.create_from_backend_buffer(&ray_buf);
        api.query_intersection(&r, &api.create_from_backend_buffer(&count), 2, &api.create_from_backend_buffer(&hits_a), None)
            .unwrap();
        api.query_intersection_count(&r, 2, &api.create_from_backend_buffer(&hits_b), None)
            .unwrap();

        let a: Vec<Intersection> = device.read_pod(&hits_a, 2).unwrap();
        let b: Vec<Intersection> = device.read_pod(&hits_b, 2).unwrap();
        assert_eq!(a, b);
        assert!(a[0].is_hit());
        assert!(!a[1].is_hit());
        assert!((a[0].uvwt[3] - 2.0).abs() < 1e-5);
    }
}
