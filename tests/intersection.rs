//! Intersection API end to end on the host device.

use std::sync::Arc;

use wavefront_pt::api::IntersectionApi;
use wavefront_pt::compute::{BufferType, Device, DeviceExt, HostDevice};
use wavefront_pt::intersector::MAX_STACK_SIZE;
use wavefront_pt::ray::{Intersection, Ray, HIT_MARKER, MISS_MARKER};
use wavefront_pt::util::{Mat4, Vec3};
use wavefront_pt::Error;

fn host() -> Arc<dyn Device> {
    Arc::new(HostDevice::new())
}

/// Closest hits for `rays` through the count overload.
fn trace(api: &IntersectionApi, rays: &[Ray]) -> Vec<Intersection> {
    let device = api.device().clone();
    let ray_buf = device.create_buffer_from(BufferType::Read, rays).unwrap();
    let hits = device
        .create_buffer(rays.len() * std::mem::size_of::<Intersection>(), BufferType::Write, None)
        .unwrap();
    api.query_intersection_count(
        &api.create_from_backend_buffer(&ray_buf),
        rays.len() as u32,
        &api.create_from_backend_buffer(&hits),
        None,
    )
    .unwrap();
    device.read_pod(&hits, rays.len()).unwrap()
}

/// Triangle in the z = 0 plane facing +z.
fn triangle(api: &mut IntersectionApi) -> wavefront_pt::world::Shape {
    api.create_mesh(
        &[Vec3::new(-0.5, -0.5, 0.0), Vec3::new(0.5, -0.5, 0.0), Vec3::new(0.0, 0.5, 0.0)],
        &[[0, 1, 2]],
    )
}

/// `n x n` quads over [0, n]^2 at z = 0 facing +z, two triangles each.
fn grid(n: u32) -> (Vec<Vec3>, Vec<[u32; 3]>) {
    let mut vertices = Vec::new();
    for y in 0..=n {
        for x in 0..=n {
            vertices.push(Vec3::new(x as f32, y as f32, 0.0));
        }
    }
    let mut faces = Vec::new();
    let row = n + 1;
    for y in 0..n {
        for x in 0..n {
            let i = y * row + x;
            faces.push([i, i + 1, i + row + 1]);
            faces.push([i, i + row + 1, i + row]);
        }
    }
    (vertices, faces)
}

#[test]
fn test_single_triangle_closest_hit() {
    let mut api = IntersectionApi::new(host()).unwrap();
    let mesh = api.create_mesh(
        &[Vec3::new(0.0, 0.0, 1.0), Vec3::new(1.0, 0.0, 1.0), Vec3::new(0.0, 1.0, 1.0)],
        &[[0, 1, 2]],
    );
    let id = mesh.id;
    api.attach_shape(mesh);
    api.commit().unwrap();

    let hits = trace(
        &api,
        &[
            Ray::new(Vec3::new(0.25, 0.25, 2.0), Vec3::NEG_Z, 100.0),
            Ray::new(Vec3::new(0.25, 0.25, 2.0), Vec3::Z, 100.0),
            Ray::new(Vec3::new(0.25, 0.25, 2.0), Vec3::NEG_Z, 0.5),
        ],
    );

    assert_eq!(hits[0].shapeid, id);
    assert_eq!(hits[0].primid, 0);
    assert!((hits[0].uvwt[0] - 0.25).abs() < 1e-5);
    assert!((hits[0].uvwt[1] - 0.25).abs() < 1e-5);
    assert!((hits[0].uvwt[3] - 1.0).abs() < 1e-5);
    assert!(!hits[1].is_hit());
    // Beyond max_t
    assert!(!hits[2].is_hit());
}

#[test]
fn test_two_instances_of_one_mesh() {
    let mut api = IntersectionApi::new(host()).unwrap();
    let base = triangle(&mut api);
    let left = api.create_instance(&base).unwrap();
    let right = api.create_instance(&base).unwrap();
    let ids = [base.id, left.id, right.id];

    api.attach_shape(base);
    api.attach_shape(left);
    api.attach_shape(right);
    api.set_transform(ids[1], Mat4::from_translation(Vec3::new(-5.0, 0.0, 0.0))).unwrap();
    api.set_transform(ids[2], Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0))).unwrap();
    api.commit().unwrap();

    let hits = trace(
        &api,
        &[
            Ray::new(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, 100.0),
            Ray::new(Vec3::new(-5.0, 0.0, 5.0), Vec3::NEG_Z, 100.0),
            Ray::new(Vec3::new(5.0, 0.0, 5.0), Vec3::NEG_Z, 100.0),
            Ray::new(Vec3::new(2.5, 0.0, 5.0), Vec3::NEG_Z, 100.0),
        ],
    );

    for (hit, id) in hits.iter().zip(ids) {
        assert_eq!(hit.shapeid, id);
        assert_eq!(hit.primid, 0);
        assert!((hit.uvwt[3] - 5.0).abs() < 1e-4);
        // Same local point on every copy
        assert!((hit.uvwt[0] - hits[0].uvwt[0]).abs() < 1e-5);
        assert!((hit.uvwt[1] - hits[0].uvwt[1]).abs() < 1e-5);
    }
    assert!(!hits[3].is_hit());
}

#[test]
fn test_stacked_instances_return_the_closest() {
    let mut api = IntersectionApi::new(host()).unwrap();
    let base = triangle(&mut api);
    let middle = api.create_instance(&base).unwrap();
    let top = api.create_instance(&base).unwrap();
    let (middle_id, top_id) = (middle.id, top.id);

    api.attach_shape(base);
    api.attach_shape(middle);
    api.attach_shape(top);
    api.set_transform(middle_id, Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0))).unwrap();
    api.set_transform(top_id, Mat4::from_translation(Vec3::new(0.0, 0.0, 4.0))).unwrap();
    api.commit().unwrap();

    let hits = trace(
        &api,
        &[
            Ray::new(Vec3::new(0.0, 0.0, 10.0), Vec3::NEG_Z, 100.0),
            // Starts between the copies
            Ray::new(Vec3::new(0.0, 0.0, 3.0), Vec3::NEG_Z, 100.0),
            // Short of the top copy
            Ray::new(Vec3::new(0.0, 0.0, 10.0), Vec3::NEG_Z, 5.0),
        ],
    );

    assert_eq!(hits[0].shapeid, top_id);
    assert!((hits[0].uvwt[3] - 6.0).abs() < 1e-4);
    assert_eq!(hits[1].shapeid, middle_id);
    assert!((hits[1].uvwt[3] - 1.0).abs() < 1e-4);
    assert!(!hits[2].is_hit());
}

#[test]
fn test_every_face_resolves_to_its_mesh_face() {
    for splits in [false, true] {
        let mut api = IntersectionApi::new(host()).unwrap();
        api.set_option_string("bvh.builder", "sah");
        api.set_option("bvh.sah.use_splits", if splits { 1.0 } else { 0.0 });

        let (vertices, faces) = grid(8);
        let a = api.create_mesh(&vertices, &faces);
        let b = api.create_mesh(&vertices, &faces);
        let (ida, idb) = (a.id, b.id);
        api.attach_shape(a);
        api.attach_shape(b);
        api.set_transform(idb, Mat4::from_translation(Vec3::new(20.0, 0.0, 0.0))).unwrap();
        api.commit().unwrap();

        let stats = *api.bvh_stats().unwrap();
        assert!((stats.height as usize) < MAX_STACK_SIZE);

        let mut rays = Vec::new();
        let mut expected = Vec::new();
        for (offset, id) in [(0.0, ida), (20.0, idb)] {
            for (i, f) in faces.iter().enumerate() {
                let centre = f.iter().map(|&v| vertices[v as usize]).sum::<Vec3>() / 3.0;
                rays.push(Ray::new(centre + Vec3::new(offset, 0.0, 1.0), Vec3::NEG_Z, 10.0));
                expected.push((id, i as i32));
            }
        }

        let hits = trace(&api, &rays);
        for (hit, (id, face)) in hits.iter().zip(expected) {
            assert_eq!((hit.shapeid, hit.primid), (id, face), "splits = {splits}");
        }
    }
}

#[test]
fn test_occlusion_markers() {
    let device = host();
    let mut api = IntersectionApi::new(device.clone()).unwrap();
    let mesh = triangle(&mut api);
    api.attach_shape(mesh);
    api.commit().unwrap();

    let rays = [
        Ray::new(Vec3::new(0.0, 0.0, 1.0), Vec3::NEG_Z, 2.0),
        Ray::new(Vec3::new(3.0, 0.0, 1.0), Vec3::NEG_Z, 2.0),
    ];
    let ray_buf = device.create_buffer_from(BufferType::Read, &rays).unwrap();
    let hits = device.create_buffer(8, BufferType::Write, None).unwrap();
    let count = device.create_buffer_from(BufferType::Read, &[2i32]).unwrap();
    api.query_occlusion(
        &api.create_from_backend_buffer(&ray_buf),
        &api.create_from_backend_buffer(&count),
        2,
        &api.create_from_backend_buffer(&hits),
        None,
    )
    .unwrap();

    assert_eq!(device.read_pod::<i32>(&hits, 2).unwrap(), vec![HIT_MARKER, MISS_MARKER]);
}

#[test]
fn test_small_device_is_rejected() {
    let device: Arc<dyn Device> = Arc::new(HostDevice::with_max_alloc_size(64 << 20));
    let mut api = IntersectionApi::new(device).unwrap();
    let mesh = triangle(&mut api);
    api.attach_shape(mesh);

    let err = api.commit().unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)), "{err}");
    assert!(err.to_string().contains("bvh"));
}
