//! Host implementation of the short-stack traversal program.
//!
//! Both entry points take `(nodes, vertices, rays, numrays, stack, hits)`.
//! The device stack argument is unused here; each ray keeps its own inline
//! stack of `MAX_STACK_SIZE` node links.

use rayon::prelude::*;
use smallvec::SmallVec;

use super::MAX_STACK_SIZE;
use crate::bvh::translator::{parse_blob, BlobView};
use crate::bvh::{Face, FatNode};
use crate::compute::{HostLaunch, NativeLibrary};
use crate::ray::{Intersection, Ray, HIT_MARKER, MISS_MARKER};
use crate::util::{Result, Vec3};

pub static INTERSECTOR_LIBRARY: NativeLibrary = NativeLibrary {
    name: "intersect_bvh2_short_stack",
    kernels: &[("intersect_main", intersect_main), ("occluded_main", occluded_main)],
};

const EPSILON: f32 = 1e-8;

#[derive(Debug, Clone, Copy)]
struct Flags {
    ray_mask: bool,
    backface_cull: bool,
    safe_math: bool,
}

impl Flags {
    fn from_launch(launch: &HostLaunch<'_>) -> Self {
        Self {
            ray_mask: launch.is_defined("RR_RAY_MASK"),
            backface_cull: launch.is_defined("RR_BACKFACE_CULL"),
            safe_math: launch.is_defined("USE_SAFE_MATH"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    face: Face,
    u: f32,
    v: f32,
    t: f32,
}

#[inline]
fn safe_inverse(d: f32, safe: bool) -> f32 {
    if safe && d.abs() < EPSILON {
        1.0 / EPSILON.copysign(d)
    } else {
        1.0 / d
    }
}

/// Entry distance into `[min, max]`, or `None` if the slab test fails.
#[inline]
fn slab(min: [f32; 3], max: [f32; 3], o: Vec3, inv_d: Vec3, t_max: f32) -> Option<f32> {
    let t0 = (Vec3::from_array(min) - o) * inv_d;
    let t1 = (Vec3::from_array(max) - o) * inv_d;
    let near = t0.min(t1).max_element().max(0.0);
    let far = t0.max(t1).min_element().min(t_max);
    (near <= far).then_some(near)
}

/// Moller-Trumbore; returns (u, v, t).
#[inline]
fn triangle(o: Vec3, d: Vec3, v0: Vec3, v1: Vec3, v2: Vec3, t_max: f32, cull: bool) -> Option<(f32, f32, f32)> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = d.cross(e2);
    let det = e1.dot(p);
    if cull {
        if det <= EPSILON {
            return None;
        }
    } else if det.abs() <= EPSILON {
        return None;
    }
    let inv = 1.0 / det;
    let s = o - v0;
    let u = s.dot(p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = d.dot(q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv;
    (t > 0.0 && t < t_max).then_some((u, v, t))
}

fn vertex(vertices: &[[f32; 4]], i: i32) -> Vec3 {
    let v = vertices[i as usize];
    Vec3::new(v[0], v[1], v[2])
}

/// Walk the fat-node tree. With `any_hit` the first accepted triangle ends the walk.
fn traverse(blob: &BlobView<'_>, vertices: &[[f32; 4]], ray: &Ray, any_hit: bool, flags: Flags) -> Option<Hit> {
    if !ray.is_active() || blob.nodes.is_empty() {
        return None;
    }

    let o = ray.origin();
    let d = ray.direction();
    let inv_d = Vec3::new(
        safe_inverse(d.x, flags.safe_math),
        safe_inverse(d.y, flags.safe_math),
        safe_inverse(d.z, flags.safe_math),
    );
    let mut t_max = ray.max_t();
    let mut best: Option<Hit> = None;
    let mut stack: SmallVec<[i32; MAX_STACK_SIZE]> = SmallVec::new();
    let mut current = Some(0i32);

    while let Some(index) = current.take().or_else(|| stack.pop()) {
        let node: &FatNode = &blob.nodes[index as usize];
        let mut interior: SmallVec<[(f32, i32); 2]> = SmallVec::new();

        for (min, max, link, count) in [
            (node.lmin, node.lmax, node.lchild, node.lcount),
            (node.rmin, node.rmax, node.rchild, node.rcount),
        ] {
            if link < 0 && count == 0 {
                continue;
            }
            let Some(t_near) = slab(min, max, o, inv_d, t_max) else {
                continue;
            };
            if link >= 0 {
                interior.push((t_near, link));
                continue;
            }

            let first = (-(link + 1)) as usize;
            for face in &blob.faces[first..first + count as usize] {
                if flags.ray_mask && face.pad[0] & ray.mask() == 0 {
                    continue;
                }
                let hit = triangle(
                    o,
                    d,
                    vertex(vertices, face.idx[0]),
                    vertex(vertices, face.idx[1]),
                    vertex(vertices, face.idx[2]),
                    t_max,
                    flags.backface_cull,
                );
                if let Some((u, v, t)) = hit {
                    t_max = t;
                    best = Some(Hit { face: *face, u, v, t });
                    if any_hit {
                        return best;
                    }
                }
            }
        }

        match interior.as_slice() {
            [(_, only)] => current = Some(*only),
            [(ta, a), (tb, b)] => {
                // Nearer child next, farther one deferred
                let (near, far) = if ta <= tb { (*a, *b) } else { (*b, *a) };
                stack.push(far);
                current = Some(near);
            }
            _ => {}
        }
    }
    best
}

/// Shared argument unpacking; `f` maps each active ray to its result.
fn run<T: bytemuck::Pod + Send>(
    launch: &mut HostLaunch<'_>,
    f: impl Fn(&BlobView<'_>, &[[f32; 4]], &Ray, Flags) -> T + Sync,
) -> Result<()> {
    let flags = Flags::from_launch(launch);
    let rays: Vec<Ray> = launch.read(2)?;
    let numrays = launch.read_scalar::<i32>(3)?.max(0) as usize;
    let limit = launch.global_size().total();
    let n = numrays.min(rays.len()).min(limit);

    let results: Vec<T> = launch.view::<u32, Result<Vec<T>>>(0, |words| {
        let blob = parse_blob(words)?;
        launch.view::<[f32; 4], _>(1, |vertices| {
            rays[..n]
                .par_iter()
                .map(|ray| f(&blob, vertices, ray, flags))
                .collect()
        })
    })??;

    launch.write(5, &results)
}

/// (nodes, vertices, rays, numrays, stack, hits: Intersection)
fn intersect_main(launch: &mut HostLaunch<'_>) -> Result<()> {
    run(launch, |blob, vertices, ray, flags| match traverse(blob, vertices, ray, false, flags) {
        Some(hit) => Intersection {
            shapeid: hit.face.shapeidx,
            primid: hit.face.id,
            padding: [0; 2],
            uvwt: [hit.u, hit.v, 0.0, hit.t],
        },
        None => Intersection::MISS,
    })
}

/// (nodes, vertices, rays, numrays, stack, hits: i32)
fn occluded_main(launch: &mut HostLaunch<'_>) -> Result<()> {
    run(launch, |blob, vertices, ray, flags| {
        if traverse(blob, vertices, ray, true, flags).is_some() {
            HIT_MARKER
        } else {
            MISS_MARKER
        }
    })
}
