//! Host reference integrator.
//!
//! Native versions of every kernel the path-tracing driver dispatches, with
//! the same names and argument order as the device program. Shading is a
//! diffuse + emissive model with next-event estimation towards point and
//! directional lights and a lat-long environment for escaped paths. Media are
//! not modelled, so the volume kernels leave their inputs untouched.
//!
//! Samples come from the Sobol table: dimensions 0-3 belong to the camera,
//! each bounce uses the four dimensions starting at `4 + 4 * pass`. The
//! sample index is `framecnt` and the per-pixel `random` word scrambles it.

use rayon::prelude::*;
use std::f32::consts::{FRAC_1_PI, PI};

use super::OutputType;
use crate::compute::{HostLaunch, NativeLibrary};
use crate::ray::{path_flags, Intersection, PathState, Ray, MISS_MARKER};
use crate::scene::compiler::{
    light_kind, CameraRecord, LightRecord, MaterialRecord, ShapeRecord, TextureRecord,
};
use crate::util::{Mat4, Result, Vec2, Vec3};

pub static PT_LIBRARY: NativeLibrary = NativeLibrary {
    name: "integrator_pt",
    kernels: &[
        ("PerspectiveCamera_GeneratePaths", perspective_camera_generate_paths),
        ("PerspectiveCameraDof_GeneratePaths", perspective_camera_dof_generate_paths),
        ("EvaluateVolume", evaluate_volume),
        ("FilterPathStream", filter_path_stream),
        ("RestorePixelIndices", restore_pixel_indices),
        ("ShadeVolume", shade_volume),
        ("ShadeSurface", shade_surface),
        ("ShadeBackgroundEnvMap", shade_background_env_map),
        ("ShadeMiss", shade_miss),
        ("GatherLightSamples", gather_light_samples),
        ("FillAOVs", fill_aovs),
        ("ApplyGammaAndCopyData", apply_gamma_and_copy_data),
        ("AccumulateData", accumulate_data),
    ],
};

/// Offset applied to secondary ray origins.
const RAY_EPSILON: f32 = 1e-4;

fn v3(a: [f32; 4]) -> Vec3 {
    Vec3::new(a[0], a[1], a[2])
}

fn v4(v: Vec3, w: f32) -> [f32; 4] {
    [v.x, v.y, v.z, w]
}

/// lowbias32 integer hash.
fn hash_u32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Per-pixel sample source.
struct Sampler<'a> {
    matrices: &'a [u32],
    index: u32,
    scramble: u32,
    seed: u32,
}

impl Sampler<'_> {
    fn get(&self, dim: usize) -> f32 {
        if dim < sobol::NUM_DIMENSIONS {
            sobol::sample_f32(self.matrices, dim, self.index, self.scramble)
        } else {
            // Past the table: hashed fallback
            let h = hash_u32(self.seed ^ hash_u32(self.scramble ^ dim as u32));
            (h >> 8) as f32 / (1u32 << 24) as f32
        }
    }
}

fn inactive_ray() -> Ray {
    let mut r = Ray::new(Vec3::ZERO, Vec3::Z, 0.0);
    r.set_active(false);
    r
}

fn cosine_hemisphere(n: Vec3, u1: f32, u2: f32) -> Vec3 {
    let r = u1.sqrt();
    let phi = 2.0 * PI * u2;
    let (t, b) = n.any_orthonormal_pair();
    (t * (r * phi.cos()) + b * (r * phi.sin()) + n * (1.0 - u1).max(0.0).sqrt()).normalize()
}

/// Scene arguments shared by the shading and AOV kernels, starting at `base`:
/// vertices, normals, uvs, indices, shapes, materialids, materials, textures,
/// texturedata, envmapidx, lights, num_lights.
struct SceneData {
    vertices: Vec<[f32; 4]>,
    normals: Vec<[f32; 4]>,
    uvs: Vec<[f32; 2]>,
    indices: Vec<i32>,
    shapes: Vec<ShapeRecord>,
    materialids: Vec<i32>,
    materials: Vec<MaterialRecord>,
    env: Environment,
}

impl SceneData {
    fn read(launch: &HostLaunch<'_>, base: usize) -> Result<Self> {
        Ok(Self {
            vertices: launch.read(base)?,
            normals: launch.read(base + 1)?,
            uvs: launch.read(base + 2)?,
            indices: launch.read(base + 3)?,
            shapes: launch.read(base + 4)?,
            materialids: launch.read(base + 5)?,
            materials: launch.read(base + 6)?,
            env: Environment::read(launch, base + 10, base + 9, base + 7, base + 8, Some(base + 11))?,
        })
    }

    fn surface(&self, isect: &Intersection, ray: &Ray) -> Option<SurfaceHit> {
        if !isect.is_hit() {
            return None;
        }
        let shape = self.shapes.get(usize::try_from(isect.shapeid).ok()?)?;
        let prim = usize::try_from(isect.primid).ok()?;
        if prim >= shape.numprims as usize {
            return None;
        }

        let first = shape.startidx as usize + 3 * prim;
        let idx = [0, 1, 2].map(|k| shape.startvtx as usize + self.indices[first + k] as usize);
        let m = Mat4::from_cols_array_2d(&shape.transform);
        let nm = m.inverse().transpose();

        let [p0, p1, p2] = idx.map(|i| m.transform_point3(v3(self.vertices[i])));
        let [n0, n1, n2] = idx.map(|i| nm.transform_vector3(v3(self.normals[i])));
        let [t0, t1, t2] = idx.map(|i| Vec2::from_array(self.uvs[i]));

        let (u, v) = (isect.uvwt[0], isect.uvwt[1]);
        let w = 1.0 - u - v;

        let wo = -ray.direction();
        let mut ng = (p1 - p0).cross(p2 - p0).normalize_or(Vec3::Z);
        let mut ns = (n0 * w + n1 * u + n2 * v).normalize_or(ng);
        if ng.dot(wo) < 0.0 {
            ng = -ng;
        }
        if ns.dot(wo) < 0.0 {
            ns = -ns;
        }

        let material = self
            .materialids
            .get(shape.start_material_idx as usize + prim)
            .and_then(|&m| self.materials.get(m as usize))
            .copied()
            .unwrap_or(MaterialRecord {
                kd: [0.5, 0.5, 0.5, 0.0],
                ke: [0.0; 4],
            });

        Some(SurfaceHit {
            position: p0 * w + p1 * u + p2 * v,
            ng,
            ns,
            uv: t0 * w + t1 * u + t2 * v,
            bary: Vec3::new(w, u, v),
            distance: isect.uvwt[3],
            kd: v3(material.kd),
            ke: v3(material.ke),
        })
    }
}

struct SurfaceHit {
    position: Vec3,
    /// Geometric normal facing the incoming ray.
    ng: Vec3,
    /// Interpolated normal facing the incoming ray.
    ns: Vec3,
    uv: Vec2,
    bary: Vec3,
    distance: f32,
    kd: Vec3,
    ke: Vec3,
}

impl SurfaceHit {
    fn offset(&self, dir: Vec3) -> Vec3 {
        let side = if self.ng.dot(dir) >= 0.0 { 1.0 } else { -1.0 };
        self.position + self.ng * (RAY_EPSILON * side)
    }
}

/// Lights plus the textures the environment may sample.
struct Environment {
    lights: Vec<LightRecord>,
    envmapidx: i32,
    textures: Vec<TextureRecord>,
    texturedata: Vec<[f32; 4]>,
}

impl Environment {
    fn read(
        launch: &HostLaunch<'_>,
        lights: usize,
        envmapidx: usize,
        textures: usize,
        texturedata: usize,
        num_lights: Option<usize>,
    ) -> Result<Self> {
        let mut all: Vec<LightRecord> = launch.read(lights)?;
        if let Some(i) = num_lights {
            all.truncate(launch.int(i)?.max(0) as usize);
        }
        Ok(Self {
            lights: all,
            envmapidx: launch.int(envmapidx)?,
            textures: launch.read(textures)?,
            texturedata: launch.read(texturedata)?,
        })
    }

    /// Radiance arriving from direction `d`, zero without an environment.
    fn radiance(&self, d: Vec3) -> Vec3 {
        let Some(light) = usize::try_from(self.envmapidx).ok().and_then(|i| self.lights.get(i)) else {
            return Vec3::ZERO;
        };
        let intensity = v3(light.intensity);
        match usize::try_from(light.texture).ok().and_then(|t| self.textures.get(t)) {
            Some(tex) => intensity * self.texel(tex, latlong(d)),
            None => intensity,
        }
    }

    fn texel(&self, tex: &TextureRecord, uv: Vec2) -> Vec3 {
        let (w, h) = (tex.width.max(1) as usize, tex.height.max(1) as usize);
        let x = ((uv.x * w as f32) as usize).min(w - 1);
        let y = ((uv.y * h as f32) as usize).min(h - 1);
        self.texturedata
            .get(tex.dataoffset as usize + y * w + x)
            .map_or(Vec3::ZERO, |t| v3(*t))
    }

    /// Point and directional lights, the ones sampled explicitly.
    fn delta_lights(&self) -> Vec<&LightRecord> {
        self.lights
            .iter()
            .filter(|l| l.kind == light_kind::POINT || l.kind == light_kind::DIRECTIONAL)
            .collect()
    }
}

/// Lat-long coordinates of a direction, `v = 0` straight up.
fn latlong(d: Vec3) -> Vec2 {
    let d = d.normalize_or(Vec3::Y);
    let u = 0.5 + d.z.atan2(d.x) / (2.0 * PI);
    let v = d.y.clamp(-1.0, 1.0).acos() / PI;
    Vec2::new(u, v)
}

fn camera_paths(launch: &mut HostLaunch<'_>, dof: bool) -> Result<()> {
    // (camera, width, height, seed, framecnt, rays, random, sobolmat, paths)
    let cam: CameraRecord = launch.read_scalar(0)?;
    let width = launch.int(1)?.max(0) as usize;
    let height = launch.int(2)?.max(0) as usize;
    let seed = launch.uint(3)?;
    let frame = launch.int(4)? as u32;
    let random: Vec<u32> = launch.read(6)?;
    let matrices: Vec<u32> = launch.read(7)?;

    let n = (width * height).min(random.len());
    let forward = v3(cam.forward);
    let right = v3(cam.right);
    let up = v3(cam.up);
    let eye = v3(cam.position);

    let (rays, paths): (Vec<Ray>, Vec<PathState>) = (0..n)
        .into_par_iter()
        .map(|i| {
            let s = Sampler {
                matrices: &matrices,
                index: frame,
                scramble: random[i],
                seed: seed ^ i as u32,
            };
            let (x, y) = ((i % width) as f32, (i / width) as f32);
            let img = Vec2::new((x + s.get(0)) / width as f32, (y + s.get(1)) / height as f32) - 0.5;
            let mut d = (forward * cam.focal_length + right * (img.x * cam.dim[0]) + up * (img.y * cam.dim[1]))
                .normalize();
            let mut o = eye;

            if dof {
                let r = cam.aperture * s.get(2).sqrt();
                let phi = 2.0 * PI * s.get(3);
                let focus = eye + d * (cam.focus_distance / d.dot(forward));
                o = eye + right * (r * phi.cos()) + up * (r * phi.sin());
                d = (focus - o).normalize();
            }

            let ray = Ray::new(o + d * cam.zcap[0], d, cam.zcap[1] - cam.zcap[0]);
            let path = PathState {
                throughput: [1.0, 1.0, 1.0, 0.0],
                volume: -1,
                flags: path_flags::ALIVE,
                extra0: 0,
                extra1: 0,
            };
            (ray, path)
        })
        .unzip();

    launch.write(5, &rays)?;
    launch.write(8, &paths)
}

fn perspective_camera_generate_paths(launch: &mut HostLaunch<'_>) -> Result<()> {
    camera_paths(launch, false)
}

fn perspective_camera_dof_generate_paths(launch: &mut HostLaunch<'_>) -> Result<()> {
    camera_paths(launch, true)
}

/// (rays, pixelindices, hitcount, volumes, textures, texturedata, seed, random,
/// sobolmat, pass, framecnt, intersections, paths, output)
fn evaluate_volume(launch: &mut HostLaunch<'_>) -> Result<()> {
    for i in [0, 1, 2, 3, 7, 8, 11, 12, 13] {
        launch.buffer(i)?;
    }
    Ok(())
}

/// Same arguments as `ShadeSurface`.
fn shade_volume(launch: &mut HostLaunch<'_>) -> Result<()> {
    for i in [0, 1, 2, 3, 4, 22, 25, 27] {
        launch.buffer(i)?;
    }
    Ok(())
}

/// (intersections, hitcount, pixelindices, paths, hits)
fn filter_path_stream(launch: &mut HostLaunch<'_>) -> Result<()> {
    let isects: Vec<Intersection> = launch.read(0)?;
    let pixels: Vec<i32> = launch.read(2)?;
    let n = (launch.read_scalar::<i32>(1)?.max(0) as usize)
        .min(isects.len())
        .min(pixels.len());

    let live = launch.update::<PathState, _>(3, |paths| {
        (0..n)
            .map(|i| {
                let path = &mut paths[pixels[i] as usize];
                if isects[i].is_hit() && path.is_alive() {
                    1
                } else {
                    path.kill();
                    0
                }
            })
            .collect::<Vec<i32>>()
    })?;
    // Slots past the live count must not survive compaction
    launch.update::<i32, _>(4, |hits| {
        let n = live.len().min(hits.len());
        hits[..n].copy_from_slice(&live[..n]);
        hits[n..].fill(0);
    })
}

/// (compacted_indices, hitcount, src pixelindices, dst pixelindices)
fn restore_pixel_indices(launch: &mut HostLaunch<'_>) -> Result<()> {
    let compacted: Vec<i32> = launch.read(0)?;
    let src: Vec<i32> = launch.read(2)?;
    let n = (launch.read_scalar::<i32>(1)?.max(0) as usize).min(compacted.len());
    let restored: Vec<i32> = compacted[..n].iter().map(|&c| src[c as usize]).collect();
    launch.write(3, &restored)
}

struct Shaded {
    pixel: usize,
    emission: Vec3,
    shadow: Ray,
    lightsample: [f32; 4],
    next: Ray,
    path: PathState,
}

/// (rays, intersections, compacted_indices, pixelindices, hitcount, vertices,
/// normals, uvs, indices, shapes, materialids, materials, textures,
/// texturedata, envmapidx, lights, num_lights, seed, random, sobolmat, pass,
/// framecnt, volumes, shadowrays, lightsamples, paths, next rays, output)
fn shade_surface(launch: &mut HostLaunch<'_>) -> Result<()> {
    let rays: Vec<Ray> = launch.read(0)?;
    let isects: Vec<Intersection> = launch.read(1)?;
    let compacted: Vec<i32> = launch.read(2)?;
    let pixels: Vec<i32> = launch.read(3)?;
    let n = (launch.read_scalar::<i32>(4)?.max(0) as usize)
        .min(compacted.len())
        .min(pixels.len());
    let scene = SceneData::read(launch, 5)?;
    let seed = launch.uint(17)?;
    let random: Vec<u32> = launch.read(18)?;
    let matrices: Vec<u32> = launch.read(19)?;
    let pass = launch.int(20)?.max(0) as usize;
    let frame = launch.int(21)? as u32;
    let paths: Vec<PathState> = launch.read(25)?;

    let lights = scene.env.delta_lights();
    let dim = 4 + 4 * pass;

    let shaded: Vec<Shaded> = (0..n)
        .into_par_iter()
        .map(|i| {
            let slot = compacted[i] as usize;
            let pixel = pixels[i] as usize;
            let ray = &rays[slot];
            let mut path = paths[pixel];
            let s = Sampler {
                matrices: &matrices,
                index: frame,
                scramble: random[pixel],
                seed: hash_u32(seed ^ pixel as u32),
            };

            let Some(hit) = scene.surface(&isects[slot], ray) else {
                path.kill();
                return Shaded {
                    pixel,
                    emission: Vec3::ZERO,
                    shadow: inactive_ray(),
                    lightsample: [0.0; 4],
                    next: inactive_ray(),
                    path,
                };
            };

            let throughput = path.throughput();
            let emission = throughput * hit.ke;

            // Next-event estimation towards one delta light
            let mut shadow = inactive_ray();
            let mut lightsample = [0.0; 4];
            if !lights.is_empty() && hit.kd.max_element() > 0.0 {
                let count = lights.len();
                let pick = ((s.get(dim) * count as f32) as usize).min(count - 1);
                let light = lights[pick];
                let (wi, dist, le) = if light.kind == light_kind::POINT {
                    let to = v3(light.position) - hit.position;
                    let d2 = to.length_squared().max(1e-8);
                    (to / d2.sqrt(), d2.sqrt(), v3(light.intensity) / d2)
                } else {
                    (-v3(light.direction), f32::MAX, v3(light.intensity))
                };
                let cos = hit.ns.dot(wi);
                if cos > 0.0 {
                    let contribution = throughput * hit.kd * FRAC_1_PI * le * cos * count as f32;
                    lightsample = v4(contribution, 0.0);
                    let max_t = if dist < f32::MAX { dist - 2.0 * RAY_EPSILON } else { f32::MAX };
                    shadow = Ray::new(hit.offset(wi), wi, max_t);
                }
            }

            // Diffuse bounce
            let next = if hit.kd.max_element() > 0.0 {
                let wi = cosine_hemisphere(hit.ns, s.get(dim + 1), s.get(dim + 2));
                path.throughput = v4(throughput * hit.kd, 0.0);
                path.flags |= path_flags::SCATTERED;
                path.flags &= !path_flags::SPECULAR;
                Ray::new(hit.offset(wi), wi, f32::MAX)
            } else {
                path.kill();
                inactive_ray()
            };

            Shaded {
                pixel,
                emission,
                shadow,
                lightsample,
                next,
                path,
            }
        })
        .collect();

    let shadows: Vec<Ray> = shaded.iter().map(|s| s.shadow).collect();
    let samples: Vec<[f32; 4]> = shaded.iter().map(|s| s.lightsample).collect();
    let next: Vec<Ray> = shaded.iter().map(|s| s.next).collect();
    launch.write(23, &shadows)?;
    launch.write(24, &samples)?;
    launch.write(26, &next)?;
    launch.update::<PathState, _>(25, |paths| {
        for s in &shaded {
            paths[s.pixel] = s.path;
        }
    })?;
    launch.update::<[f32; 4], _>(27, |output| {
        for s in &shaded {
            let px = &mut output[s.pixel];
            px[0] += s.emission.x;
            px[1] += s.emission.y;
            px[2] += s.emission.z;
        }
    })
}

/// Shared body of the two miss kernels:
/// (rays, intersections, pixelindices, count, lights, envmapidx, textures,
/// texturedata, paths, volumes, output).
fn shade_escaped(launch: &mut HostLaunch<'_>, n: usize, primary: bool) -> Result<()> {
    let rays: Vec<Ray> = launch.read(0)?;
    let isects: Vec<Intersection> = launch.read(1)?;
    let pixels: Vec<i32> = launch.read(2)?;
    let env = Environment::read(launch, 4, 5, 6, 7, None)?;
    let paths: Vec<PathState> = launch.read(8)?;
    let n = n.min(rays.len()).min(isects.len()).min(pixels.len());

    let added: Vec<(usize, Vec3)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let pixel = pixels[i] as usize;
            let path = &paths[pixel];
            let escaped = !isects[i].is_hit() && (primary || path.is_alive());
            let radiance = if escaped {
                path.throughput() * env.radiance(rays[i].direction())
            } else {
                Vec3::ZERO
            };
            (pixel, radiance)
        })
        .collect();

    launch.update::<[f32; 4], _>(10, |output| {
        for (pixel, radiance) in &added {
            let px = &mut output[*pixel];
            px[0] += radiance.x;
            px[1] += radiance.y;
            px[2] += radiance.z;
            // Primary pass counts the sample
            if primary {
                px[3] += 1.0;
            }
        }
    })
}

/// Miss shading of primary rays over all `numrays` pixels; also bumps the
/// per-pixel sample count.
fn shade_background_env_map(launch: &mut HostLaunch<'_>) -> Result<()> {
    let n = launch.int(3)?.max(0) as usize;
    shade_escaped(launch, n, true)
}

/// Miss shading of live secondary rays; the count is read from a buffer.
fn shade_miss(launch: &mut HostLaunch<'_>) -> Result<()> {
    let n = launch.read_scalar::<i32>(3)?.max(0) as usize;
    shade_escaped(launch, n, false)
}

/// (pixelindices, hitcount, shadowhits, lightsamples, paths, output)
fn gather_light_samples(launch: &mut HostLaunch<'_>) -> Result<()> {
    let pixels: Vec<i32> = launch.read(0)?;
    let shadowhits: Vec<i32> = launch.read(2)?;
    let samples: Vec<[f32; 4]> = launch.read(3)?;
    let n = (launch.read_scalar::<i32>(1)?.max(0) as usize)
        .min(pixels.len())
        .min(shadowhits.len())
        .min(samples.len());

    launch.update::<[f32; 4], _>(5, |output| {
        for i in 0..n {
            if shadowhits[i] == MISS_MARKER {
                let px = &mut output[pixels[i] as usize];
                px[0] += samples[i][0];
                px[1] += samples[i][1];
                px[2] += samples[i][2];
            }
        }
    })
}

/// Value of one AOV at a primary hit.
fn aov_value(kind: OutputType, hit: &SurfaceHit) -> Vec3 {
    match kind {
        OutputType::Color => Vec3::ZERO,
        OutputType::WorldPosition => hit.position,
        OutputType::ShadingNormal => hit.ns,
        OutputType::GeometricNormal => hit.ng,
        OutputType::Uv => hit.uv.extend(0.0),
        OutputType::Wireframe => {
            if hit.bary.min_element() < 0.02 {
                Vec3::ONE
            } else {
                Vec3::ZERO
            }
        }
        OutputType::Albedo => hit.kd,
        OutputType::Tangent => hit.ns.any_orthonormal_pair().0,
        OutputType::Bitangent => hit.ns.any_orthonormal_pair().1,
        OutputType::Gloss => Vec3::ZERO,
        OutputType::Depth => Vec3::splat(hit.distance),
    }
}

/// (rays, intersections, num_items, vertices, normals, uvs, indices, shapes,
/// materialids, materials, textures, texturedata, envmapidx, lights,
/// num_lights, seed, random, sobolmat, framecnt) then one (enabled, data)
/// pair per AOV slot.
fn fill_aovs(launch: &mut HostLaunch<'_>) -> Result<()> {
    let rays: Vec<Ray> = launch.read(0)?;
    let isects: Vec<Intersection> = launch.read(1)?;
    let n = (launch.int(2)?.max(0) as usize).min(rays.len()).min(isects.len());
    let scene = SceneData::read(launch, 3)?;

    let hits: Vec<Option<SurfaceHit>> = (0..n)
        .into_par_iter()
        .map(|i| scene.surface(&isects[i], &rays[i]))
        .collect();

    for (slot, kind) in OutputType::aovs().enumerate() {
        let flag = 19 + 2 * slot;
        if launch.int(flag)? == 0 {
            continue;
        }
        launch.update::<[f32; 4], _>(flag + 1, |data| {
            for (px, hit) in data.iter_mut().zip(&hits) {
                if let Some(hit) = hit {
                    let v = aov_value(kind, hit);
                    px[0] += v.x;
                    px[1] += v.y;
                    px[2] += v.z;
                }
                px[3] += 1.0;
            }
        })?;
    }
    Ok(())
}

/// (data, width, height, gamma, out_rgba8)
fn apply_gamma_and_copy_data(launch: &mut HostLaunch<'_>) -> Result<()> {
    let data: Vec<[f32; 4]> = launch.read(0)?;
    let n = (launch.int(1)?.max(0) as usize * launch.int(2)?.max(0) as usize).min(data.len());
    let inv_gamma = 1.0 / launch.float(3)?.max(1e-3);

    let packed: Vec<u32> = data[..n]
        .par_iter()
        .map(|&[r, g, b, w]| {
            let scale = if w > 0.0 { 1.0 / w } else { 0.0 };
            let q = |c: f32| ((c * scale).max(0.0).powf(inv_gamma).min(1.0) * 255.0).round() as u32;
            q(r) | (q(g) << 8) | (q(b) << 16) | (0xff << 24)
        })
        .collect();
    launch.write(4, &packed)
}

/// (in, num_elements, inout)
fn accumulate_data(launch: &mut HostLaunch<'_>) -> Result<()> {
    let input: Vec<[f32; 4]> = launch.read(0)?;
    let n = (launch.int(1)?.max(0) as usize).min(input.len());
    launch.update::<[f32; 4], _>(2, |inout| {
        for (dst, src) in inout.iter_mut().zip(&input[..n]) {
            for c in 0..4 {
                dst[c] += src[c];
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latlong() {
        let up = latlong(Vec3::Y);
        assert!(up.y.abs() < 1e-6);
        let down = latlong(Vec3::NEG_Y);
        assert!((down.y - 1.0).abs() < 1e-6);
        let side = latlong(Vec3::X);
        assert!((side.x - 0.5).abs() < 1e-6 && (side.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_hemisphere_stays_above() {
        let n = Vec3::new(0.3, 0.9, -0.1).normalize();
        for i in 0..64 {
            let d = cosine_hemisphere(n, (i as f32 + 0.5) / 64.0, (i * 7 % 64) as f32 / 64.0);
            assert!(d.dot(n) >= 0.0);
            assert!((d.length() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_sampler_fallback_in_range() {
        let mats = sobol::matrices32();
        let s = Sampler {
            matrices: &mats,
            index: 3,
            scramble: 0x1234,
            seed: 99,
        };
        for dim in [0, 5, sobol::NUM_DIMENSIONS - 1, sobol::NUM_DIMENSIONS, 5000] {
            let x = s.get(dim);
            assert!((0.0..1.0).contains(&x), "dim {dim}: {x}");
        }
    }

    #[test]
    fn test_environment_radiance() {
        let env = Environment {
            lights: vec![LightRecord {
                kind: light_kind::BACKGROUND,
                texture: -1,
                pad: [0; 2],
                position: [0.0; 4],
                direction: [0.0; 4],
                intensity: [0.2, 0.4, 0.6, 0.0],
            }],
            envmapidx: 0,
            textures: Vec::new(),
            texturedata: Vec::new(),
        };
        assert_eq!(env.radiance(Vec3::X), Vec3::new(0.2, 0.4, 0.6));
        assert!(env.delta_lights().is_empty());
        let none = Environment { envmapidx: -1, ..env };
        assert_eq!(none.radiance(Vec3::X), Vec3::ZERO);
    }
}
