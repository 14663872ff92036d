//! Flatten a [`Scene`] into device buffers.
//!
//! Shape `i` of the scene is registered with the intersection engine under id
//! `i`, so an intersection's `shapeid` indexes `CompiledScene::shapes`
//! directly. Instances reuse their base mesh's vertex and index ranges with
//! their own transform and material range.

use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

use super::{Light, Scene, ShapeKind};
use crate::api::IntersectionApi;
use crate::bvh::BvhStats;
use crate::compute::{Buffer, BufferType, Device, DeviceExt};
use crate::util::{Result, Vec3};
use crate::world::{Mesh, Shape};

/// Per-shape record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShapeRecord {
    pub numprims: i32,
    /// First vertex of the (base) mesh in the vertex arrays.
    pub startvtx: i32,
    /// First index of the (base) mesh in the index array.
    pub startidx: i32,
    /// First entry of this shape in `materialids`.
    pub start_material_idx: i32,
    /// Object to world, column-major.
    pub transform: [[f32; 4]; 4],
    pub id: i32,
    pub pad: [i32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    pub kd: [f32; 4],
    pub ke: [f32; 4],
}

pub mod light_kind {
    pub const POINT: i32 = 0;
    pub const DIRECTIONAL: i32 = 1;
    pub const BACKGROUND: i32 = 2;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightRecord {
    pub kind: i32,
    /// Texture index or -1.
    pub texture: i32,
    pub pad: [i32; 2],
    pub position: [f32; 4],
    pub direction: [f32; 4],
    pub intensity: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TextureRecord {
    pub width: i32,
    pub height: i32,
    /// First texel in `texturedata`.
    pub dataoffset: i32,
    pub pad: i32,
}

/// Homogeneous medium. Scenes carry no media yet; one inert record is uploaded.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VolumeRecord {
    pub sigma_a: [f32; 4],
    pub sigma_s: [f32; 4],
    pub emission: [f32; 4],
    pub kind: i32,
    pub phase: i32,
    pub pad: [i32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct CameraRecord {
    pub forward: [f32; 4],
    pub right: [f32; 4],
    pub up: [f32; 4],
    pub position: [f32; 4],
    /// Sensor size at unit focal length.
    pub dim: [f32; 2],
    /// Near and far distance.
    pub zcap: [f32; 2],
    pub focal_length: f32,
    pub aperture: f32,
    pub focus_distance: f32,
    pub aspect: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraType {
    Default,
    Dof,
}

impl CameraType {
    /// Primary-ray generation kernel for this camera.
    pub fn kernel_name(self) -> &'static str {
        match self {
            Self::Default => "PerspectiveCamera_GeneratePaths",
            Self::Dof => "PerspectiveCameraDof_GeneratePaths",
        }
    }
}

/// Read-only device view of a scene.
#[derive(Debug)]
pub struct CompiledScene {
    pub vertices: Buffer,
    pub normals: Buffer,
    pub uvs: Buffer,
    pub indices: Buffer,
    pub shapes: Buffer,
    pub materialids: Buffer,
    pub materials: Buffer,
    pub textures: Buffer,
    pub texturedata: Buffer,
    pub lights: Buffer,
    pub volumes: Buffer,
    pub camera: Buffer,
    pub camera_type: CameraType,
    /// Light index of the environment or -1.
    pub envmapidx: i32,
    pub num_lights: i32,
    pub num_shapes: usize,
    pub num_faces: usize,
    pub revision: u64,
}

/// Host-side arrays before upload.
#[derive(Debug, Default)]
pub(crate) struct SceneArrays {
    pub vertices: Vec<[f32; 4]>,
    pub normals: Vec<[f32; 4]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<i32>,
    pub shapes: Vec<ShapeRecord>,
    pub materialids: Vec<i32>,
    pub materials: Vec<MaterialRecord>,
    pub textures: Vec<TextureRecord>,
    pub texturedata: Vec<[f32; 4]>,
    pub lights: Vec<LightRecord>,
    pub camera: CameraRecord,
}

fn vec4(v: Vec3, w: f32) -> [f32; 4] {
    [v.x, v.y, v.z, w]
}

impl SceneArrays {
    pub fn collect(scene: &Scene) -> Self {
        let mut out = Self::default();

        // Meshes own vertex and index ranges
        let mut ranges = vec![(0i32, 0i32, 0i32); scene.shapes().len()];
        for (i, shape) in scene.shapes().iter().enumerate() {
            if let ShapeKind::Mesh(mesh) = &shape.kind {
                ranges[i] = (
                    out.vertices.len() as i32,
                    out.indices.len() as i32,
                    mesh.num_faces() as i32,
                );
                let normals = if mesh.normals.is_empty() {
                    mesh.generate_normals()
                } else {
                    mesh.normals.clone()
                };
                out.vertices.extend(mesh.positions.iter().map(|p| vec4(*p, 1.0)));
                out.normals.extend(normals.iter().map(|n| vec4(*n, 0.0)));
                if mesh.uvs.is_empty() {
                    out.uvs.extend(std::iter::repeat([0.0; 2]).take(mesh.positions.len()));
                } else {
                    out.uvs.extend(mesh.uvs.iter().map(|uv| uv.to_array()));
                }
                out.indices
                    .extend(mesh.indices.iter().flat_map(|f| f.map(|i| i as i32)));
            }
        }

        for (i, shape) in scene.shapes().iter().enumerate() {
            let (startvtx, startidx, numprims) = match shape.kind {
                ShapeKind::Mesh(_) => ranges[i],
                ShapeKind::Instance { base } => ranges[base],
            };
            out.shapes.push(ShapeRecord {
                numprims,
                startvtx,
                startidx,
                start_material_idx: out.materialids.len() as i32,
                transform: shape.transform.to_cols_array_2d(),
                id: i as i32,
                pad: [0; 3],
            });
            out.materialids
                .extend(std::iter::repeat(shape.material as i32).take(numprims as usize));
        }

        out.materials = scene
            .materials()
            .iter()
            .map(|m| MaterialRecord {
                kd: vec4(m.kd, 0.0),
                ke: vec4(m.ke, 0.0),
            })
            .collect();

        for tex in scene.textures() {
            out.textures.push(TextureRecord {
                width: tex.width as i32,
                height: tex.height as i32,
                dataoffset: out.texturedata.len() as i32,
                pad: 0,
            });
            out.texturedata.extend(tex.texels.iter().map(|t| t.to_array()));
        }

        out.lights = scene
            .lights()
            .iter()
            .map(|light| {
                let mut rec = LightRecord::zeroed();
                rec.texture = -1;
                match *light {
                    Light::Point { position, intensity } => {
                        rec.kind = light_kind::POINT;
                        rec.position = vec4(position, 1.0);
                        rec.intensity = vec4(intensity, 0.0);
                    }
                    Light::Directional { direction, intensity } => {
                        rec.kind = light_kind::DIRECTIONAL;
                        rec.direction = vec4(direction.normalize_or(Vec3::NEG_Y), 0.0);
                        rec.intensity = vec4(intensity, 0.0);
                    }
                    Light::Background { intensity, texture } => {
                        rec.kind = light_kind::BACKGROUND;
                        rec.texture = texture.map_or(-1, |t| t as i32);
                        rec.intensity = vec4(intensity, 0.0);
                    }
                }
                rec
            })
            .collect();

        out.camera = camera_record(scene);
        out
    }
}

fn camera_record(scene: &Scene) -> CameraRecord {
    let cam = scene.camera();
    let forward = (cam.look_at - cam.position).normalize_or(Vec3::NEG_Z);
    let right = forward.cross(cam.up).normalize_or(Vec3::X);
    let up = right.cross(forward);
    let h = 2.0 * (cam.fov_y * 0.5).tan();
    CameraRecord {
        forward: vec4(forward, 0.0),
        right: vec4(right, 0.0),
        up: vec4(up, 0.0),
        position: vec4(cam.position, 1.0),
        dim: [h * cam.aspect, h],
        zcap: [cam.near, cam.far],
        focal_length: 1.0,
        aperture: cam.aperture,
        focus_distance: cam.focus_distance,
        aspect: cam.aspect,
    }
}

/// Upload records; empty arrays get a small placeholder so every argument binds.
fn upload<T: Pod>(device: &dyn Device, data: &[T]) -> Result<Buffer> {
    if data.is_empty() {
        return device.create_buffer(16, BufferType::Read, None);
    }
    device.create_buffer_from(BufferType::Read, data)
}

struct CacheEntry {
    scene_id: u64,
    revision: u64,
    compiled: Arc<CompiledScene>,
}

/// Compiles scenes and keeps the intersection engine in sync with them.
pub struct SceneController {
    device: Arc<dyn Device>,
    api: IntersectionApi,
    cache: Option<CacheEntry>,
    /// (scene id, geometry revision) the engine was last committed with.
    committed: Option<(u64, u64)>,
}

impl std::fmt::Debug for SceneController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneController")
            .field("api", &self.api)
            .field("committed", &self.committed)
            .finish()
    }
}

impl SceneController {
    pub fn new(device: Arc<dyn Device>) -> Result<Self> {
        let api = IntersectionApi::new(device.clone())?;
        Ok(Self {
            device,
            api,
            cache: None,
            committed: None,
        })
    }

    pub fn intersection_api(&self) -> &IntersectionApi {
        &self.api
    }

    pub fn intersection_api_mut(&mut self) -> &mut IntersectionApi {
        &mut self.api
    }

    pub fn bvh_stats(&self) -> Option<&BvhStats> {
        self.api.bvh_stats()
    }

    /// Compiled view of `scene`, rebuilt only when its revision moved.
    /// Geometry edits also rebuild the acceleration structure; a failed
    /// rebuild is returned and retried on the next call.
    #[tracing::instrument(skip_all, fields(scene = scene.id(), revision = scene.revision()))]
    pub fn compile_scene(&mut self, scene: &Scene) -> Result<Arc<CompiledScene>> {
        if let Some(entry) = &self.cache {
            if entry.scene_id == scene.id() && entry.revision == scene.revision() {
                return Ok(entry.compiled.clone());
            }
        }

        let key = (scene.id(), scene.geometry_revision());
        if self.committed != Some(key) {
            self.committed = None;
            self.update_world(scene)?;
            self.committed = Some(key);
        }

        let arrays = SceneArrays::collect(scene);
        let device = self.device.as_ref();
        let compiled = Arc::new(CompiledScene {
            vertices: upload(device, &arrays.vertices)?,
            normals: upload(device, &arrays.normals)?,
            uvs: upload(device, &arrays.uvs)?,
            indices: upload(device, &arrays.indices)?,
            shapes: upload(device, &arrays.shapes)?,
            materialids: upload(device, &arrays.materialids)?,
            materials: upload(device, &arrays.materials)?,
            textures: upload(device, &arrays.textures)?,
            texturedata: upload(device, &arrays.texturedata)?,
            lights: upload(device, &arrays.lights)?,
            volumes: upload(device, &[VolumeRecord { kind: -1, ..VolumeRecord::zeroed() }])?,
            camera: upload(device, &[arrays.camera])?,
            camera_type: if scene.camera().has_dof() {
                CameraType::Dof
            } else {
                CameraType::Default
            },
            envmapidx: scene.envmap_light().map_or(-1, |i| i as i32),
            num_lights: arrays.lights.len() as i32,
            num_shapes: arrays.shapes.len(),
            num_faces: arrays.materialids.len(),
            revision: scene.revision(),
        });

        tracing::debug!(
            shapes = compiled.num_shapes,
            faces = compiled.num_faces,
            lights = compiled.num_lights,
            "scene compiled"
        );

        self.cache = Some(CacheEntry {
            scene_id: scene.id(),
            revision: scene.revision(),
            compiled: compiled.clone(),
        });
        Ok(compiled)
    }

    fn update_world(&mut self, scene: &Scene) -> Result<()> {
        self.api.detach_all();
        for (i, shape) in scene.shapes().iter().enumerate() {
            let id = i as i32;
            let world_shape = match &shape.kind {
                ShapeKind::Mesh(mesh) => {
                    let mut m = Mesh::new(mesh.positions.clone(), mesh.indices.clone());
                    m.transform = shape.transform;
                    Shape::mesh(id, m)
                }
                ShapeKind::Instance { base } => Shape::instance(id, *base as i32, shape.transform),
            };
            self.api.attach_shape(world_shape);
        }
        self.api.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::HostDevice;
    use crate::scene::{Material, SceneMesh};
    use crate::util::Mat4;

    fn quad() -> SceneMesh {
        SceneMesh::new(
            vec![
                Vec3::new(-1.0, -1.0, 0.0),
                Vec3::new(1.0, -1.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(-1.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<ShapeRecord>(), 96);
        assert_eq!(std::mem::size_of::<LightRecord>(), 64);
        assert_eq!(std::mem::size_of::<CameraRecord>(), 96);
    }

    #[test]
    fn test_empty_arrays_are_zeroed() {
        let arrays = SceneArrays::default();
        assert!(arrays.vertices.is_empty());
        assert_eq!(bytemuck::bytes_of(&arrays.camera), &[0u8; 96][..]);
    }

    #[test]
    fn test_instances_share_ranges() {
        let mut scene = Scene::new();
        let red = scene.add_material(Material::diffuse(Vec3::X));
        let q = scene.add_mesh(quad(), 0).unwrap();
        scene.add_mesh(quad(), 0).unwrap();
        scene
            .add_instance(q, Mat4::from_translation(Vec3::Z), red)
            .unwrap();

        let arrays = SceneArrays::collect(&scene);
        assert_eq!(arrays.vertices.len(), 8);
        assert_eq!(arrays.indices.len(), 12);
        let inst = arrays.shapes[2];
        assert_eq!((inst.startvtx, inst.startidx, inst.numprims), (0, 0, 2));
        assert_eq!(inst.start_material_idx, 4);
        assert_eq!(arrays.shapes[1].startvtx, 4);
        assert_eq!(&arrays.materialids[4..], &[red as i32; 2]);
        assert_eq!(arrays.normals[0], [0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_compile_is_cached_per_revision() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let mut controller = SceneController::new(device).unwrap();
        let mut scene = Scene::new();
        scene.add_mesh(quad(), 0).unwrap();

        let a = controller.compile_scene(&scene).unwrap();
        let b = controller.compile_scene(&scene).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(controller.bvh_stats().unwrap().index_count, 2);

        scene.set_camera(crate::scene::Camera { aperture: 0.1, ..Default::default() });
        let c = controller.compile_scene(&scene).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.camera_type, CameraType::Dof);
        assert_eq!(c.envmapidx, -1);
    }
}
