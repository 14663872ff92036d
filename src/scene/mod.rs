//! Scene description consumed by the renderer.
//!
//! A [`Scene`] holds meshes, instances, materials, lights, textures and a
//! camera. Every edit bumps a revision counter; edits that move or replace
//! geometry also bump the geometry revision, which is what forces the
//! intersection engine to rebuild. [`compiler::SceneController`] flattens a
//! scene into device buffers and caches the result per revision.

pub mod compiler;
pub mod demo;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::util::{Error, Mat4, Result, Vec2, Vec3, Vec4};

pub use compiler::{CameraType, CompiledScene, SceneController};

static NEXT_SCENE_ID: AtomicU64 = AtomicU64::new(1);

/// Triangle mesh in object space. Empty `normals` are generated, empty
/// `uvs` default to zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneMesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub indices: Vec<[u32; 3]>,
}

impl SceneMesh {
    pub fn new(positions: Vec<Vec3>, indices: Vec<[u32; 3]>) -> Self {
        Self {
            positions,
            indices,
            ..Default::default()
        }
    }

    pub fn num_faces(&self) -> usize {
        self.indices.len()
    }

    fn validate(&self) -> Result<()> {
        let n = self.positions.len();
        if let Some(f) = self.indices.iter().find(|f| f.iter().any(|&i| i as usize >= n)) {
            return Err(Error::invalid(format!(
                "face {:?} indexes past {} positions",
                f, n
            )));
        }
        if !self.normals.is_empty() && self.normals.len() != n {
            return Err(Error::invalid("normal count differs from position count"));
        }
        if !self.uvs.is_empty() && self.uvs.len() != n {
            return Err(Error::invalid("uv count differs from position count"));
        }
        Ok(())
    }

    /// Per-vertex normals averaged from area-weighted face normals.
    pub fn generate_normals(&self) -> Vec<Vec3> {
        let mut normals = vec![Vec3::ZERO; self.positions.len()];
        for f in &self.indices {
            let [a, b, c] = f.map(|i| self.positions[i as usize]);
            let n = (b - a).cross(c - a);
            for &i in f {
                normals[i as usize] += n;
            }
        }
        normals.iter().map(|n| n.normalize_or(Vec3::Y)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeKind {
    Mesh(SceneMesh),
    /// Re-placement of the mesh at shape index `base`.
    Instance { base: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneShape {
    pub kind: ShapeKind,
    pub transform: Mat4,
    pub material: usize,
}

/// Diffuse reflectance plus emission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub kd: Vec3,
    pub ke: Vec3,
}

impl Material {
    pub fn diffuse(kd: Vec3) -> Self {
        Self { kd, ke: Vec3::ZERO }
    }

    pub fn emissive(ke: Vec3) -> Self {
        Self { kd: Vec3::ZERO, ke }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::diffuse(Vec3::splat(0.7))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Light {
    Point { position: Vec3, intensity: Vec3 },
    Directional { direction: Vec3, intensity: Vec3 },
    /// Environment: constant `intensity`, scaled by a lat-long texture if given.
    Background { intensity: Vec3, texture: Option<usize> },
}

/// RGBA float texture, row-major from the top row.
#[derive(Debug, Clone, PartialEq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<Vec4>,
}

impl Texture {
    pub fn new(width: u32, height: u32, texels: Vec<Vec4>) -> Result<Self> {
        if texels.len() != (width * height) as usize {
            return Err(Error::invalid(format!(
                "{}x{} texture with {} texels",
                width,
                height,
                texels.len()
            )));
        }
        Ok(Self { width, height, texels })
    }

    pub fn constant(color: Vec4) -> Self {
        Self {
            width: 1,
            height: 1,
            texels: vec![color],
        }
    }
}

/// Perspective camera; a non-zero aperture turns on depth of field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub look_at: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    /// Width over height.
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub aperture: f32,
    pub focus_distance: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            look_at: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: 45f32.to_radians(),
            aspect: 1.0,
            near: 0.01,
            far: 10000.0,
            aperture: 0.0,
            focus_distance: 1.0,
        }
    }
}

impl Camera {
    pub fn look_at(position: Vec3, look_at: Vec3, up: Vec3) -> Self {
        Self {
            position,
            look_at,
            up,
            ..Default::default()
        }
    }

    pub fn has_dof(&self) -> bool {
        self.aperture > 0.0
    }
}

#[derive(Debug, Clone)]
pub struct Scene {
    id: u64,
    revision: u64,
    geometry_revision: u64,
    shapes: Vec<SceneShape>,
    materials: Vec<Material>,
    lights: Vec<Light>,
    textures: Vec<Texture>,
    camera: Camera,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    /// Empty scene with one default material.
    pub fn new() -> Self {
        Self {
            id: NEXT_SCENE_ID.fetch_add(1, Ordering::Relaxed),
            revision: 1,
            geometry_revision: 1,
            shapes: Vec::new(),
            materials: vec![Material::default()],
            lights: Vec::new(),
            textures: Vec::new(),
            camera: Camera::default(),
        }
    }

    /// Process-unique scene id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn geometry_revision(&self) -> u64 {
        self.geometry_revision
    }

    fn touch(&mut self, geometry: bool) {
        self.revision += 1;
        if geometry {
            self.geometry_revision += 1;
        }
    }

    pub fn add_material(&mut self, material: Material) -> usize {
        self.materials.push(material);
        self.touch(false);
        self.materials.len() - 1
    }

    pub fn add_mesh(&mut self, mesh: SceneMesh, material: usize) -> Result<usize> {
        mesh.validate()?;
        self.check_material(material)?;
        self.shapes.push(SceneShape {
            kind: ShapeKind::Mesh(mesh),
            transform: Mat4::IDENTITY,
            material,
        });
        self.touch(true);
        Ok(self.shapes.len() - 1)
    }

    pub fn add_instance(&mut self, base: usize, transform: Mat4, material: usize) -> Result<usize> {
        match self.shapes.get(base).map(|s| &s.kind) {
            Some(ShapeKind::Mesh(_)) => {}
            Some(ShapeKind::Instance { .. }) => {
                return Err(Error::invalid(format!("shape {} is an instance", base)))
            }
            None => return Err(Error::invalid(format!("no shape {}", base))),
        }
        self.check_material(material)?;
        self.shapes.push(SceneShape {
            kind: ShapeKind::Instance { base },
            transform,
            material,
        });
        self.touch(true);
        Ok(self.shapes.len() - 1)
    }

    pub fn set_transform(&mut self, shape: usize, transform: Mat4) -> Result<()> {
        let s = self
            .shapes
            .get_mut(shape)
            .ok_or_else(|| Error::invalid(format!("no shape {}", shape)))?;
        s.transform = transform;
        self.touch(true);
        Ok(())
    }

    pub fn add_light(&mut self, light: Light) -> Result<usize> {
        if let Light::Background { texture: Some(t), .. } = light {
            if t >= self.textures.len() {
                return Err(Error::invalid(format!("no texture {}", t)));
            }
        }
        self.lights.push(light);
        self.touch(false);
        Ok(self.lights.len() - 1)
    }

    pub fn add_texture(&mut self, texture: Texture) -> usize {
        self.textures.push(texture);
        self.touch(false);
        self.textures.len() - 1
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
        self.touch(false);
    }

    fn check_material(&self, material: usize) -> Result<()> {
        if material >= self.materials.len() {
            return Err(Error::invalid(format!("no material {}", material)));
        }
        Ok(())
    }

    pub fn shapes(&self) -> &[SceneShape] {
        &self.shapes
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    pub fn textures(&self) -> &[Texture] {
        &self.textures
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Index of the first background light, which drives miss shading.
    pub fn envmap_light(&self) -> Option<usize> {
        self.lights
            .iter()
            .position(|l| matches!(l, Light::Background { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri() -> SceneMesh {
        SceneMesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![[0, 1, 2]])
    }

    #[test]
    fn test_revisions() {
        let mut s = Scene::new();
        let (r, g) = (s.revision(), s.geometry_revision());
        s.set_camera(Camera::default());
        assert_eq!(s.revision(), r + 1);
        assert_eq!(s.geometry_revision(), g);
        let m = s.add_mesh(tri(), 0).unwrap();
        s.set_transform(m, Mat4::from_translation(Vec3::X)).unwrap();
        assert_eq!(s.geometry_revision(), g + 2);
        assert_ne!(Scene::new().id(), s.id());
    }

    #[test]
    fn test_validation() {
        let mut s = Scene::new();
        let bad = SceneMesh::new(vec![Vec3::ZERO], vec![[0, 1, 2]]);
        assert!(s.add_mesh(bad, 0).is_err());
        assert!(s.add_mesh(tri(), 5).is_err());
        let m = s.add_mesh(tri(), 0).unwrap();
        let i = s.add_instance(m, Mat4::IDENTITY, 0).unwrap();
        assert!(s.add_instance(i, Mat4::IDENTITY, 0).is_err());
        assert!(s.add_light(Light::Background { intensity: Vec3::ONE, texture: Some(0) }).is_err());
    }

    #[test]
    fn test_generated_normals() {
        let n = tri().generate_normals();
        assert_eq!(n, vec![Vec3::Z; 3]);
    }

    #[test]
    fn test_envmap_light() {
        let mut s = Scene::new();
        assert_eq!(s.envmap_light(), None);
        s.add_light(Light::Point { position: Vec3::Y, intensity: Vec3::ONE }).unwrap();
        s.add_light(Light::Background { intensity: Vec3::ONE, texture: None }).unwrap();
        assert_eq!(s.envmap_light(), Some(1));
    }
}
