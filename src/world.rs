//! Shapes handed to the intersection engine.
//!
//! A world holds meshes and instances of meshes plus the `bvh.*` options.
//! It tracks two kinds of dirtiness: structural changes (shapes attached or
//! detached, options edited) via [`World::has_changed`], and per-shape edits
//! (transforms, masks) via [`World::state_change`]. Either one forces the
//! accelerator to rebuild on the next commit.

use std::ops::BitOr;

use crate::util::{BBox, Mat4, Options, Vec3};

/// Per-shape dirty bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateChange(u32);

impl StateChange {
    pub const NONE: Self = Self(0);
    pub const TRANSFORM: Self = Self(0x1);
    pub const GEOMETRY: Self = Self(0x2);
    pub const MASK: Self = Self(0x4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for StateChange {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Triangle mesh in object space.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vec3>,
    pub faces: Vec<[u32; 3]>,
    pub transform: Mat4,
}

impl Mesh {
    pub fn new(vertices: Vec<Vec3>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            faces,
            transform: Mat4::IDENTITY,
        }
    }

    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Bounds of one face, in object space or after the mesh transform.
    pub fn face_bounds(&self, face: usize, object_space: bool) -> BBox {
        let f = self.faces[face];
        let corners = f.iter().map(|&i| self.vertices[i as usize]);
        if object_space {
            BBox::from_points(corners)
        } else {
            BBox::from_points(corners.map(|v| self.transform.transform_point3(v)))
        }
    }

    /// Vertices after the mesh transform.
    pub fn world_vertices(&self) -> impl Iterator<Item = Vec3> + '_ {
        self.vertices.iter().map(|v| self.transform.transform_point3(*v))
    }
}

/// Shape payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeKind {
    Mesh(Mesh),
    /// Re-placement of a mesh with its own transform.
    Instance { base_shape_id: i32, transform: Mat4 },
}

/// A shape registered with a world.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub id: i32,
    pub kind: ShapeKind,
    /// Visibility mask matched against `Ray::extra[0]` when ray masks are on.
    pub mask: i32,
    pub(crate) state: StateChange,
}

impl Shape {
    pub fn mesh(id: i32, mesh: Mesh) -> Self {
        Self {
            id,
            kind: ShapeKind::Mesh(mesh),
            mask: -1,
            state: StateChange::NONE,
        }
    }

    pub fn instance(id: i32, base_shape_id: i32, transform: Mat4) -> Self {
        Self {
            id,
            kind: ShapeKind::Instance {
                base_shape_id,
                transform,
            },
            mask: -1,
            state: StateChange::NONE,
        }
    }

    pub fn is_instance(&self) -> bool {
        matches!(self.kind, ShapeKind::Instance { .. })
    }

    pub fn as_mesh(&self) -> Option<&Mesh> {
        match &self.kind {
            ShapeKind::Mesh(m) => Some(m),
            ShapeKind::Instance { .. } => None,
        }
    }

    pub fn transform(&self) -> Mat4 {
        match &self.kind {
            ShapeKind::Mesh(m) => m.transform,
            ShapeKind::Instance { transform, .. } => *transform,
        }
    }

    pub fn set_transform(&mut self, m: Mat4) {
        match &mut self.kind {
            ShapeKind::Mesh(mesh) => mesh.transform = m,
            ShapeKind::Instance { transform, .. } => *transform = m,
        }
        self.state = self.state | StateChange::TRANSFORM;
    }

    pub fn set_mask(&mut self, mask: i32) {
        self.mask = mask;
        self.state = self.state | StateChange::MASK;
    }

    pub fn state_change(&self) -> StateChange {
        self.state
    }
}

/// Shapes plus accelerator options.
#[derive(Debug, Clone, Default)]
pub struct World {
    shapes: Vec<Shape>,
    options: Options,
    changed: bool,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_shape(&mut self, shape: Shape) {
        self.shapes.retain(|s| s.id != shape.id);
        self.shapes.push(shape);
        self.changed = true;
    }

    pub fn detach_shape(&mut self, id: i32) -> Option<Shape> {
        let pos = self.shapes.iter().position(|s| s.id == id)?;
        self.changed = true;
        Some(self.shapes.remove(pos))
    }

    pub fn detach_all(&mut self) {
        if !self.shapes.is_empty() {
            self.changed = true;
        }
        self.shapes.clear();
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn shape(&self, id: i32) -> Option<&Shape> {
        self.shapes.iter().find(|s| s.id == id)
    }

    pub fn shape_mut(&mut self, id: i32) -> Option<&mut Shape> {
        self.shapes.iter_mut().find(|s| s.id == id)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Editing options marks the world changed.
    pub fn options_mut(&mut self) -> &mut Options {
        self.changed = true;
        &mut self.options
    }

    pub fn has_changed(&self) -> bool {
        self.changed
    }

    /// Union of all per-shape dirty bits.
    pub fn state_change(&self) -> StateChange {
        self.shapes
            .iter()
            .fold(StateChange::NONE, |acc, s| acc | s.state)
    }

    /// Clear dirty state after the accelerator caught up.
    pub fn on_commit(&mut self) {
        self.changed = false;
        for s in &mut self.shapes {
            s.state = StateChange::NONE;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}
