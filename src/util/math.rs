//! Math type re-exports and the axis-aligned bounding box used by the
//! BVH builder and the scene compiler.

pub use glam::{Mat3, Mat4, Quat, UVec2, Vec2, Vec3, Vec3A, Vec4};

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// 3D bounding box with single precision.
#[derive(Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BBox {
    /// Empty bounding box (inverted, will expand on first point).
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn from_point(p: Vec3) -> Self {
        Self { min: p, max: p }
    }

    /// Bounds of a set of points.
    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Self {
        let mut b = Self::EMPTY;
        for p in points {
            b.expand_by_point(p);
        }
        b
    }

    /// Check if this box is empty (inverted on any axis).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    #[inline]
    pub fn expand_by_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    #[inline]
    pub fn expand_by_box(&mut self, other: &Self) {
        if !other.is_empty() {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        let mut b = *self;
        b.expand_by_box(other);
        b
    }

    /// Overlap of two boxes; empty when they are disjoint.
    #[inline]
    pub fn intersection(&self, other: &Self) -> Self {
        let b = Self {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        };
        if b.is_empty() {
            Self::EMPTY
        } else {
            b
        }
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Surface area, zero for an empty box.
    #[inline]
    pub fn surface_area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.size();
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Longest axis (0=x, 1=y, 2=z), ties resolve to the lower axis.
    #[inline]
    pub fn longest_axis(&self) -> usize {
        let d = self.size();
        if d.x >= d.y && d.x >= d.z {
            0
        } else if d.y >= d.z {
            1
        } else {
            2
        }
    }

    /// Whether `other` lies inside this box, with a relative tolerance.
    pub fn contains_box(&self, other: &Self, eps: f32) -> bool {
        if other.is_empty() {
            return true;
        }
        let tol = Vec3::splat(eps) * (Vec3::ONE + self.size().abs());
        other.min.cmpge(self.min - tol).all() && other.max.cmple(self.max + tol).all()
    }

    /// Portion of this box on one side of an axis-aligned plane.
    pub fn clip(&self, axis: usize, lo: f32, hi: f32) -> Self {
        let mut b = *self;
        b.min[axis] = b.min[axis].max(lo);
        b.max[axis] = b.max[axis].min(hi);
        if b.is_empty() {
            Self::EMPTY
        } else {
            b
        }
    }

    /// Bounds of this box after an affine transform.
    pub fn transformed(&self, m: &Mat4) -> Self {
        if self.is_empty() {
            return Self::EMPTY;
        }
        let mut out = Self::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.expand_by_point(m.transform_point3(corner));
        }
        out
    }
}

impl Default for BBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BBox({:?} - {:?})", self.min, self.max)
    }
}

/// Round `n` up to the next multiple of `m`.
#[inline]
pub fn align_up(n: usize, m: usize) -> usize {
    n.div_ceil(m) * m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox() {
        let mut b = BBox::EMPTY;
        assert!(b.is_empty());
        assert_eq!(b.surface_area(), 0.0);

        b.expand_by_point(Vec3::ZERO);
        b.expand_by_point(Vec3::ONE);
        assert_eq!(b.center(), Vec3::splat(0.5));
        assert_eq!(b.size(), Vec3::ONE);
        assert_eq!(b.surface_area(), 6.0);
    }

    #[test]
    fn test_longest_axis_tie() {
        let b = BBox::new(Vec3::ZERO, Vec3::new(2.0, 2.0, 1.0));
        assert_eq!(b.longest_axis(), 0);
        let b = BBox::new(Vec3::ZERO, Vec3::new(1.0, 3.0, 3.0));
        assert_eq!(b.longest_axis(), 1);
    }

    #[test]
    fn test_intersection_and_clip() {
        let a = BBox::new(Vec3::ZERO, Vec3::splat(2.0));
        let b = BBox::new(Vec3::ONE, Vec3::splat(3.0));
        assert_eq!(a.intersection(&b), BBox::new(Vec3::ONE, Vec3::splat(2.0)));

        let far = BBox::new(Vec3::splat(5.0), Vec3::splat(6.0));
        assert!(a.intersection(&far).is_empty());

        let left = a.clip(0, f32::NEG_INFINITY, 0.5);
        assert_eq!(left.max.x, 0.5);
        assert!(a.clip(0, 3.0, 4.0).is_empty());
    }

    #[test]
    fn test_transformed() {
        let b = BBox::new(Vec3::splat(-1.0), Vec3::ONE);
        let t = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let moved = b.transformed(&t);
        assert_eq!(moved.min, Vec3::new(9.0, -1.0, -1.0));
        assert!(moved.contains_box(&BBox::from_point(Vec3::new(10.0, 0.0, 0.0)), 0.0));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(256, 64), 256);
        assert_eq!(align_up(257, 8), 264);
    }

    #[test]
    fn test_bbox_pod() {
        assert_eq!(std::mem::size_of::<BBox>(), 24);
    }
}
