//! GPU-visible ray, hit and path records.
//!
//! Layouts are fixed: kernels index these arrays directly, so every struct is
//! `#[repr(C)]` and `Pod`.

use bytemuck::{Pod, Zeroable};

use crate::util::Vec3;

/// Ray, 48 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Ray {
    /// Origin; `w` is the max distance.
    pub o: [f32; 4],
    /// Direction; `w` is the time.
    pub d: [f32; 4],
    /// `x` visibility mask, `y` active flag.
    pub extra: [i32; 2],
    pub padding: [f32; 2],
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3, max_t: f32) -> Self {
        Self {
            o: [origin.x, origin.y, origin.z, max_t],
            d: [direction.x, direction.y, direction.z, 0.0],
            extra: [-1, 1],
            padding: [0.0; 2],
        }
    }

    pub fn origin(&self) -> Vec3 {
        Vec3::new(self.o[0], self.o[1], self.o[2])
    }

    pub fn direction(&self) -> Vec3 {
        Vec3::new(self.d[0], self.d[1], self.d[2])
    }

    pub fn max_t(&self) -> f32 {
        self.o[3]
    }

    pub fn mask(&self) -> i32 {
        self.extra[0]
    }

    pub fn is_active(&self) -> bool {
        self.extra[1] != 0
    }

    pub fn set_active(&mut self, active: bool) {
        self.extra[1] = active as i32;
    }
}

/// Closest-hit record, 32 bytes. Misses have `shapeid == primid == -1`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Intersection {
    pub shapeid: i32,
    pub primid: i32,
    pub padding: [i32; 2],
    /// Barycentric u, v, unused, distance t.
    pub uvwt: [f32; 4],
}

impl Intersection {
    pub const MISS: Self = Self {
        shapeid: MISS_MARKER,
        primid: MISS_MARKER,
        padding: [0; 2],
        uvwt: [0.0; 4],
    };

    pub fn is_hit(&self) -> bool {
        self.shapeid != MISS_MARKER
    }
}

/// Occlusion result: blocked.
pub const HIT_MARKER: i32 = 1;
/// Occlusion result: clear; also the id of a missed intersection.
pub const MISS_MARKER: i32 = -1;

/// Per-pixel path state, 32 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PathState {
    pub throughput: [f32; 4],
    /// Medium id or -1.
    pub volume: i32,
    pub flags: i32,
    pub extra0: i32,
    pub extra1: i32,
}

pub mod path_flags {
    pub const ALIVE: i32 = 0x1;
    pub const SCATTERED: i32 = 0x2;
    pub const SPECULAR: i32 = 0x4;
}

impl PathState {
    pub fn is_alive(&self) -> bool {
        self.flags & path_flags::ALIVE != 0
    }

    pub fn kill(&mut self) {
        self.flags &= !path_flags::ALIVE;
    }

    pub fn throughput(&self) -> Vec3 {
        Vec3::new(self.throughput[0], self.throughput[1], self.throughput[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<Ray>(), 48);
        assert_eq!(std::mem::size_of::<Intersection>(), 32);
        assert_eq!(std::mem::size_of::<PathState>(), 32);
    }

    #[test]
    fn test_ray_accessors() {
        let mut r = Ray::new(Vec3::ZERO, Vec3::Z, 100.0);
        assert_eq!(r.max_t(), 100.0);
        assert!(r.is_active());
        r.set_active(false);
        assert!(!r.is_active());
    }

    #[test]
    fn test_path_flags() {
        let mut p = PathState::zeroed();
        p.flags = path_flags::ALIVE | path_flags::SPECULAR;
        assert!(p.is_alive());
        p.kill();
        assert!(!p.is_alive());
        assert_eq!(p.flags, path_flags::SPECULAR);
    }
}
