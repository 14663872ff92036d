//! Render targets.

use std::fmt;

use crate::compute::{Buffer, BufferType, Device, DeviceExt};
use crate::util::{Error, Result, Vec3};

/// Output slot. `Color` receives the path-traced image, the rest are AOVs
/// filled by a single-bounce pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputType {
    Color,
    WorldPosition,
    ShadingNormal,
    GeometricNormal,
    Uv,
    Wireframe,
    Albedo,
    Tangent,
    Bitangent,
    Gloss,
    Depth,
}

impl OutputType {
    pub const COUNT: usize = 11;

    pub const ALL: [OutputType; Self::COUNT] = [
        Self::Color,
        Self::WorldPosition,
        Self::ShadingNormal,
        Self::GeometricNormal,
        Self::Uv,
        Self::Wireframe,
        Self::Albedo,
        Self::Tangent,
        Self::Bitangent,
        Self::Gloss,
        Self::Depth,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_aov(self) -> bool {
        self != Self::Color
    }

    /// AOV slots in kernel argument order.
    pub fn aovs() -> impl Iterator<Item = OutputType> {
        Self::ALL.into_iter().skip(1)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::WorldPosition => "world_position",
            Self::ShadingNormal => "shading_normal",
            Self::GeometricNormal => "geometric_normal",
            Self::Uv => "uv",
            Self::Wireframe => "wireframe",
            Self::Albedo => "albedo",
            Self::Tangent => "tangent",
            Self::Bitangent => "bitangent",
            Self::Gloss => "gloss",
            Self::Depth => "depth",
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for OutputType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| Error::invalid(format!("unknown output type '{}'", s)))
    }
}

/// Accumulation image: one `[r, g, b, samples]` float4 per pixel, rows from
/// the bottom. Clones share the device buffer.
#[derive(Debug, Clone)]
pub struct Output {
    width: u32,
    height: u32,
    data: Buffer,
}

impl Output {
    pub fn new(device: &dyn Device, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::invalid(format!("output size {}x{}", width, height)));
        }
        let size = width as usize * height as usize * std::mem::size_of::<[f32; 4]>();
        let data = device.create_buffer(size, BufferType::ReadWrite, None)?;
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn data(&self) -> &Buffer {
        &self.data
    }

    /// Set every pixel to `(value, 0)`.
    pub fn clear(&self, device: &dyn Device, value: Vec3) -> Result<()> {
        let pattern: [f32; 4] = [value.x, value.y, value.z, 0.0];
        device
            .fill_buffer(&self.data, 0, bytemuck::bytes_of(&pattern), 0, self.data.size())?
            .wait()
    }

    /// Raw accumulated values.
    pub fn read(&self, device: &dyn Device) -> Result<Vec<[f32; 4]>> {
        device.read_pod(&self.data, self.pixel_count())
    }

    /// Accumulated values divided by their sample counts.
    pub fn resolve(&self, device: &dyn Device) -> Result<Vec<Vec3>> {
        Ok(self
            .read(device)?
            .into_iter()
            .map(|[r, g, b, w]| {
                if w > 0.0 {
                    Vec3::new(r, g, b) / w
                } else {
                    Vec3::ZERO
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::HostDevice;

    #[test]
    fn test_output_type_order() {
        assert_eq!(OutputType::ALL.len(), OutputType::COUNT);
        for (i, t) in OutputType::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
            assert_eq!(t.name().parse::<OutputType>().unwrap(), *t);
        }
        assert_eq!(OutputType::aovs().count(), 10);
        assert!("beauty".parse::<OutputType>().is_err());
    }

    #[test]
    fn test_clear_and_resolve() {
        let device = HostDevice::new();
        let out = Output::new(&device, 2, 2).unwrap();
        out.clear(&device, Vec3::new(1.0, 2.0, 3.0)).unwrap();
        assert_eq!(out.read(&device).unwrap()[3], [1.0, 2.0, 3.0, 0.0]);
        assert_eq!(out.resolve(&device).unwrap()[0], Vec3::ZERO);
        assert!(Output::new(&device, 0, 4).is_err());
    }
}
