//! Utility types shared by every stage of the renderer.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`BBox`] and math re-exports from glam
//! - [`Options`] - String-keyed accelerator settings

mod error;
mod math;
mod options;

pub use error::*;
pub use math::*;
pub use options::*;
