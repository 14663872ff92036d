//! Error types for the renderer and the intersection engine.

use thiserror::Error;

/// Main error type for device, accelerator and renderer operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A hard device or accelerator limit would be exceeded
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Spatial-split budget ran out; recovered inside the builder
    #[error("BVH build aborted: spatial split budget exceeded")]
    BuildAborted,

    /// Requested compute backend is not compiled in
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Program failed to build or lacks an entry point
    #[error("Executable compile failure:\n{log}")]
    ExecutableCompileFailure { log: String },

    /// Buffer larger than the device allows
    #[error("Allocation of {requested} bytes exceeds device maximum of {max} bytes")]
    AllocationFailure { requested: u64, max: u64 },

    /// Caller passed something unusable
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation called in the wrong order
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Named kernel missing from an executable
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid argument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a resource exhausted error.
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a compile failure carrying the build log.
    pub fn compile(log: impl Into<String>) -> Self {
        Self::ExecutableCompileFailure { log: log.into() }
    }
}

/// Result type alias for renderer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::AllocationFailure { requested: 4096, max: 1024 };
        assert!(e.to_string().contains("4096"));
        assert!(e.to_string().contains("1024"));

        let e = Error::exhausted("stack overflow risk");
        assert!(e.to_string().contains("stack overflow risk"));

        let e = Error::compile("line 3: unknown identifier");
        assert!(e.to_string().contains("line 3"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
