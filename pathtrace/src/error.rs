use std::io;
use thiserror::Error;

/// Errors raised while preparing a scene or rendering a frame.
#[derive(Error, Debug)]
pub enum Error {
    /// The backend could not provide memory of the requested size.
    #[error("failed to allocate {size} bytes for {what}")]
    Allocation { what: &'static str, size: u64 },

    /// A resource was used before the step that produces it completed.
    #[error("build order violation: {0}")]
    BuildOrderViolation(String),

    /// A backend build, pipeline or dispatch call reported failure.
    #[error("backend call {call} failed: {message}")]
    Backend { call: &'static str, message: String },

    /// Mesh data that cannot describe a triangle list.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    /// Render options outside their usable range.
    #[error("invalid render options: {0}")]
    InvalidOptions(String),

    /// Per-mesh material ranges do not match the flat material table.
    #[error("material range mismatch: {0}")]
    MaterialRangeMismatch(String),

    /// Failed to read shader code.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn backend(call: &'static str, message: impl ToString) -> Self {
        Self::Backend {
            call,
            message: message.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
