use thiserror::Error;

pub type Result<T, E = ArrayError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArrayError {
    /// Broadcast, reshape, permute or matmul dimensions that do not line up.
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Allocation of {bytes} bytes failed: {message}")]
    Allocation { bytes: u64, message: String },

    #[error("Kernel `{kernel}` failed to compile: {message}")]
    Compile { kernel: String, message: String },

    /// Adapter/device acquisition or a failed readback.
    #[error("Device error: {0}")]
    Device(String),
}

impl ArrayError {
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }

    pub(crate) fn index(message: impl Into<String>) -> Self {
        Self::Index(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation(message.into())
    }
}
