use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("no space left: need {needed} cluster(s), found {available}")]
    NoSpace { needed: u32, available: u32 },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("volume corrupted: {0}")]
    Corruption(String),

    #[error("invalid volume geometry: {0}")]
    InvalidGeometry(String),

    #[error("unsupported volume: {0}")]
    Unsupported(String),

    /// A mutation failed after its first destructive write; the image is left
    /// in an intermediate state.
    #[error("{operation} partially applied, volume may be inconsistent: {source}")]
    PartialFailure {
        operation: &'static str,
        #[source]
        source: Box<VolumeError>,
    },
}

impl VolumeError {
    /// Whether the failure happened after the image was already modified.
    pub fn is_partial(&self) -> bool {
        matches!(self, VolumeError::PartialFailure { .. })
    }
}
