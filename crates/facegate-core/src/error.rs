use thiserror::Error;

/// Errors surfaced by the enrollment and matching workflow.
#[derive(Error, Debug)]
pub enum FaceError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("invalid resident id: {0}")]
    InvalidIdentity(String),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("resident image not found: {0}")]
    IdentityNotFound(String),
    #[error("failed to write reference image: {0}")]
    StoreWrite(#[source] std::io::Error),
    #[error("failed to read reference image: {0}")]
    StoreRead(#[source] std::io::Error),
    #[error("feature extraction failed: {0}")]
    ExtractionBackend(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FaceError {
    /// Short machine-readable kind, stable across message wording changes.
    pub fn kind(&self) -> &'static str {
        match self {
            FaceError::InvalidImage(_) => "invalid_image",
            FaceError::InvalidIdentity(_) => "invalid_identity",
            FaceError::NoFaceDetected => "no_face_detected",
            FaceError::IdentityNotFound(_) => "identity_not_found",
            FaceError::StoreWrite(_) => "store_write",
            FaceError::StoreRead(_) => "store_read",
            FaceError::ExtractionBackend(_) => "extraction_backend",
            FaceError::Config(_) => "config",
        }
    }
}
