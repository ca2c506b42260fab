use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceIdError {
    #[error("No face detected.")]
    NoFaceDetected,

    #[error("Multiple faces detected.")]
    MultipleFacesDetected(usize),

    #[error("{0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Registration was cancelled.")]
    AlreadyCancelled,

    #[error("Invalid API Key")]
    Unauthorized,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl FaceIdError {
    pub fn is_storage(&self) -> bool {
        matches!(self, FaceIdError::Storage(_) | FaceIdError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, FaceIdError>;
