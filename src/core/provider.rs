//! Face embedding extraction.
//!
//! The session state machine and the HTTP handlers only see the
//! [`EmbeddingProvider`] trait; the ONNX pipeline is one implementation and
//! tests substitute their own.

use std::sync::Arc;

use crate::common::{Config, FaceIdError, Result};
use crate::core::detector::{FaceBox, FaceDetector};
use crate::core::recognizer::{Embedding, FaceRecognizer};

/// Turns an encoded image into one embedding per face found in it.
pub trait EmbeddingProvider: Send + Sync + 'static {
    fn extract(&self, image: &[u8]) -> Result<Vec<Embedding>>;
}

/// Bounding-box detection without embeddings, used by `/detect`.
pub trait FaceLocator: Send + Sync + 'static {
    fn locate(&self, image: &[u8]) -> Result<Vec<FaceBox>>;
}

pub struct OnnxEmbeddingProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbeddingProvider {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            detector: FaceDetector::new(config)?,
            recognizer: FaceRecognizer::new(config)?,
        })
    }
}

impl EmbeddingProvider for OnnxEmbeddingProvider {
    fn extract(&self, image: &[u8]) -> Result<Vec<Embedding>> {
        let frame = image::load_from_memory(image)?;
        let faces = self.detector.detect(&frame)?;
        tracing::debug!(faces = faces.len(), "detected faces");

        faces
            .iter()
            .map(|face| self.recognizer.get_embedding(&frame, face))
            .collect()
    }
}

impl FaceLocator for OnnxEmbeddingProvider {
    fn locate(&self, image: &[u8]) -> Result<Vec<FaceBox>> {
        let frame = image::load_from_memory(image)?;
        self.detector.detect(&frame)
    }
}

/// Runs extraction on the blocking pool so a slow model never stalls the
/// connection tasks sharing the runtime.
pub async fn extract_off_thread(
    provider: Arc<dyn EmbeddingProvider>,
    image: Vec<u8>,
) -> Result<Vec<Embedding>> {
    tokio::task::spawn_blocking(move || provider.extract(&image))
        .await
        .map_err(|e| FaceIdError::Model(format!("Extraction task failed: {}", e)))?
}

pub async fn locate_off_thread(
    locator: Arc<dyn FaceLocator>,
    image: Vec<u8>,
) -> Result<Vec<FaceBox>> {
    tokio::task::spawn_blocking(move || locator.locate(&image))
        .await
        .map_err(|e| FaceIdError::Model(format!("Detection task failed: {}", e)))?
}

/// Accepts exactly one face; zero or several are rejected.
pub fn single_face(mut embeddings: Vec<Embedding>) -> Result<Embedding> {
    match embeddings.len() {
        0 => Err(FaceIdError::NoFaceDetected),
        1 => Ok(embeddings.remove(0)),
        n => Err(FaceIdError::MultipleFacesDetected(n)),
    }
}
