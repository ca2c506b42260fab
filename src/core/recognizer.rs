use crate::common::{Config, FaceIdError, Result};
use crate::core::detector::{optimization_level, FaceBox};
use ort::{Environment, Session, SessionBuilder, Value};
use std::sync::Arc;
use image::{DynamicImage, imageops::FilterType};
use ndarray::{Array4, CowArray};

pub type Embedding = Vec<f32>;

pub struct FaceRecognizer {
    session: Session,
    _environment: Arc<Environment>,
    input_size: u32,
    normalization_value: f32,
}

impl FaceRecognizer {
    pub fn new(config: &Config) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_recognizer")
                .build()
                .map_err(|e| FaceIdError::Model(format!("Failed to create environment: {}", e)))?
        );

        let model_path = &config.models.recognizer_path;
        if !model_path.exists() {
            return Err(FaceIdError::Model(
                format!("Recognition model not found at: {:?}", model_path)
            ));
        }

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(optimization_level(config.performance.optimization_level))?
            .with_model_from_file(model_path)?;

        Ok(Self {
            session,
            _environment: environment,
            input_size: config.recognizer.input_size,
            normalization_value: config.recognizer.normalization_value,
        })
    }

    /// Unit-length embedding for the face inside `face`.
    pub fn get_embedding(&self, image: &DynamicImage, face: &FaceBox) -> Result<Embedding> {
        let face_img = crop_face(image, face);
        let resized = face_img.resize_exact(self.input_size, self.input_size, FilterType::Triangle);

        let input_array = self.preprocess_face(&resized);
        let cow_array = CowArray::from(input_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;

        let outputs = self.session.run(vec![input_tensor])?;
        let first = outputs
            .first()
            .ok_or_else(|| FaceIdError::Model("Recognizer produced no output".into()))?;
        let embedding = first.try_extract::<f32>()?.view().to_owned().into_raw_vec();

        Ok(l2_normalize(embedding))
    }

    fn preprocess_face(&self, img: &DynamicImage) -> Array4<f32> {
        let rgb = img.to_rgb8();
        let size = self.input_size as usize;
        let norm = self.normalization_value;
        let mut array = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                array[[0, c, y, x]] = (pixel[c] as f32 - norm) / norm;
            }
        }

        array
    }
}

fn crop_face(image: &DynamicImage, face: &FaceBox) -> DynamicImage {
    let x = face.x1.max(0.0) as u32;
    let y = face.y1.max(0.0) as u32;
    let width = face.width().max(1.0) as u32;
    let height = face.height().max(1.0) as u32;

    image.crop_imm(x, y, width, height)
}

pub fn l2_normalize(mut embedding: Embedding) -> Embedding {
    let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut embedding {
            *value /= norm;
        }
    }
    embedding
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalised_embedding_has_unit_length() {
        let e = l2_normalize(vec![3.0, 4.0]);
        assert!((e[0] - 0.6).abs() < 1e-6);
        assert!((e[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_left_alone() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn distance_between_identical_vectors_is_zero() {
        let v = [0.1, -0.4, 0.9];
        assert_eq!(euclidean_distance(&v, &v), 0.0);
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }
}
