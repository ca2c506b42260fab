use crate::common::{Config, FaceIdError, Result};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::sync::Arc;
use image::{DynamicImage, imageops::FilterType};
use ndarray::{Array4, CowArray};

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

pub struct FaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    input_width: u32,
    input_height: u32,
    confidence_threshold: f32,
    nms_iou: f32,
}

pub(crate) fn optimization_level(level: u32) -> GraphOptimizationLevel {
    match level {
        0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

impl FaceDetector {
    pub fn new(config: &Config) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .build()
                .map_err(|e| FaceIdError::Model(format!("Failed to create environment: {}", e)))?
        );

        let model_path = &config.models.detector_path;
        if !model_path.exists() {
            return Err(FaceIdError::Model(
                format!("Detector model not found at: {:?}", model_path)
            ));
        }

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(optimization_level(config.performance.optimization_level))?
            .with_model_from_file(model_path)?;

        Ok(Self {
            session,
            _environment: environment,
            input_width: config.detector.input_width,
            input_height: config.detector.input_height,
            confidence_threshold: config.detector.confidence_threshold,
            nms_iou: config.detector.nms_iou,
        })
    }

    /// Face boxes in original image coordinates, highest confidence first.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let img_array = if image.width() == self.input_width && image.height() == self.input_height {
            self.image_to_array(image)
        } else {
            let resized = image.resize_exact(
                self.input_width,
                self.input_height,
                FilterType::Nearest,
            );
            self.image_to_array(&resized)
        };

        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut faces = self.parse_detections(&outputs)?;

        let scale_x = orig_width / self.input_width as f32;
        let scale_y = orig_height / self.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }

    fn image_to_array(&self, img: &DynamicImage) -> Array4<f32> {
        let rgb = img.to_rgb8();
        let width = rgb.width() as usize;
        let height = rgb.height() as usize;
        let mut array = Array4::<f32>::zeros((1, 3, height, width));

        let norm_factor = 1.0 / 255.0;
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 * norm_factor;
            array[[0, 1, y, x]] = pixel[1] as f32 * norm_factor;
            array[[0, 2, y, x]] = pixel[2] as f32 * norm_factor;
        }

        array
    }

    fn parse_detections(&self, outputs: &[Value]) -> Result<Vec<FaceBox>> {
        let Some(first) = outputs.first() else {
            return Ok(Vec::new());
        };

        let output = first.try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let values = output
            .as_slice()
            .ok_or_else(|| FaceIdError::Model("Detector output is not contiguous".into()))?;

        // YOLO-style output: [1, N, 5+] or transposed [1, 5+, N]
        let (num_predictions, prediction_length, is_transposed) = if shape.len() >= 3 {
            if shape[2] > shape[1] && shape[1] <= 10 {
                (shape[2], shape[1], true)
            } else {
                (shape[1], shape[2], false)
            }
        } else if shape.len() == 2 {
            (shape[0], shape[1], false)
        } else {
            tracing::warn!("Unexpected detector output shape: {:?}", shape);
            return Ok(Vec::new());
        };

        let mut faces = Vec::new();
        for i in 0..num_predictions {
            let at = |field: usize| -> f32 {
                if field >= prediction_length {
                    return 0.0;
                }
                if is_transposed {
                    values[field * num_predictions + i]
                } else {
                    values[i * prediction_length + field]
                }
            };
            let (cx, cy, w, h, confidence) = (at(0), at(1), at(2), at(3), at(4));

            if confidence <= 0.001 {
                continue;
            }

            // Normalised coordinates are scaled up to the model's input space.
            let scale = if cx > 1.0 || cy > 1.0 || w > 1.0 || h > 1.0 {
                1.0
            } else {
                self.input_width as f32
            };
            let (cx, cy, w, h) = (cx * scale, cy * scale, w * scale, h * scale);

            let x1 = (cx - w / 2.0).max(0.0);
            let y1 = (cy - h / 2.0).max(0.0);
            let x2 = (cx + w / 2.0).min(self.input_width as f32);
            let y2 = (cy + h / 2.0).min(self.input_height as f32);

            if x2 - x1 > 10.0 && y2 - y1 > 10.0 {
                faces.push(FaceBox { x1, y1, x2, y2, confidence });
            }
        }

        let mut faces = apply_nms(faces, self.nms_iou);
        faces.retain(|face| face.confidence >= self.confidence_threshold);
        Ok(faces)
    }
}

/// Greedy non-maximum suppression; output is sorted by descending confidence.
pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| calculate_iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

pub fn calculate_iou(box1: &FaceBox, box2: &FaceBox) -> f32 {
    let x1 = box1.x1.max(box2.x1);
    let y1 = box1.y1.max(box2.y1);
    let x2 = box1.x2.min(box2.x2);
    let y2 = box1.y2.min(box2.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = box1.width() * box1.height() + box2.width() * box2.height() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
