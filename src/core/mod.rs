pub mod detector;
pub mod matcher;
pub mod provider;
pub mod recognizer;

pub use detector::{FaceBox, FaceDetector};
pub use matcher::{match_probe, Match, MatchOutcome};
pub use provider::{EmbeddingProvider, FaceLocator, OnnxEmbeddingProvider, single_face};
pub use recognizer::{euclidean_distance, Embedding, FaceRecognizer};
