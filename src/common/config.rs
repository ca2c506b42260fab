use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::common::error::{FaceIdError, Result};

pub const ENV_API_KEY: &str = "FACEID_API_KEY";
pub const ENV_DATABASE: &str = "FACEID_DATABASE";
pub const ENV_BIND: &str = "FACEID_BIND";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret expected in the `X-API-Key` header on write endpoints.
    #[serde(default)]
    pub api_key: String,
}

fn default_bind() -> String { "0.0.0.0:8000".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind(), api_key: String::new() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Unset means the platform data directory (or ./dev_data in dev mode).
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 { 10 }
fn default_acquire_timeout() -> u64 { 5 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    #[serde(default = "default_recognizer_path")]
    pub recognizer_path: PathBuf,
}

fn default_detector_path() -> PathBuf { PathBuf::from("models/face_detector.onnx") }
fn default_recognizer_path() -> PathBuf { PathBuf::from("models/face_embedder.onnx") }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            recognizer_path: default_recognizer_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    #[serde(default = "default_detection_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }
fn default_nms_iou() -> f32 { 0.45 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            confidence_threshold: default_detection_confidence(),
            nms_iou: default_nms_iou(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_recognizer_input")]
    pub input_size: u32,
    #[serde(default = "default_normalization")]
    pub normalization_value: f32,
}

fn default_recognizer_input() -> u32 { 112 }
fn default_normalization() -> f32 { 127.5 }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: default_recognizer_input(),
            normalization_value: default_normalization(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_min_samples() -> usize { 5 }

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self { min_samples: default_min_samples() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,
}

fn default_distance_threshold() -> f32 { crate::core::matcher::DEFAULT_DISTANCE_THRESHOLD }

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { distance_threshold: default_distance_threshold() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SweepConfig {
    /// Seconds between background sweeps while serving; 0 disables the timer.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_sweep_interval() -> u64 { 300 }

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: default_sweep_interval() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PerformanceConfig {
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_optimization_level() -> u32 { 3 }

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self { optimization_level: default_optimization_level() }
    }
}

impl Config {
    /// Load from `path` if it exists, otherwise start from defaults, then apply
    /// environment overrides and validate.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            tracing::info!("Loading config from: {}", path.display());
            let contents = std::fs::read_to_string(path)?;
            Self::from_toml(&contents)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Config::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| FaceIdError::Config(format!("Config parse error: {}", e)))
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            self.server.api_key = key;
        }
        if let Ok(path) = std::env::var(ENV_DATABASE) {
            self.database.path = Some(PathBuf::from(path));
        }
        if let Ok(bind) = std::env::var(ENV_BIND) {
            self.server.bind = bind;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.api_key.trim().is_empty() {
            return Err(FaceIdError::Config(format!(
                "server.api_key must be set (or export {})", ENV_API_KEY
            )));
        }

        if self.database.max_connections == 0 || self.database.max_connections > 64 {
            return Err(FaceIdError::Config(format!(
                "Database max_connections must be between 1 and 64, got {}",
                self.database.max_connections
            )));
        }

        if self.enrollment.min_samples == 0 {
            return Err(FaceIdError::Config(
                "Enrollment min_samples must be at least 1".into(),
            ));
        }

        if !(self.matching.distance_threshold > 0.0 && self.matching.distance_threshold <= 2.0) {
            return Err(FaceIdError::Config(format!(
                "Matching distance threshold must be in (0.0, 2.0], got {}",
                self.matching.distance_threshold
            )));
        }

        if self.detector.confidence_threshold < 0.0 || self.detector.confidence_threshold > 1.0 {
            return Err(FaceIdError::Config(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.confidence_threshold
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_width > 4096 {
            return Err(FaceIdError::Config(format!(
                "Detector input width must be between 1 and 4096, got {}",
                self.detector.input_width
            )));
        }
        if self.detector.input_height == 0 || self.detector.input_height > 4096 {
            return Err(FaceIdError::Config(format!(
                "Detector input height must be between 1 and 4096, got {}",
                self.detector.input_height
            )));
        }

        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(FaceIdError::Config(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_takes_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.enrollment.min_samples, 5);
        assert_eq!(config.matching.distance_threshold, 0.6);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.server.bind, "0.0.0.0:8000");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::from_toml(
            r#"
            [server]
            api_key = "s3cret"

            [sweep]
            interval_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.server.api_key, "s3cret");
        assert_eq!(config.server.bind, "0.0.0.0:8000");
        assert_eq!(config.sweep.interval_secs, 0);
        config.validate().unwrap();
    }

    #[test]
    fn missing_api_key_fails_validation() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(FaceIdError::Config(_))));
    }

    #[test]
    fn threshold_out_of_range_fails_validation() {
        let mut config = Config::default();
        config.server.api_key = "k".into();
        config.matching.distance_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            Config::from_toml("[server\nbind = 1"),
            Err(FaceIdError::Config(_))
        ));
    }
}
