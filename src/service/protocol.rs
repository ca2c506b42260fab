use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::common::{FaceIdError, Result};

/// Header carrying the shared secret on write endpoints.
pub const API_KEY_HEADER: &str = "x-api-key";

// Enrollment channel, client -> server
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Start {
        #[serde(default)]
        name: String,
    },
    Image {
        #[serde(default, alias = "image")]
        data: String,
    },
    Finish,
    Stop,
}

// Enrollment channel, server -> client
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Info { message: String, session_id: String },
    Progress { count: usize },
    Error { message: String },
    Done { message: String, count: usize },
    Stopped { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    pub fn stopped(message: impl Into<String>) -> Self {
        ServerMessage::Stopped { message: message.into() }
    }
}

/// Decodes a base64 image payload, tolerating a `data:...;base64,` prefix.
pub fn decode_image_payload(data: &str) -> Result<Vec<u8>> {
    let data = data.trim();
    if data.is_empty() {
        return Err(FaceIdError::Validation("No image data received.".into()));
    }
    let encoded = match data.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    STANDARD
        .decode(encoded)
        .map_err(|e| FaceIdError::Transport(format!("Invalid base64 image data: {}", e)))
}

// HTTP bodies
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MatchBody {
    pub id: String,
    pub name: String,
    pub confidence: f32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RecognizeResponse {
    pub matches: Vec<MatchBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RegisterResponse {
    pub message: String,
    pub registration_id: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FaceRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DetectResponse {
    pub success: bool,
    pub faces: Vec<FaceRect>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigResponse {
    pub required_image_count: usize,
}
