//! HTTP surface: the enrollment WebSocket, single-shot registration,
//! recognition, and a few unauthenticated helpers for the web client.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Query, Request, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::common::{Config, FaceIdError, Result};
use crate::core::matcher::{match_probe, MatchOutcome};
use crate::core::provider::{
    extract_off_thread, locate_off_thread, single_face, EmbeddingProvider, FaceLocator,
};
use crate::service::enrollment::EnrollmentContext;
use crate::service::protocol::{
    ClientConfigResponse, DetectResponse, ErrorBody, FaceRect, HealthResponse, MatchBody,
    RecognizeResponse, RegisterResponse, API_KEY_HEADER,
};
use crate::service::ws::{run_enrollment_socket, MAX_FRAME_BYTES};
use crate::storage::Store;

/// Upper bound on a multipart upload.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Compares presented API keys against the configured one in constant time.
///
/// Both sides are run through HMAC-SHA256 under a key drawn at startup, so
/// the comparison never depends on the length or prefix of the secret.
pub struct ApiKeyGuard {
    mac: HmacSha256,
    expected: Vec<u8>,
}

impl ApiKeyGuard {
    pub fn new(secret: &str) -> Result<Self> {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);

        let mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| FaceIdError::Config(format!("Invalid guard key: {}", e)))?;
        let mut tagger = mac.clone();
        tagger.update(secret.as_bytes());
        let expected = tagger.finalize().into_bytes().to_vec();

        Ok(Self { mac, expected })
    }

    pub fn verify(&self, presented: &str) -> bool {
        let mut mac = self.mac.clone();
        mac.update(presented.as_bytes());
        mac.verify_slice(&self.expected).is_ok()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub locator: Arc<dyn FaceLocator>,
    pub guard: Arc<ApiKeyGuard>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Store,
        provider: Arc<dyn EmbeddingProvider>,
        locator: Arc<dyn FaceLocator>,
    ) -> Result<Self> {
        let guard = ApiKeyGuard::new(&config.server.api_key)?;
        Ok(Self {
            config: Arc::new(config),
            store,
            provider,
            locator,
            guard: Arc::new(guard),
        })
    }

    pub fn enrollment_context(&self) -> EnrollmentContext {
        EnrollmentContext {
            provider: self.provider.clone(),
            identity: self.store.identity(),
            ledger: self.store.ledger(),
            min_samples: self.config.enrollment.min_samples,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/ws/register", get(enrollment_socket))
        .route("/api/v1/register", post(register))
        .route("/api/v1/recognize", post(recognize))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .merge(guarded)
        .route("/detect", post(detect))
        .route("/health", get(health))
        .route("/config", get(client_config))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

impl FaceIdError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoFaceDetected | Self::MultipleFacesDetected(_) | Self::Image(_) => StatusCode::OK,
            Self::Validation(_) | Self::Transport(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyCancelled => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Storage(_)
            | Self::Database(_)
            | Self::Model(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Ort(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FaceIdError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::NoFaceDetected => "No face detected in the image.".to_string(),
            Self::MultipleFacesDetected(_) => {
                "Multiple faces detected. Please upload an image with a single face.".to_string()
            }
            Self::Image(_) => "Could not decode image.".to_string(),
            _ if status == StatusCode::INTERNAL_SERVER_ERROR => {
                error!(error = %self, "request failed");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Deserialize, Default)]
struct KeyQuery {
    api_key: Option<String>,
}

// Browsers cannot set headers on a WebSocket handshake, so the key may also
// arrive as `?api_key=`.
async fn require_api_key(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or(query.api_key);

    match presented {
        Some(key) if state.guard.verify(&key) => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "rejected request with missing or invalid API key");
            FaceIdError::Unauthorized.into_response()
        }
    }
}

async fn enrollment_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let ctx = state.enrollment_context();
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| run_enrollment_socket(socket, ctx))
}

#[derive(Default)]
struct Upload {
    name: Option<String>,
    file: Option<Vec<u8>>,
}

impl Upload {
    async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut upload = Upload::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| FaceIdError::Transport(format!("Invalid multipart body: {}", e)))?
        {
            let name = field.name().map(str::to_string);
            match name.as_deref() {
                Some("name") => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| FaceIdError::Transport(format!("Invalid name field: {}", e)))?;
                    upload.name = Some(text);
                }
                Some("file") => {
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| FaceIdError::Transport(format!("Invalid file field: {}", e)))?;
                    upload.file = Some(bytes.to_vec());
                }
                _ => {}
            }
        }
        Ok(upload)
    }

    fn image(&mut self) -> Result<Vec<u8>> {
        match self.file.take() {
            Some(bytes) if !bytes.is_empty() => Ok(bytes),
            _ => Err(FaceIdError::Validation("No image data received.".into())),
        }
    }
}

async fn register(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<RegisterResponse>> {
    let mut upload = Upload::read(multipart).await?;
    let name = upload
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| FaceIdError::Validation("A name is required.".into()))?;
    let image = upload.image()?;

    let embedding = single_face(extract_off_thread(state.provider.clone(), image).await?)?;

    let registration_id = Uuid::new_v4().to_string();
    let enrolled = state
        .store
        .identity()
        .enroll(&name, &registration_id, std::slice::from_ref(&embedding))
        .await?;

    info!(
        person_id = %enrolled.person_id,
        session_id = %registration_id,
        "single-shot registration complete"
    );
    Ok(Json(RegisterResponse {
        message: format!("Registered {} successfully.", name),
        registration_id,
    }))
}

async fn recognize(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<RecognizeResponse>> {
    let image = Upload::read(multipart).await?.image()?;
    let probe = single_face(extract_off_thread(state.provider.clone(), image).await?)?;

    let catalog = state.store.identity().list_all_embeddings().await?;
    let outcome = match_probe(&probe, &catalog, state.config.matching.distance_threshold);

    let response = match outcome {
        MatchOutcome::Matched(found) => {
            info!(person_id = %found.person_id, distance = found.distance, "probe matched");
            RecognizeResponse {
                matches: vec![MatchBody {
                    id: found.person_id,
                    name: found.name,
                    confidence: found.confidence,
                }],
                message: None,
            }
        }
        MatchOutcome::NoMatch => RecognizeResponse {
            matches: vec![],
            message: Some("No match found.".into()),
        },
    };
    Ok(Json(response))
}

async fn detect(State(state): State<AppState>, multipart: Multipart) -> Result<Json<DetectResponse>> {
    let image = Upload::read(multipart).await?.image()?;
    let faces = locate_off_thread(state.locator.clone(), image).await?;

    Ok(Json(DetectResponse {
        success: true,
        faces: faces
            .iter()
            .map(|face| FaceRect {
                x: face.x1.round() as i32,
                y: face.y1.round() as i32,
                width: face.width().round() as i32,
                height: face.height().round() as i32,
            })
            .collect(),
    }))
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    state.store.health_check().await?;
    Ok(Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn client_config(State(state): State<AppState>) -> Json<ClientConfigResponse> {
    Json(ClientConfigResponse {
        required_image_count: state.config.enrollment.min_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detector::FaceBox;
    use crate::service::enrollment::test_support::ScriptedProvider;
    use crate::storage::test_support::temp_store;
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    const KEY: &str = "test-secret";
    const BOUNDARY: &str = "faceid-test-boundary";

    impl FaceLocator for ScriptedProvider {
        fn locate(&self, image: &[u8]) -> Result<Vec<FaceBox>> {
            Ok(self
                .extract(image)?
                .iter()
                .enumerate()
                .map(|(i, _)| FaceBox {
                    x1: 10.0 + i as f32 * 100.0,
                    y1: 20.0,
                    x2: 60.4 + i as f32 * 100.0,
                    y2: 90.0,
                    confidence: 0.9,
                })
                .collect())
        }
    }

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let (store, dir) = temp_store().await;
        let mut config = Config::default();
        config.server.api_key = KEY.into();
        let provider = Arc::new(ScriptedProvider);
        let state = AppState::new(config, store, provider.clone(), provider).unwrap();
        (state, dir)
    }

    fn multipart(fields: &[(&str, &[u8])]) -> Body {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            if *name == "file" {
                body.extend_from_slice(
                    b"Content-Disposition: form-data; name=\"file\"; filename=\"face.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
                );
            } else {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
            }
            body.extend_from_slice(value);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        Body::from(body)
    }

    fn upload(uri: &str, key: Option<&str>, fields: &[(&str, &[u8])]) -> Request {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY));
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(multipart(fields)).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn guard_accepts_only_the_configured_key() {
        let guard = ApiKeyGuard::new("s3cret").unwrap();
        assert!(guard.verify("s3cret"));
        assert!(!guard.verify("s3cre"));
        assert!(!guard.verify("s3cret "));
        assert!(!guard.verify(""));
    }

    #[tokio::test]
    async fn guarded_routes_reject_missing_or_wrong_keys() {
        let (state, _dir) = test_state().await;
        let app = router(state);

        for key in [None, Some("wrong")] {
            let response = app
                .clone()
                .oneshot(upload("/api/v1/recognize", key, &[("file", b"a")]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(json_body(response).await["error"], "Invalid API Key");
        }
    }

    #[tokio::test]
    async fn health_and_config_are_public() {
        let (state, _dir) = test_state().await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");

        let response = app
            .oneshot(HttpRequest::builder().uri("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body, serde_json::json!({"requiredImageCount": 5}));
    }

    #[tokio::test]
    async fn register_then_recognize_the_same_face() {
        let (state, _dir) = test_state().await;
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(upload("/api/v1/register", Some(KEY), &[("name", b"alice"), ("file", b"a")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "Registered alice successfully.");
        let registration_id = body["registration_id"].as_str().unwrap().to_string();
        assert_eq!(
            state.store.identity().embedding_count_for_session(&registration_id).await.unwrap(),
            1
        );

        let response = app
            .oneshot(upload("/api/v1/recognize", Some(KEY), &[("file", b"a")]))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["matches"][0]["name"], "alice");
        assert_eq!(body["matches"][0]["confidence"], 1.0);
    }

    #[tokio::test]
    async fn recognize_reports_no_match_and_detection_errors() {
        let (state, _dir) = test_state().await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(upload("/api/v1/recognize", Some(KEY), &[("file", b"a")]))
            .await
            .unwrap();
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"matches": [], "message": "No match found."})
        );

        let response = app
            .clone()
            .oneshot(upload("/api/v1/recognize", Some(KEY), &[("file", b"none")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["error"], "No face detected in the image.");

        let response = app
            .oneshot(upload("/api/v1/recognize", Some(KEY), &[("file", b"two")]))
            .await
            .unwrap();
        assert_eq!(
            json_body(response).await["error"],
            "Multiple faces detected. Please upload an image with a single face."
        );
    }

    #[tokio::test]
    async fn register_without_name_is_a_bad_request() {
        let (state, _dir) = test_state().await;
        let response = router(state)
            .oneshot(upload("/api/v1/register", Some(KEY), &[("file", b"a")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "A name is required.");
    }

    #[tokio::test]
    async fn detect_returns_rounded_boxes() {
        let (state, _dir) = test_state().await;
        let response = router(state)
            .oneshot(upload("/detect", None, &[("file", b"two")]))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(
            body["faces"][0],
            serde_json::json!({"x": 10, "y": 20, "width": 50, "height": 70})
        );
        assert_eq!(body["faces"].as_array().unwrap().len(), 2);
    }
}
