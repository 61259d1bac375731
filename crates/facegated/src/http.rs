//! JSON-over-HTTP transport.
//!
//! Handlers only translate between request/response structs and the engine;
//! all matching happens on the engine thread. `/health` and `GET /faces`
//! read the reference store directly so they never wait behind an
//! extraction.
//!
//! Failures carry `{success: false, error}` with a non-2xx status:
//!
//! | status | cause |
//! |---|---|
//! | 400 | malformed body, missing field, invalid image or resident id |
//! | 404 | verify against a resident with no reference |
//! | 413 | body larger than `FACEGATE_MAX_BODY_BYTES` |
//! | 422 | no face detected |
//! | 500 | store or extraction backend failure |
//! | 503 | engine thread gone |
//! | 504 | engine did not answer within `FACEGATE_REQUEST_TIMEOUT_SECS` |
//!
//! Clients that only read `error` when the status is 2xx will lose the
//! message; read the body on every status.

use crate::engine::{EngineError, EngineHandle};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use facegate_core::{DistanceMetric, FaceError, FaceService, ReferenceStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Active decision configuration, reported by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInfo {
    pub name: &'static str,
    pub metric: DistanceMetric,
    pub threshold: f32,
    pub extractor: String,
}

impl PolicyInfo {
    pub fn from_service(service: &FaceService) -> Self {
        let matcher = service.matcher();
        Self {
            name: matcher.policy().name(),
            metric: matcher.metric(),
            threshold: matcher.policy().threshold(),
            extractor: service.descriptor().to_string(),
        }
    }
}

/// State shared across handlers.
pub struct AppState {
    pub engine: EngineHandle,
    /// Read-only view of the engine's store. Commits are atomic renames, so
    /// reading here never observes a partial reference.
    pub store: ReferenceStore,
    pub policy: PolicyInfo,
    pub version: String,
}

impl AppState {
    pub fn new(engine: EngineHandle, store: ReferenceStore, policy: PolicyInfo) -> Self {
        Self {
            engine,
            store,
            policy,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub resident_id: Option<String>,
    pub face_image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RecognizeRequest {
    pub face_image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecognizeResponse {
    pub success: bool,
    pub recognized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resident_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub resident_id: Option<String>,
    pub face_image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub verified: bool,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    pub threshold: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FacesResponse {
    pub success: bool,
    pub residents: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    pub success: bool,
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: String,
    pub version: String,
    pub references: Option<usize>,
    pub policy: PolicyInfo,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

/// A failed request: status code plus `{success: false, error}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!(error = %message, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = status_for(&e);
        if status.is_server_error() {
            tracing::warn!(error = %e, status = status.as_u16(), "request failed");
        } else {
            tracing::info!(error = %e, status = status.as_u16(), "request rejected");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        // Oversized bodies keep their 413; every other malformed body is a 400.
        let status = match rejection.status() {
            StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Face(face) => match face {
            FaceError::InvalidImage(_) | FaceError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            FaceError::IdentityNotFound(_) => StatusCode::NOT_FOUND,
            FaceError::NoFaceDetected => StatusCode::UNPROCESSABLE_ENTITY,
            FaceError::StoreWrite(_)
            | FaceError::StoreRead(_)
            | FaceError::ExtractionBackend(_)
            | FaceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Build the application router.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/register_face", post(register_face))
        .route("/recognize_face", post(recognize_face))
        .route("/verify_face", post(verify_face))
        .route("/faces", get(list_faces))
        .route("/faces/:resident_id", delete(remove_face))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// `Some(s)` unless missing or empty.
fn present(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

async fn register_face(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let Json(req) = payload?;
    let (Some(resident_id), Some(face_image)) = (present(req.resident_id), present(req.face_image))
    else {
        return Err(ApiError::bad_request("Missing resident_id or face_image"));
    };

    let enrollment = state.engine.enroll(resident_id, face_image).await?;
    Ok(Json(RegisterResponse {
        success: true,
        message: format!("Face registered for resident {}", enrollment.key),
    }))
}

async fn recognize_face(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RecognizeRequest>, JsonRejection>,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let Json(req) = payload?;
    let face_image = present(req.face_image).ok_or_else(|| ApiError::bad_request("Missing face_image"))?;

    let decision = state.engine.identify(face_image).await?;
    let response = if decision.accepted {
        RecognizeResponse {
            success: true,
            recognized: true,
            resident_id: decision.candidate,
            confidence: Some(decision.confidence),
            distance: decision.distance,
            message: None,
        }
    } else if decision.distance.is_some() {
        RecognizeResponse {
            success: true,
            recognized: false,
            resident_id: None,
            confidence: Some(decision.confidence),
            distance: decision.distance,
            message: Some("Face not recognized with sufficient confidence".into()),
        }
    } else {
        RecognizeResponse {
            success: true,
            recognized: false,
            resident_id: None,
            confidence: None,
            distance: None,
            message: Some("No matching face found in database".into()),
        }
    };
    Ok(Json(response))
}

async fn verify_face(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let (Some(resident_id), Some(face_image)) = (present(req.resident_id), present(req.face_image))
    else {
        return Err(ApiError::bad_request("Missing resident_id or face_image"));
    };

    let threshold = state.policy.threshold;
    match state.engine.verify(resident_id, face_image).await {
        Ok(decision) => Ok(Json(VerifyResponse {
            success: true,
            verified: decision.accepted,
            confidence: decision.confidence,
            distance: decision.distance,
            threshold,
            error: None,
        })
        .into_response()),
        Err(e @ EngineError::Face(FaceError::IdentityNotFound(_))) => {
            tracing::info!(error = %e, "verify against unknown resident");
            let body = VerifyResponse {
                success: false,
                verified: false,
                confidence: 0.0,
                distance: None,
                threshold,
                error: Some(e.to_string()),
            };
            Ok((StatusCode::NOT_FOUND, Json(body)).into_response())
        }
        Err(e) => Err(e.into()),
    }
}

/// Run a blocking store read off the async workers.
async fn read_store<T, F>(store: &ReferenceStore, read: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&ReferenceStore) -> Result<T, FaceError> + Send + 'static,
{
    let store = store.clone();
    match tokio::task::spawn_blocking(move || read(&store)).await {
        Ok(result) => result.map_err(|e| ApiError::from(EngineError::Face(e))),
        Err(e) => Err(ApiError::internal(format!("store read task failed: {e}"))),
    }
}

async fn list_faces(State(state): State<Arc<AppState>>) -> Result<Json<FacesResponse>, ApiError> {
    let residents = read_store(&state.store, |store| {
        Ok(store.list()?.into_iter().map(|(key, _)| key).collect::<Vec<_>>())
    })
    .await?;
    Ok(Json(FacesResponse {
        success: true,
        count: residents.len(),
        residents,
    }))
}

async fn remove_face(
    State(state): State<Arc<AppState>>,
    Path(resident_id): Path<String>,
) -> Result<Json<RemoveResponse>, ApiError> {
    let removed = state.engine.remove(resident_id).await?;
    Ok(Json(RemoveResponse {
        success: true,
        removed,
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (status, references) = match read_store(&state.store, ReferenceStore::len).await {
        Ok(n) => ("healthy", Some(n)),
        Err(e) => {
            tracing::warn!(error = %e.message, "health: reference count unavailable");
            ("degraded", None)
        }
    };

    Json(HealthResponse {
        status,
        message: "facegate server is running".to_string(),
        version: state.version.clone(),
        references,
        policy: state.policy.clone(),
    })
}
