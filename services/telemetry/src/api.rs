use crate::auth::Principal;
use crate::blob_store::BlobStore;
use crate::classifier::Classification;
use crate::config::ApiConfig;
use crate::database::Database;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::frame_store::{Frame, FrameQuery, SqliteFrameStore, StoreError};
use crate::ingest::{IngestError, IngestionEvent, IngestionService};
use crate::sensor_store::{SensorQuery, SensorReading, SensorStore, SensorSummary};
use crate::timelapse::{parse_start_instant, TimelapseError, TimelapseReconstructor};
use crate::user_store::{Role, User, UserStore, UserUpdate};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// URL prefix static image files are served under
pub const UPLOADS_PREFIX: &str = "uploads";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub users: UserStore,
    pub frames: SqliteFrameStore,
    pub sensors: SensorStore,
    pub blobs: Arc<dyn BlobStore>,
    pub ingestion: Arc<IngestionService>,
    pub timelapse: Arc<TimelapseReconstructor>,
    pub timelapse_timeout: Duration,
    pub uploads_root: PathBuf,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Errors returned by handlers
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    Unavailable(String),
    Timeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", m),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, "FORBIDDEN", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "NOT_FOUND", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "CONFLICT", m),
            ApiError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", m),
            ApiError::Timeout(m) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", m),
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound("Not found".to_string()),
            StoreError::Conflict(m) => ApiError::Conflict(format!("Conflicting record: {}", m)),
            StoreError::Unavailable(e) => {
                error!(error = %e, "Store query failed");
                ApiError::Unavailable("Storage is unavailable".to_string())
            }
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::StoreUnavailable(e) => e.into(),
            IngestError::BlobWrite(e) => {
                error!(error = %e, "Image write failed");
                ApiError::Internal("Failed to store image".to_string())
            }
            e @ IngestError::ConcurrencyViolation { .. } => ApiError::Conflict(e.to_string()),
        }
    }
}

impl From<TimelapseError> for ApiError {
    fn from(e: TimelapseError) -> Self {
        match e {
            TimelapseError::InvalidArgument(m) => ApiError::BadRequest(m),
            TimelapseError::StoreUnavailable(e) => e.into(),
            TimelapseError::Cancelled => {
                ApiError::Timeout("Timelapse reconstruction timed out".to_string())
            }
            e @ TimelapseError::ScanStalled(_) => {
                error!(error = %e, "Timelapse scan aborted");
                ApiError::Internal("Timelapse reconstruction failed".to_string())
            }
        }
    }
}

/// Generic acknowledgement
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn message(text: &str) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: text.to_string(),
    })
}

/// Public path of a stored image
pub fn image_path(storage_path: &str) -> String {
    format!("{}/{}", UPLOADS_PREFIX, storage_path)
}

fn parse_time_filter(name: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match value {
        None | Some("") => Ok(None),
        Some(v) => parse_start_instant(v)
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("Invalid {}: {}", name, v))),
    }
}

fn is_ascending(sort: Option<&str>) -> bool {
    !matches!(sort, Some(s) if s.eq_ignore_ascii_case("desc"))
}

/// Decode a base64 payload, tolerating a `data:` URL prefix
pub fn decode_image(payload: &str) -> Result<Vec<u8>, ApiError> {
    let encoded = match payload.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };
    let cleaned: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    STANDARD
        .decode(cleaned)
        .map_err(|e| ApiError::BadRequest(format!("Image is not valid base64: {}", e)))
}

// ---------------------------------------------------------------------------
// Request/response types

/// Camera upload body
#[derive(Debug, Deserialize)]
pub struct UploadPictureRequest {
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadPictureResponse {
    pub message: String,
    pub persisted: bool,
    pub frame_id: Option<i64>,
    pub classification: Classification,
    pub brightness: Option<f64>,
}

/// Paging and time-window parameters shared by the list endpoints
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_page")]
    pub page: i64,
    pub timestamp_after: Option<String>,
    pub timestamp_before: Option<String>,
    /// "asc" or "desc"
    pub sort: Option<String>,
    pub classification: Option<Classification>,
}

fn default_limit() -> i64 {
    10
}

fn default_page() -> i64 {
    1
}

impl ListQuery {
    fn paging(&self) -> Result<(i64, i64), ApiError> {
        if self.limit < 1 || self.limit > 1000 {
            return Err(ApiError::BadRequest("limit must be between 1 and 1000".to_string()));
        }
        if self.page < 1 {
            return Err(ApiError::BadRequest("page must be at least 1".to_string()));
        }
        let offset = (self.page - 1)
            .checked_mul(self.limit)
            .ok_or_else(|| ApiError::BadRequest("page is out of range".to_string()))?;
        Ok((self.limit, offset))
    }
}

/// Frame in API responses
#[derive(Debug, Serialize)]
pub struct PictureResponse {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub image_path: String,
    pub classification: Classification,
}

impl From<Frame> for PictureResponse {
    fn from(f: Frame) -> Self {
        Self {
            id: f.id,
            timestamp: f.captured_at,
            image_path: image_path(&f.storage_path),
            classification: f.classification,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PictureListResponse {
    pub pictures: Vec<PictureResponse>,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct TimelapseQuery {
    /// Defaults to the caller's germination date
    pub start_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TimelapsePicture {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub image_path: String,
    pub day: i64,
}

#[derive(Debug, Serialize)]
pub struct TimelapseResponse {
    pub start_date: DateTime<Utc>,
    pub pictures: Vec<TimelapsePicture>,
}

/// Sensor node upload body
#[derive(Debug, Deserialize)]
pub struct SensorUploadRequest {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_humidity: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct SensorListResponse {
    pub sensor_data: Vec<SensorReading>,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    pub leaf_temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreferencesBody {
    pub germination_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PreferencesResponse {
    pub username: String,
    pub germination_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    #[serde(default = "default_role")]
    pub role: Role,
    pub api_key: Option<String>,
}

fn default_role() -> Role {
    Role::User
}

/// Account as seen by administrators
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub api_key: String,
    pub germination_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            role: u.role,
            api_key: u.api_key,
            germination_date: u.germination_date,
            created_at: u.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Router

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let uploads = ServeDir::new(&state.uploads_root);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/upload_picture", post(upload_picture))
        .route("/live", get(live_snapshot))
        .route("/pictures", get(list_pictures))
        .route("/pictures/:id", delete(delete_picture))
        .route("/timelapse", get(timelapse))
        .route("/upload_sensor_data", post(upload_sensor_data))
        .route("/sensor_data", get(list_sensor_data))
        .route("/sensor_data/summary", get(sensor_summary))
        .route("/sensor_data/:id", delete(delete_sensor_data))
        .route("/user/preferences", get(get_preferences).post(set_preferences))
        .route("/admin/users", get(list_users).post(create_user))
        .route("/admin/users/:id", put(update_user).delete(delete_user))
        .nest_service(&format!("/{}", UPLOADS_PREFIX), uploads)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "telemetry-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(state.database.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

// ---------------------------------------------------------------------------
// Frames

/// Receive a camera frame
#[instrument(skip(state, principal, request), fields(user_id = principal.stream_id()))]
async fn upload_picture(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(request): ApiJson<UploadPictureRequest>,
) -> Result<Json<UploadPictureResponse>, ApiError> {
    let payload = request
        .image
        .filter(|i| !i.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing image".to_string()))?;
    let image = decode_image(&payload)?;

    let outcome = state
        .ingestion
        .ingest(IngestionEvent {
            stream_id: principal.stream_id(),
            image: Bytes::from(image),
            received_at: Utc::now(),
        })
        .await?;

    let persisted = outcome.persisted();
    Ok(Json(UploadPictureResponse {
        message: if persisted {
            "Picture uploaded successfully".to_string()
        } else {
            "Live picture updated".to_string()
        },
        persisted,
        frame_id: outcome.frame_id,
        classification: outcome.classification,
        brightness: outcome.brightness,
    }))
}

/// Latest received image, persisted or not
async fn live_snapshot(State(state): State<AppState>, principal: Principal) -> Result<Response, ApiError> {
    let snapshot = state
        .ingestion
        .snapshots()
        .latest(principal.stream_id())
        .ok_or_else(|| ApiError::NotFound("No picture received yet".to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, snapshot.content_type.to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
            (header::LAST_MODIFIED, snapshot.received_at.to_rfc2822()),
        ],
        snapshot.data,
    )
        .into_response())
}

/// List persisted frames
#[instrument(skip(state, principal), fields(user_id = principal.stream_id()))]
async fn list_pictures(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(params): ApiQuery<ListQuery>,
) -> Result<Json<PictureListResponse>, ApiError> {
    let (limit, offset) = params.paging()?;
    let query = FrameQuery {
        stream_id: principal.stream_id(),
        start_time: parse_time_filter("timestamp_after", params.timestamp_after.as_deref())?,
        end_time: parse_time_filter("timestamp_before", params.timestamp_before.as_deref())?,
        classification: params.classification,
        limit: Some(limit),
        offset: Some(offset),
        ascending: is_ascending(params.sort.as_deref()),
    };

    let frames = state.frames.list_frames(&query).await?;
    let total = state.frames.count_matching(&query).await?;

    Ok(Json(PictureListResponse {
        pictures: frames.into_iter().map(Into::into).collect(),
        total,
    }))
}

/// Delete a persisted frame and its image
#[instrument(skip(state, principal), fields(user_id = principal.stream_id()))]
async fn delete_picture(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    let frame = state
        .frames
        .delete_frame(principal.stream_id(), id)
        .await
        .map_err(|e| match e {
            StoreError::NotFound => ApiError::NotFound("Picture not found".to_string()),
            e => e.into(),
        })?;

    if let Err(e) = state.blobs.delete(&frame.storage_path).await {
        warn!(error = %e, storage_path = %frame.storage_path, "Failed to remove image file");
    }

    Ok(message("Picture deleted"))
}

/// One daytime frame per elapsed day
#[instrument(skip(state, principal), fields(user_id = principal.stream_id()))]
async fn timelapse(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(params): ApiQuery<TimelapseQuery>,
) -> Result<Json<TimelapseResponse>, ApiError> {
    let start = match params.start_date.as_deref() {
        Some(s) if !s.is_empty() => parse_start_instant(s)?,
        _ => principal.user.germination_date.ok_or_else(|| {
            ApiError::BadRequest("start_date is required when no germination date is set".to_string())
        })?,
    };

    let deadline = tokio::time::Instant::now() + state.timelapse_timeout;
    let entries = state
        .timelapse
        .reconstruct_with_deadline(principal.stream_id(), start, deadline)
        .await?;

    Ok(Json(TimelapseResponse {
        start_date: start,
        pictures: entries
            .into_iter()
            .map(|e| TimelapsePicture {
                id: e.frame_id,
                timestamp: e.captured_at,
                image_path: image_path(&e.storage_path),
                day: e.day_index,
            })
            .collect(),
    }))
}

// ---------------------------------------------------------------------------
// Sensor data

async fn upload_sensor_data(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(request): ApiJson<SensorUploadRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let (Some(temperature), Some(humidity)) = (request.temperature, request.humidity) else {
        return Err(ApiError::BadRequest("Missing temperature or humidity".to_string()));
    };

    state
        .sensors
        .record(
            principal.stream_id(),
            Utc::now(),
            temperature,
            humidity,
            request.soil_humidity.unwrap_or(0.0),
        )
        .await?;

    metrics::counter!("telemetry.sensor_readings.recorded").increment(1);
    Ok(message("Sensor data uploaded successfully"))
}

async fn list_sensor_data(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(params): ApiQuery<ListQuery>,
) -> Result<Json<SensorListResponse>, ApiError> {
    let (limit, offset) = params.paging()?;
    let query = SensorQuery {
        stream_id: principal.stream_id(),
        start_time: parse_time_filter("timestamp_after", params.timestamp_after.as_deref())?,
        end_time: parse_time_filter("timestamp_before", params.timestamp_before.as_deref())?,
        limit: Some(limit),
        offset: Some(offset),
        ascending: is_ascending(params.sort.as_deref()),
    };

    let sensor_data = state.sensors.list(&query).await?;
    let total = state.sensors.count(&query).await?;

    Ok(Json(SensorListResponse { sensor_data, total }))
}

async fn sensor_summary(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(params): ApiQuery<SummaryQuery>,
) -> Result<Json<SensorSummary>, ApiError> {
    state
        .sensors
        .summary(principal.stream_id(), params.limit, params.leaf_temperature)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No sensor data".to_string()))
}

async fn delete_sensor_data(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .sensors
        .delete(principal.stream_id(), id)
        .await
        .map_err(|e| match e {
            StoreError::NotFound => ApiError::NotFound("Sensor data not found".to_string()),
            e => e.into(),
        })?;

    Ok(message("Sensor data deleted"))
}

// ---------------------------------------------------------------------------
// Preferences

async fn get_preferences(principal: Principal) -> Json<PreferencesResponse> {
    Json(PreferencesResponse {
        username: principal.user.username,
        germination_date: principal.user.germination_date,
    })
}

async fn set_preferences(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(body): ApiJson<PreferencesBody>,
) -> Result<Json<PreferencesResponse>, ApiError> {
    let germination_date = parse_time_filter("germination_date", body.germination_date.as_deref())?;

    state
        .users
        .set_germination_date(principal.stream_id(), germination_date)
        .await?;

    Ok(Json(PreferencesResponse {
        username: principal.user.username,
        germination_date,
    }))
}

// ---------------------------------------------------------------------------
// Administration

async fn list_users(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    principal.require_admin()?;
    let users = state.users.list().await?;
    Ok(Json(users.into_iter().map(Into::into).collect()))
}

#[instrument(skip(state, principal, request), fields(admin_id = principal.stream_id()))]
async fn create_user(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(request): ApiJson<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    principal.require_admin()?;

    let username = request.username.trim();
    if username.is_empty() {
        return Err(ApiError::BadRequest("Username must not be empty".to_string()));
    }
    if state.users.get_by_username(username).await?.is_some() {
        return Err(ApiError::Conflict(format!("User '{}' already exists", username)));
    }

    let user = state
        .users
        .create(username, request.role, request.api_key.filter(|k| !k.is_empty()))
        .await?;

    Ok((StatusCode::CREATED, Json(user.into())))
}

#[instrument(skip(state, principal, update), fields(admin_id = principal.stream_id()))]
async fn update_user(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(id): ApiPath<i64>,
    ApiJson(mut update): ApiJson<UserUpdate>,
) -> Result<Json<UserResponse>, ApiError> {
    principal.require_admin()?;

    update.username = update.username.map(|u| u.trim().to_string());

    if id == principal.stream_id() && update.role == Some(Role::User) {
        return Err(ApiError::BadRequest("Administrators cannot demote themselves".to_string()));
    }
    if let Some(ref username) = update.username {
        if username.is_empty() {
            return Err(ApiError::BadRequest("Username must not be empty".to_string()));
        }
        if let Some(existing) = state.users.get_by_username(username).await? {
            if existing.id != id {
                return Err(ApiError::Conflict(format!("User '{}' already exists", username)));
            }
        }
    }

    let user = state.users.update(id, &update).await.map_err(|e| match e {
        StoreError::NotFound => ApiError::NotFound("User not found".to_string()),
        e => e.into(),
    })?;

    Ok(Json(user.into()))
}

#[instrument(skip(state, principal), fields(admin_id = principal.stream_id()))]
async fn delete_user(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    principal.require_admin()?;

    if id == principal.stream_id() {
        return Err(ApiError::BadRequest("Administrators cannot delete themselves".to_string()));
    }

    state.users.delete(id).await.map_err(|e| match e {
        StoreError::NotFound => ApiError::NotFound("User not found".to_string()),
        e => e.into(),
    })?;

    // Frame rows went with the account; the images are still served under /uploads
    state.blobs.purge_stream(id).await.map_err(|e| {
        error!(error = %e, user_id = id, "Failed to remove images of deleted user");
        ApiError::Internal("User deleted but their images could not be removed".to_string())
    })?;

    Ok(message("User deleted"))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting telemetry API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
