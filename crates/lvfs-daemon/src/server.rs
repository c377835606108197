use std::{env, net::SocketAddr, path::PathBuf, sync::Arc};

use crate::auth::{AuthError, AuthService, VendorInfo};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, ConnectInfo, DefaultBodyLimit, Multipart, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lvfs_db::{Database, FirmwareRecord};
use lvfs_upload::{
    LocalFirmwareStorage, StorageError, UploadCheck, UploadError, UploadRequest, UploadService,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{IntoParams, Modify, OpenApi, ToSchema};
use uuid::Uuid;

const DEFAULT_MAX_BODY_MIB: u64 = 64;
const UNKNOWN_REMOTE_ADDR: &str = "unknown";

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let upload_dir = config.upload_dir();
    let storage = LocalFirmwareStorage::new(&upload_dir);
    storage
        .prepare()
        .await
        .with_context(|| format!("creating upload directory {}", upload_dir.display()))?;

    let state = Arc::new(AppState::new(db, storage, &config));
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        upload_dir = %upload_dir.display(),
        "lvfs-daemon listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/upload", post(upload_firmware))
        .route("/upload.php", post(upload_firmware))
        .route("/result.php", get(upload_result))
        .route("/api/v1/firmware", get(list_firmware))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

struct AppState {
    uploads: UploadService<LocalFirmwareStorage>,
    auth: AuthService,
    db: Database,
    result_page: String,
    max_body_bytes: usize,
}

impl AppState {
    fn new(db: Database, storage: LocalFirmwareStorage, config: &AppConfig) -> Self {
        Self {
            uploads: UploadService::new(db.clone(), storage),
            auth: AuthService::new(db.clone()),
            db,
            result_page: config.result_page.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    data_dir: PathBuf,
    result_page: String,
    max_body_bytes: usize,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("LVFS_API_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid LVFS_API_ADDR")?;

        let db_url = lookup("LVFS_DB_DSN")
            .or_else(|| lookup("DATABASE_URL"))
            .context("LVFS_DB_DSN or DATABASE_URL must be configured")?;

        let data_dir = non_empty(lookup("LVFS_DATA_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let result_page =
            non_empty(lookup("LVFS_RESULT_PAGE")).unwrap_or_else(|| "result.php".to_string());

        let max_body_mib = match non_empty(lookup("LVFS_MAX_BODY_MIB")) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .context("invalid LVFS_MAX_BODY_MIB")?,
            None => DEFAULT_MAX_BODY_MIB,
        };
        let max_body_bytes = mi_bytes(max_body_mib)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .context("LVFS_MAX_BODY_MIB is too large")?;

        Ok(Self {
            listen_addr,
            db_url,
            data_dir,
            result_page,
            max_body_bytes,
        })
    }

    fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Multipart form accepted by the upload endpoint.
#[derive(Debug, ToSchema)]
#[allow(dead_code)]
struct UploadForm {
    /// Vendor key.
    auth: String,
    /// Cabinet archive.
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
}

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 302, description = "Redirect to the result page with per-check flags"),
        (status = 400, description = "Malformed form or missing file", body = ErrorBody),
        (status = 403, description = "Upload directory is not writable", body = ErrorBody),
        (status = 409, description = "Same archive recorded concurrently", body = ErrorBody),
        (status = 413, description = "Archive could not be written", body = ErrorBody),
        (status = 500, description = "Database failure", body = ErrorBody)
    )
)]
async fn upload_firmware(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_upload_form(&mut multipart).await?;
    let remote_addr = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_REMOTE_ADDR.to_string());

    let request = UploadRequest::new(form.auth, remote_addr, form.filename, form.data);
    let outcome = state.uploads.upload(request).await.map_err(ApiError::from)?;

    let location = outcome.redirect_location(&state.result_page);
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

struct ParsedUploadForm {
    auth: String,
    filename: String,
    data: Vec<u8>,
}

async fn read_upload_form(multipart: &mut Multipart) -> Result<ParsedUploadForm, ApiError> {
    let mut auth: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(ApiError::from)? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "auth" => auth = Some(field.text().await.map_err(ApiError::from)?),
            "file" => {
                filename = field.file_name().and_then(sanitize_filename);
                data = Some(field.bytes().await.map_err(ApiError::from)?.to_vec());
            }
            _ => {}
        }
    }

    let data = data.ok_or_else(|| ApiError::bad_request("missing multipart file field 'file'"))?;
    let filename = filename.ok_or_else(|| ApiError::bad_request("uploaded file has no name"))?;

    Ok(ParsedUploadForm {
        auth: auth.unwrap_or_default(),
        filename,
        data,
    })
}

/// Keeps only the last path component so a name cannot leave the upload dir.
fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    match name {
        "" | "." | ".." => None,
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct ResultQuery {
    /// `False` when the vendor key was rejected.
    authkey: Option<String>,
    /// `False` when the archive size was out of range.
    sizecheck: Option<String>,
    /// `False` when the archive is not a cabinet file.
    filetype: Option<String>,
    /// `False` when no `.metainfo.xml` was found.
    metadata: Option<String>,
    /// `False` when the archive was uploaded before.
    exists: Option<String>,
    /// Overall outcome.
    result: Option<String>,
}

impl ResultQuery {
    fn flag(&self, check: UploadCheck) -> Option<&str> {
        match check {
            UploadCheck::AuthKey => self.authkey.as_deref(),
            UploadCheck::SizeCheck => self.sizecheck.as_deref(),
            UploadCheck::FileType => self.filetype.as_deref(),
            UploadCheck::Metadata => self.metadata.as_deref(),
            UploadCheck::Exists => self.exists.as_deref(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct UploadResultResponse {
    result: bool,
    failures: Vec<CheckFailureResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
struct CheckFailureResponse {
    check: String,
    message: String,
}

#[utoipa::path(
    get,
    path = "/result.php",
    params(ResultQuery),
    responses((status = 200, description = "Decoded upload result", body = UploadResultResponse))
)]
async fn upload_result(Query(query): Query<ResultQuery>) -> Json<UploadResultResponse> {
    let failures: Vec<CheckFailureResponse> = UploadCheck::ALL
        .into_iter()
        .filter(|check| query.flag(*check).map(is_false_flag).unwrap_or(false))
        .map(|check| CheckFailureResponse {
            check: check.as_str().to_string(),
            message: check.description().to_string(),
        })
        .collect();

    let result = match query.result.as_deref() {
        Some(value) => !is_false_flag(value) && failures.is_empty(),
        None => failures.is_empty(),
    };

    Json(UploadResultResponse { result, failures })
}

fn is_false_flag(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false")
}

#[derive(Debug, Serialize, ToSchema)]
struct FirmwareResponse {
    id: Uuid,
    filename: String,
    hash: String,
    addr: String,
    uploaded_at: String,
}

impl From<FirmwareRecord> for FirmwareResponse {
    fn from(record: FirmwareRecord) -> Self {
        Self {
            id: record.id,
            filename: record.filename,
            hash: record.hash,
            addr: record.addr,
            uploaded_at: record.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct FirmwareListResponse {
    vendor: VendorInfo,
    firmware: Vec<FirmwareResponse>,
}

#[utoipa::path(
    get,
    path = "/api/v1/firmware",
    responses(
        (status = 200, description = "Firmware uploaded by the calling vendor", body = FirmwareListResponse),
        (status = 401, description = "Missing or invalid vendor key", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_firmware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<FirmwareListResponse>, ApiError> {
    let vendor = state
        .auth
        .authorize(require_bearer(&headers)?)
        .await
        .map_err(ApiError::from)?;

    let firmware = state
        .db
        .list_firmware(&vendor.vendor_key)
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .map(FirmwareResponse::from)
        .collect();

    Ok(Json(FirmwareListResponse {
        vendor: VendorInfo::from(&vendor),
        firmware,
    }))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Storage(StorageError::Open { dir, .. }) => ApiError::new(
                StatusCode::FORBIDDEN,
                format!("Write permission for {} missing", dir.display()),
            ),
            UploadError::Storage(StorageError::Write { path, .. }) => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Failed to write {}", path.display()),
            ),
            UploadError::Storage(other) => ApiError::internal(other),
            UploadError::Duplicate(hash) => ApiError::new(
                StatusCode::CONFLICT,
                format!("firmware {hash} was uploaded concurrently"),
            ),
            UploadError::Database(err) => ApiError::internal(format!("{err:#}")),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidToken => ApiError::unauthorized("invalid vendor key"),
            AuthError::Internal(message) => ApiError::internal(message),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::new(err.status(), err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

fn mi_bytes(value: u64) -> Option<u64> {
    value.checked_mul(1024 * 1024)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "LVFS Upload API", version = "0.1.0"),
        paths(healthz, upload_firmware, upload_result, list_firmware),
        components(schemas(
            UploadForm,
            UploadResultResponse,
            CheckFailureResponse,
            FirmwareResponse,
            FirmwareListResponse,
            VendorInfo,
            ErrorBody
        )),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            let components = openapi.components.get_or_insert_with(Default::default);
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("Vendor Key")
                        .description(Some("Vendor key passed as a bearer token"))
                        .build(),
                ),
            );
        }
    }
}

fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing Authorization bearer token"))?;
    let header_value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| ApiError::unauthorized("Authorization header must be a Bearer token"))
}
