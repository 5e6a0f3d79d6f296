use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{FromRequest, Path as UrlPath, Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    antibot::{BEFORE_PROBE, Jitter, RequestHeaders},
    artifacts::{discard_scratch, remove_scratch},
    catalog::{CatalogPolicy, build_catalog},
    config::Config,
    error::{ApiError, DownloadError},
    executor::{DownloadJob, DownloadPool},
    extractor::Extractor,
    page::{self, PageView},
    reaper::{CleanupTarget, Reaper},
    tracker::{DownloadId, DownloadRecord, DownloadStatus, ProgressStore},
};

#[derive(Clone)]
pub struct AppState {
    pool: DownloadPool,
    store: Arc<dyn ProgressStore>,
    extractor: Arc<dyn Extractor>,
    reaper: Reaper,
    jitter: Jitter,
    catalog_policy: CatalogPolicy,
    supported_domains: Arc<[String]>,
    sync_retention: Duration,
}

impl AppState {
    pub fn new(
        config: &Config,
        pool: DownloadPool,
        extractor: Arc<dyn Extractor>,
        reaper: Reaper,
    ) -> Self {
        Self {
            store: Arc::clone(pool.store()),
            pool,
            extractor,
            reaper,
            jitter: Jitter::new(config.antibot_delays),
            catalog_policy: config.catalog_policy,
            supported_domains: config.supported_domains.clone().into(),
            sync_retention: config.sync_retention,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index).post(process))
        .route("/process", post(process))
        .route("/download", post(download))
        .route("/start_download", post(start_download))
        .route("/download_progress/{id}", get(download_progress))
        .route("/download_file/{id}", get(download_file))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ProcessForm {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadForm {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub format_id: Option<String>,
}

impl DownloadForm {
    fn into_job(self, supported_domains: &[String]) -> Result<DownloadJob, DownloadError> {
        let url = validate_url(&self.url, supported_domains)?;
        let selector = self
            .format_id
            .as_deref()
            .map(str::trim)
            .filter(|selector| !selector.is_empty())
            .ok_or_else(|| DownloadError::Validation("URL y formato son requeridos".to_string()))?
            .to_string();
        Ok(DownloadJob { url, selector })
    }
}

/// Accepts the download fields either form-encoded or as JSON.
pub struct DownloadPayload(pub DownloadForm);

impl<S> FromRequest<S> for DownloadPayload
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));

        let form = if is_json {
            Json::<DownloadForm>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?
                .0
        } else {
            Form::<DownloadForm>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?
                .0
        };
        Ok(Self(form))
    }
}

#[derive(Debug, Serialize)]
pub struct StartedDownload {
    pub download_id: DownloadId,
}

#[derive(Debug, Serialize)]
pub struct ProgressView {
    pub id: DownloadId,
    #[serde(flatten)]
    pub record: DownloadRecord,
}

pub async fn index() -> Html<String> {
    Html(page::render(PageView::Empty))
}

/// Errors are rendered into the page, never as an HTTP failure.
pub async fn process(State(state): State<AppState>, Form(form): Form<ProcessForm>) -> Html<String> {
    let url = match validate_url(&form.url, &state.supported_domains) {
        Ok(url) => url,
        Err(error) => return Html(page::render(PageView::Error(&error.user_message()))),
    };

    state.jitter.pause(BEFORE_PROBE).await;
    let metadata = match state
        .extractor
        .probe(&url, &RequestHeaders::randomized())
        .await
    {
        Ok(metadata) => metadata,
        Err(failure) => {
            let error = DownloadError::from(failure);
            warn!("No se pudo obtener informacion de {url}: {error}");
            return Html(page::render(PageView::Error(&error.user_message())));
        }
    };

    let catalog = build_catalog(&metadata, state.catalog_policy);
    info!(
        "Formatos listos para \"{}\": {} opcion(es)",
        metadata.display_title(),
        catalog.len()
    );
    Html(page::render(PageView::Video {
        url: &url,
        metadata: &metadata,
        catalog: &catalog,
    }))
}

pub async fn download(
    State(state): State<AppState>,
    Form(form): Form<DownloadForm>,
) -> Result<Response, ApiError> {
    let job = form.into_job(&state.supported_domains)?;
    let done = state.pool.run_now(&job).await?;
    info!(
        "Descarga sincrona lista: {} ({} bytes, formato {})",
        done.filename(),
        done.size,
        done.selector
    );

    match file_response(&done.path, None).await {
        Ok(response) => {
            state
                .reaper
                .schedule(state.sync_retention, vec![CleanupTarget::Scratch(done.scratch_dir)]);
            Ok(response)
        }
        Err(failure) => {
            error!("No se pudo entregar {:?}: {}", done.path, failure.message);
            remove_scratch(&done.scratch_dir).await;
            Err(failure)
        }
    }
}

pub async fn start_download(
    State(state): State<AppState>,
    DownloadPayload(form): DownloadPayload,
) -> Result<Json<StartedDownload>, ApiError> {
    let job = form.into_job(&state.supported_domains)?;
    let download_id = state.pool.submit(job);
    info!("Descarga {download_id} en cola");
    Ok(Json(StartedDownload { download_id }))
}

pub async fn download_progress(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<ProgressView>, ApiError> {
    let (id, record) = DownloadId::parse(&id)
        .and_then(|id| state.store.get(id).map(|record| (id, record)))
        .ok_or_else(|| ApiError::not_found("Descarga no encontrada"))?;
    Ok(Json(ProgressView { id, record }))
}

pub async fn download_file(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let (id, record) = DownloadId::parse(&id)
        .and_then(|id| state.store.get(id).map(|record| (id, record)))
        .ok_or_else(|| ApiError::not_found("Descarga no encontrada"))?;

    match record.status {
        DownloadStatus::Finished => {}
        DownloadStatus::Error => {
            return Err(ApiError::bad_request(
                record
                    .error
                    .unwrap_or_else(|| "La descarga fallo.".to_string()),
            ));
        }
        DownloadStatus::Starting | DownloadStatus::Downloading => {
            return Err(ApiError::bad_request("El archivo aun no esta listo."));
        }
    }

    let path = record
        .path
        .ok_or_else(|| ApiError::not_found("Archivo no encontrado"))?;
    let cleanup = TransferCleanup {
        store: Arc::clone(&state.store),
        id,
        scratch_dir: path.parent().map(Path::to_path_buf),
    };
    file_response(&path, Some(cleanup))
        .await
        .inspect_err(|failure| error!("No se pudo entregar la descarga {id}: {}", failure.message))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "message": "Servicio activo"}))
}

/// Drops the record and scratch directory once the response body is gone,
/// whether it was fully sent or the client disconnected.
struct TransferCleanup {
    store: Arc<dyn ProgressStore>,
    id: DownloadId,
    scratch_dir: Option<PathBuf>,
}

impl Drop for TransferCleanup {
    fn drop(&mut self) {
        self.store.delete(self.id);
        debug!("Transferencia {} terminada", self.id);

        if let Some(dir) = self.scratch_dir.take() {
            discard_scratch(dir);
        }
    }
}

async fn file_response(path: &Path, cleanup: Option<TransferCleanup>) -> Result<Response, ApiError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());

    let file = tokio::fs::File::open(path).await.map_err(|error| {
        ApiError::internal(format!("No se pudo leer el archivo temporal: {error}"))
    })?;
    let content_length = file
        .metadata()
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "No se pudo leer metadata del archivo temporal: {error}"
            ))
        })?
        .len();

    let stream = ReaderStream::new(file);
    let body = match cleanup {
        Some(guard) => Body::from_stream(stream.map(move |chunk| {
            let _held = &guard;
            chunk
        })),
        None => Body::from_stream(stream),
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );
    headers.insert(
        HeaderName::from_static("x-download-filename"),
        HeaderValue::from_str(&sanitize_ascii_filename(&filename))
            .map_err(|_| ApiError::internal("No se pudo crear el nombre del archivo."))?,
    );

    Ok((headers, body).into_response())
}

/// Returns the trimmed URL when it is http(s) on one of the allowed hosts.
pub fn validate_url(input: &str, supported_domains: &[String]) -> Result<String, DownloadError> {
    let url = input.trim();
    if url.is_empty() {
        return Err(DownloadError::Validation(
            "Por favor ingresa una URL valida".to_string(),
        ));
    }
    if !is_supported_download_url(url, supported_domains) {
        return Err(DownloadError::Validation(
            "Solo URLs de YouTube son compatibles".to_string(),
        ));
    }
    Ok(url.to_string())
}

fn is_supported_download_url(input: &str, supported_domains: &[String]) -> bool {
    let Ok(parsed) = Url::parse(input) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
        return false;
    };

    supported_domains
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    match sanitized.trim() {
        "" => "download.bin".to_string(),
        compact => compact.to_string(),
    }
}
