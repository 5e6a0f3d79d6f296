use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

const BOT_RETRY_AFTER_SECONDS: u64 = 5 * 60;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: Some("NOT_FOUND"),
            retry_after_seconds: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn bot_detected(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: message.into(),
            code: Some("BOT_DETECTED"),
            retry_after_seconds: Some(BOT_RETRY_AFTER_SECONDS),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    BotDetected,
    Unavailable,
    Private,
    LiveStream,
    UnsupportedUrl,
    Other,
}

// Order matters: "private video" errors also contain "video unavailable".
const FAILURE_PATTERNS: [(&str, FailureKind); 7] = [
    ("sign in to confirm", FailureKind::BotDetected),
    ("not a bot", FailureKind::BotDetected),
    ("private video", FailureKind::Private),
    ("this live event", FailureKind::LiveStream),
    ("live stream", FailureKind::LiveStream),
    ("video unavailable", FailureKind::Unavailable),
    ("unsupported url", FailureKind::UnsupportedUrl),
];

/// The only place that matches extractor error text. Anything unmatched is `Other`.
pub fn classify_failure(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    FAILURE_PATTERNS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, kind)| *kind)
        .unwrap_or(FailureKind::Other)
}

impl FailureKind {
    pub fn user_message(self) -> &'static str {
        match self {
            Self::BotDetected => {
                "YouTube esta bloqueando las descargas temporalmente. Espera unos minutos e intenta nuevamente."
            }
            Self::Unavailable => {
                "Este video no esta disponible. Puede ser privado, estar restringido por region o haber sido eliminado."
            }
            Self::Private => "Este video es privado y no se puede descargar.",
            Self::LiveStream => "No se pueden descargar transmisiones en vivo.",
            Self::UnsupportedUrl => "URL no soportada o invalida para descarga.",
            Self::Other => "No se pudo procesar el video. Intenta nuevamente mas tarde.",
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{0}")]
    Validation(String),
    #[error("extraction failed ({kind:?}): {detail}")]
    Extraction { kind: FailureKind, detail: String },
    #[error("{0} is not installed")]
    ToolMissing(String),
    #[error("extractor timed out after {0} seconds")]
    TimedOut(u64),
    #[error("downloaded file is empty")]
    EmptyArtifact,
    #[error("downloaded file exceeds {max_mb} MB")]
    OversizedArtifact { max_mb: u64 },
    #[error("no downloaded file found in scratch directory")]
    ArtifactMissing,
    #[error("internal error: {0}")]
    Internal(String),
}

impl DownloadError {
    pub fn extraction(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::Extraction {
            kind: classify_failure(&detail),
            detail,
        }
    }

    pub fn is_bot_detection(&self) -> bool {
        matches!(
            self,
            Self::Extraction {
                kind: FailureKind::BotDetected,
                ..
            }
        )
    }

    /// Failures caused by the host rather than by the video or the request.
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            Self::ToolMissing(_) | Self::EmptyArtifact | Self::ArtifactMissing | Self::Internal(_)
        )
    }

    /// Text safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Extraction {
                kind: FailureKind::Other,
                detail,
            } => format!("Error al procesar el video: {}", last_line(detail)),
            Self::Extraction { kind, .. } => kind.user_message().to_string(),
            Self::ToolMissing(tool) => {
                format!("{tool} no esta instalado en el servidor. Contacta al administrador.")
            }
            Self::TimedOut(_) => {
                "La descarga excedio el tiempo limite. Intenta con otra URL o formato.".to_string()
            }
            Self::EmptyArtifact => "El archivo descargado esta vacio.".to_string(),
            Self::OversizedArtifact { max_mb } => {
                format!("Archivo demasiado grande para descargar (max. {max_mb} MB).")
            }
            Self::ArtifactMissing => "No se encontro el archivo descargado.".to_string(),
            Self::Internal(_) => "Ocurrio un error interno. Intenta nuevamente.".to_string(),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        let message = error.user_message();
        if error.is_server_fault() {
            ApiError::internal(message)
        } else if error.is_bot_detection() {
            ApiError::bot_detected(message)
        } else {
            ApiError::bad_request(message)
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("error desconocido")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_detection_text_is_classified() {
        let text = "ERROR: [youtube] abc123: Sign in to confirm you're not a bot";
        assert_eq!(classify_failure(text), FailureKind::BotDetected);
    }

    #[test]
    fn private_wins_over_unavailable() {
        let text = "ERROR: Video unavailable. Private video";
        assert_eq!(classify_failure(text), FailureKind::Private);
        assert_eq!(
            classify_failure("ERROR: Video unavailable"),
            FailureKind::Unavailable
        );
    }

    #[test]
    fn unmatched_text_is_other() {
        assert_eq!(
            classify_failure("HTTP Error 503: Service Unavailable"),
            FailureKind::Other
        );
    }

    #[test]
    fn bot_detection_maps_to_too_many_requests() {
        let api: ApiError = DownloadError::extraction("Sign in to confirm you're not a bot").into();
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.code, Some("BOT_DETECTED"));
        assert!(api.retry_after_seconds.is_some());
    }

    #[test]
    fn resource_errors_are_not_success() {
        let oversized: ApiError = DownloadError::OversizedArtifact { max_mb: 100 }.into();
        assert_eq!(oversized.status, StatusCode::BAD_REQUEST);
        let empty: ApiError = DownloadError::EmptyArtifact.into();
        assert_eq!(empty.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn only_host_side_failures_are_server_faults() {
        assert!(DownloadError::ToolMissing("yt-dlp".to_string()).is_server_fault());
        assert!(DownloadError::Internal("disk full".to_string()).is_server_fault());
        assert!(!DownloadError::TimedOut(600).is_server_fault());
        assert!(!DownloadError::extraction("ERROR: Private video").is_server_fault());
    }

    #[test]
    fn generic_extraction_message_keeps_last_line() {
        let error = DownloadError::extraction("WARNING: x\nERROR: HTTP Error 500\n");
        assert_eq!(
            error.user_message(),
            "Error al procesar el video: ERROR: HTTP Error 500"
        );
    }
}
