mod antibot;
mod artifacts;
mod catalog;
mod config;
mod error;
mod executor;
mod extractor;
mod page;
mod reaper;
mod routes;
mod tracker;

use std::{collections::HashSet, sync::Arc};

use axum::http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    antibot::Jitter,
    artifacts::ArtifactStore,
    config::Config,
    error::ApiError,
    executor::{DownloadPool, Executor},
    extractor::{Extractor, YtDlp, report_tool_availability},
    reaper::Reaper,
    routes::AppState,
    tracker::{MemoryProgressStore, ProgressStore},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "videodrop=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    let artifacts = ArtifactStore::new(config.transfer_dir.clone(), config.max_artifact_bytes);
    artifacts
        .prepare()
        .await
        .map_err(|error| ApiError::internal(error.to_string()))?;
    info!("Carpeta temporal de descargas: {:?}", artifacts.root());

    report_tool_availability(&config.yt_dlp_bin).await;
    if !config.antibot_delays {
        warn!("ANTIBOT_DELAYS=false: las pausas entre peticiones estan desactivadas.");
    }

    let store: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
    let extractor: Arc<dyn Extractor> =
        Arc::new(YtDlp::new(config.yt_dlp_bin.clone(), config.yt_dlp_timeout));
    let (reaper, _reaper_task) = Reaper::spawn(
        Arc::clone(&store),
        artifacts.clone(),
        config.sweep_interval,
        config.stale_retention,
    );

    let executor = Executor::new(
        Arc::clone(&extractor),
        artifacts,
        store,
        Jitter::new(config.antibot_delays),
    );
    let pool = DownloadPool::new(
        executor,
        config.max_concurrent_downloads,
        reaper.clone(),
        config.record_retention,
    );
    let state = AppState::new(&config, pool, extractor, reaper);

    let mut app = routes::router(state).layer(TraceLayer::new_for_http());
    if let Some(cors) = build_cors_layer(&config.allowed_origins)? {
        app = app.layer(cors);
    }

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!(
            "No se pudo iniciar el puerto {}: {error}",
            config.bind_addr
        ))
    })?;

    info!(
        "VideoDrop listo en http://{} ({} descarga(s) simultanea(s))",
        config.bind_addr, config.max_concurrent_downloads
    );

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")))
}

/// `None` when no origins are configured; the page itself is same-origin.
fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, ApiError> {
    if origins.is_empty() {
        return Ok(None);
    }

    let allowed_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Origen invalido en ALLOWED_ORIGINS: {origin}. Usa valores tipo https://dominio.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list cargada con {} origen(es): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allowed_origins = Arc::new(allowed_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!("CORS origin={:?} permitido={}", origin, allowed);
        allowed
    });

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([
                CONTENT_DISPOSITION,
                HeaderName::from_static("x-download-filename"),
            ]),
    ))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        return None;
    }
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    // `Url` already drops the scheme's default port.
    match parsed.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_normalize_case_and_default_ports() {
        assert_eq!(
            normalize_origin("HTTPS://Example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/app"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
    }

    #[test]
    fn cors_is_optional() {
        assert!(build_cors_layer(&[]).unwrap().is_none());
        assert!(
            build_cors_layer(&["https://app.example.com".to_string()])
                .unwrap()
                .is_some()
        );
        assert!(build_cors_layer(&["not a url".to_string()]).is_err());
    }
}
