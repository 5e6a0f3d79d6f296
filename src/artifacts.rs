use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::DownloadError, extractor::extension_of};

const LEFTOVER_EXTENSIONS: [&str; 4] = ["part", "ytdl", "temp", "tmp"];

/// Owns the transfer directory and every scratch directory inside it.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    max_bytes: u64,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, max_bytes: u64) -> Self {
        Self { root, max_bytes }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_megabytes(&self) -> u64 {
        self.max_bytes / 1_048_576
    }

    pub async fn prepare(&self) -> Result<(), DownloadError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|error| {
            DownloadError::Internal(format!(
                "No se pudo crear la carpeta temporal {:?}: {error}",
                self.root
            ))
        })
    }

    pub async fn allocate(&self) -> Result<PathBuf, DownloadError> {
        let dir = self.root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(|error| {
            DownloadError::Internal(format!(
                "No se pudo preparar la descarga temporal: {error}"
            ))
        })?;
        debug!("Carpeta temporal asignada: {:?}", dir);
        Ok(dir)
    }

    /// Finds the produced file, preferring the path the extractor printed,
    /// then any file carrying `preferred_ext`, then any other finished file.
    pub async fn locate(
        &self,
        dir: &Path,
        preferred_ext: &str,
        printed_path: Option<&Path>,
    ) -> Result<PathBuf, DownloadError> {
        let canonical_dir = tokio::fs::canonicalize(dir).await.map_err(|error| {
            DownloadError::Internal(format!("No se pudo resolver carpeta temporal: {error}"))
        })?;

        if let Some(path) = printed_path {
            if let Some(valid_path) = resolve_candidate(&canonical_dir, path).await? {
                return Ok(valid_path);
            }
            if let Some(valid_path) = resolve_candidate(&canonical_dir, &dir.join(path)).await? {
                return Ok(valid_path);
            }
        }

        let mut entries = tokio::fs::read_dir(dir).await.map_err(|error| {
            DownloadError::Internal(format!("No se pudo abrir la carpeta temporal: {error}"))
        })?;

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|error| {
            DownloadError::Internal(format!("No se pudo leer archivos temporales: {error}"))
        })? {
            let path = entry.path();
            if is_leftover(&path) {
                continue;
            }
            if let Some(valid_path) = resolve_candidate(&canonical_dir, &path).await? {
                candidates.push(valid_path);
            }
        }
        candidates.sort();

        let preferred = candidates
            .iter()
            .position(|path| extension_of(path).as_deref() == Some(preferred_ext));
        match preferred {
            Some(index) => Ok(candidates.swap_remove(index)),
            None => candidates
                .into_iter()
                .next()
                .ok_or(DownloadError::ArtifactMissing),
        }
    }

    pub async fn verify(&self, path: &Path) -> Result<u64, DownloadError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|error| {
            DownloadError::Internal(format!(
                "No se pudo leer metadata del archivo temporal: {error}"
            ))
        })?;
        let size = metadata.len();

        if size == 0 {
            remove_file(path).await;
            return Err(DownloadError::EmptyArtifact);
        }
        if size > self.max_bytes {
            warn!(
                "Archivo {:?} descartado: {size} bytes superan el limite de {} bytes",
                path, self.max_bytes
            );
            remove_file(path).await;
            return Err(DownloadError::OversizedArtifact {
                max_mb: self.max_megabytes(),
            });
        }

        Ok(size)
    }

    /// Removes entries of the transfer directory not modified for `older_than`.
    pub async fn sweep_stale(&self, older_than: Duration) -> usize {
        if older_than.is_zero() {
            return 0;
        }

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("No se pudo abrir carpeta temporal para limpieza: {error}");
                }
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;

        loop {
            let maybe_entry = match entries.next_entry().await {
                Ok(value) => value,
                Err(error) => {
                    warn!("No se pudo iterar carpeta temporal para limpieza: {error}");
                    break;
                }
            };

            let Some(entry) = maybe_entry else {
                break;
            };

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!("No se pudo leer metadata de {:?}: {error}", path);
                    continue;
                }
            };

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified_at| now.duration_since(modified_at).ok())
                .unwrap_or(Duration::ZERO);
            if age < older_than {
                continue;
            }

            let result = if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("No se pudo eliminar temporal {:?}: {error}", path),
            }
        }

        if removed > 0 {
            info!("Limpieza periodica: {removed} temporal(es) eliminado(s)");
        }
        removed
    }
}

/// Best-effort recursive delete; a missing directory is not an error.
pub async fn remove_scratch(dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("No se pudo limpiar carpeta temporal {:?}: {error}", dir);
    }
}

/// For `Drop` impls. Runs the removal on the current runtime when there is
/// one and blocks otherwise.
pub fn discard_scratch(dir: PathBuf) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { remove_scratch(&dir).await });
        }
        Err(_) => {
            if let Err(error) = std::fs::remove_dir_all(&dir)
                && error.kind() != ErrorKind::NotFound
            {
                debug!("No se pudo limpiar {:?}: {error}", dir);
            }
        }
    }
}

async fn remove_file(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("No se pudo eliminar archivo {:?}: {error}", path);
    }
}

fn is_leftover(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| LEFTOVER_EXTENSIONS.contains(&ext.as_str()))
}

async fn resolve_candidate(
    canonical_dir: &Path,
    candidate_path: &Path,
) -> Result<Option<PathBuf>, DownloadError> {
    let metadata = match tokio::fs::metadata(candidate_path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(DownloadError::Internal(format!(
                "No se pudo leer archivo temporal descargado: {error}"
            )));
        }
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate_path)
        .await
        .map_err(|error| {
            DownloadError::Internal(format!(
                "No se pudo resolver ruta temporal descargada: {error}"
            ))
        })?;

    if !canonical_candidate.starts_with(canonical_dir) {
        warn!(
            "Se bloqueo un archivo fuera de la carpeta temporal esperada: {:?}",
            canonical_candidate
        );
        return Ok(None);
    }

    Ok(Some(canonical_candidate))
}
