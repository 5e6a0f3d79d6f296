//! Fallback download ladder and the bounded pool that runs it in the
//! background.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{sync::Semaphore, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    antibot::{AFTER_BOT_BLOCK, BEFORE_DOWNLOAD, BETWEEN_ATTEMPTS, Jitter, RequestHeaders},
    artifacts::{ArtifactStore, discard_scratch, remove_scratch},
    error::DownloadError,
    extractor::{Extractor, FetchRequest, TransferProgress},
    reaper::{CleanupTarget, Reaper},
    tracker::{DownloadId, DownloadRecord, ProgressStore, TrackerError},
};

const SAFETY_NET_SELECTORS: [&str; 3] = ["best[filesize<30M]", "worst[filesize<10M]", "bestaudio"];
const TARGET_EXTENSION: &str = "mp4";
const MAX_TITLE_CHARS: usize = 25;

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub selector: String,
}

/// A verified artifact sitting in its scratch directory.
#[derive(Debug, Clone)]
pub struct CompletedDownload {
    pub path: PathBuf,
    pub scratch_dir: PathBuf,
    pub size: u64,
    pub selector: String,
}

impl CompletedDownload {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| "download.bin".to_string())
    }
}

/// The user's selector first, then the safety nets, without repeats.
pub fn fallback_ladder(selector: &str) -> Vec<String> {
    let mut ladder = vec![selector.trim().to_string()];
    for fallback in SAFETY_NET_SELECTORS {
        if !ladder.iter().any(|existing| existing == fallback) {
            ladder.push(fallback.to_string());
        }
    }
    ladder
}

/// Keeps letters, digits, spaces, `-` and `_`; at most 25 characters.
pub fn safe_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|character| character.is_alphanumeric() || matches!(character, ' ' | '-' | '_'))
        .collect();
    let truncated: String = kept.trim().chars().take(MAX_TITLE_CHARS).collect();
    let truncated = truncated.trim();
    if truncated.is_empty() {
        "video".to_string()
    } else {
        truncated.to_string()
    }
}

pub struct Executor {
    extractor: Arc<dyn Extractor>,
    artifacts: ArtifactStore,
    store: Arc<dyn ProgressStore>,
    jitter: Jitter,
}

impl Executor {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        artifacts: ArtifactStore,
        store: Arc<dyn ProgressStore>,
        jitter: Jitter,
    ) -> Self {
        Self {
            extractor,
            artifacts,
            store,
            jitter,
        }
    }

    /// Runs one logical download to a terminal record. On failure the scratch
    /// directory is already gone when this returns.
    pub async fn run(
        &self,
        id: DownloadId,
        job: &DownloadJob,
    ) -> Result<CompletedDownload, DownloadError> {
        let result = self.execute(id, job).await;
        let current = self
            .store
            .get(id)
            .unwrap_or_else(DownloadRecord::starting);

        let settled = match &result {
            Ok(done) => current.finished(done.path.clone()),
            Err(failure) => {
                if failure.is_server_fault() {
                    error!("Descarga {id} fallida por un error del servidor: {failure}");
                } else {
                    warn!("Descarga {id} fallida: {failure}");
                }
                current.failed(failure.user_message())
            }
        };
        if let Err(error) = self.store.update(id, settled) {
            debug!("No se pudo cerrar el registro {id}: {error}");
        }

        result
    }

    async fn execute(
        &self,
        id: DownloadId,
        job: &DownloadJob,
    ) -> Result<CompletedDownload, DownloadError> {
        self.jitter.pause(BEFORE_DOWNLOAD).await;
        let scratch = ScratchGuard::new(self.artifacts.allocate().await?);

        let result = self.attempt_ladder(id, job, &scratch.dir).await;
        let scratch_dir = scratch.release();
        if result.is_err() {
            remove_scratch(&scratch_dir).await;
        }
        result
    }

    async fn attempt_ladder(
        &self,
        id: DownloadId,
        job: &DownloadJob,
        scratch_dir: &Path,
    ) -> Result<CompletedDownload, DownloadError> {
        let metadata = self
            .extractor
            .probe(&job.url, &RequestHeaders::randomized())
            .await?;
        let title = safe_title(metadata.title.as_deref().unwrap_or_default());
        let output_template = scratch_dir
            .join(format!("{title}.%(ext)s"))
            .to_string_lossy()
            .into_owned();

        let base = self
            .store
            .get(id)
            .unwrap_or_else(DownloadRecord::starting);
        let store = Arc::clone(&self.store);
        let on_progress = move |sample: TransferProgress| {
            let Some(total) = sample.total.filter(|total| *total > 0) else {
                return;
            };
            match store.update(id, base.downloading(sample.downloaded, total)) {
                Ok(()) | Err(TrackerError::AlreadySettled(_)) => {}
                Err(error) => debug!("Progreso descartado: {error}"),
            }
        };

        let ladder = fallback_ladder(&job.selector);
        let mut last_error = None;
        let mut produced = None;

        for (attempt, selector) in ladder.iter().enumerate() {
            if attempt > 0 {
                self.jitter.pause(BETWEEN_ATTEMPTS).await;
            }
            info!(
                "Descarga {id}: intento {}/{} con formato {selector}",
                attempt + 1,
                ladder.len()
            );

            let request = FetchRequest {
                url: job.url.clone(),
                selector: selector.clone(),
                output_template: output_template.clone(),
                headers: RequestHeaders::randomized(),
            };

            match self.extractor.fetch(&request, &on_progress).await {
                Ok(printed_path) => {
                    info!("Descarga {id}: exito con formato {selector}");
                    produced = Some((selector.clone(), printed_path));
                    break;
                }
                Err(failure) => {
                    let error = DownloadError::from(failure);
                    warn!("Descarga {id}: fallo con formato {selector}: {error}");

                    if matches!(error, DownloadError::ToolMissing(_)) {
                        return Err(error);
                    }
                    if error.is_bot_detection() && attempt + 1 < ladder.len() {
                        info!("Descarga {id}: bloqueo anti-bot detectado, esperando antes de reintentar");
                        self.jitter.pause(AFTER_BOT_BLOCK).await;
                    }
                    last_error = Some(error);
                }
            }
        }

        let Some((selector, printed_path)) = produced else {
            return Err(last_error.unwrap_or_else(|| {
                DownloadError::Internal("no hay formatos para intentar".to_string())
            }));
        };

        let path = self
            .artifacts
            .locate(scratch_dir, TARGET_EXTENSION, printed_path.as_deref())
            .await?;
        let size = self.artifacts.verify(&path).await?;

        Ok(CompletedDownload {
            path,
            scratch_dir: scratch_dir.to_path_buf(),
            size,
            selector,
        })
    }
}

/// Bounded set of download workers shared by both endpoint styles.
#[derive(Clone)]
pub struct DownloadPool {
    executor: Arc<Executor>,
    store: Arc<dyn ProgressStore>,
    permits: Arc<Semaphore>,
    reaper: Reaper,
    record_retention: Duration,
}

impl DownloadPool {
    pub fn new(
        executor: Executor,
        max_concurrent: usize,
        reaper: Reaper,
        record_retention: Duration,
    ) -> Self {
        let store = Arc::clone(&executor.store);
        Self {
            executor: Arc::new(executor),
            store,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            reaper,
            record_retention,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// Waits for a worker slot and runs the download on the calling task.
    /// The record only lives for the duration of the call.
    pub async fn run_now(&self, job: &DownloadJob) -> Result<CompletedDownload, DownloadError> {
        let id = DownloadId::generate();
        self.store.create(id);

        let _lease = RecordLease {
            store: self.store.as_ref(),
            id,
        };

        match self.permits.clone().acquire_owned().await {
            Ok(_permit) => self.executor.run(id, job).await,
            Err(_) => Err(DownloadError::Internal(
                "No se pudo reservar capacidad de descarga.".to_string(),
            )),
        }
    }

    /// Queues the download and returns its id at once. A supervisor task
    /// settles the record if the worker panics, then schedules retention
    /// cleanup.
    pub fn submit(&self, job: DownloadJob) -> DownloadId {
        let id = DownloadId::generate();
        self.store.create(id);

        let executor = Arc::clone(&self.executor);
        let permits = Arc::clone(&self.permits);
        let worker = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| {
                DownloadError::Internal("No se pudo reservar capacidad de descarga.".to_string())
            })?;
            executor.run(id, &job).await
        });

        let store = Arc::clone(&self.store);
        let reaper = self.reaper.clone();
        let retention = self.record_retention;
        tokio::spawn(async move {
            let mut targets = vec![CleanupTarget::Record(id)];
            match worker.await {
                Ok(Ok(done)) => targets.push(CleanupTarget::Scratch(done.scratch_dir)),
                Ok(Err(failure)) => settle_failed(store.as_ref(), id, failure.user_message()),
                Err(join_error) => {
                    error!("La tarea de descarga {id} termino de forma inesperada: {join_error}");
                    settle_failed(
                        store.as_ref(),
                        id,
                        DownloadError::Internal(join_error.to_string()).user_message(),
                    );
                }
            }
            reaper.schedule(retention, targets);
        });

        id
    }
}

/// Deletes the scratch directory if the download is dropped mid-flight.
struct ScratchGuard {
    dir: PathBuf,
    armed: bool,
}

impl ScratchGuard {
    fn new(dir: PathBuf) -> Self {
        Self { dir, armed: true }
    }

    fn release(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.dir)
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("Descarga cancelada, limpiando {:?}", self.dir);
            discard_scratch(std::mem::take(&mut self.dir));
        }
    }
}

/// Removes a synchronous download's record on every exit, cancellation included.
struct RecordLease<'a> {
    store: &'a dyn ProgressStore,
    id: DownloadId,
}

impl Drop for RecordLease<'_> {
    fn drop(&mut self) {
        self.store.delete(self.id);
    }
}

fn settle_failed(store: &dyn ProgressStore, id: DownloadId, message: String) {
    let Some(current) = store.get(id) else {
        return;
    };
    if current.status.is_terminal() {
        return;
    }
    if let Err(error) = store.update(id, current.failed(message)) {
        debug!("No se pudo marcar la descarga {id} como fallida: {error}");
    }
}
