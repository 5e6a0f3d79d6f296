use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    time::{Duration, timeout},
};
use tracing::{debug, info, warn};

use crate::{antibot::RequestHeaders, error::DownloadError};

const PROBE_SOCKET_TIMEOUT_SECONDS: u64 = 30;
const FETCH_SOCKET_TIMEOUT_SECONDS: u64 = 45;
const PROGRESS_MARKER: &str = "VDPROGRESS|";
const FILEPATH_MARKER: &str = "VDFILE|";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawEncoding>,
}

impl VideoMetadata {
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or("Video sin titulo")
    }

    pub fn duration_seconds(&self) -> Option<u64> {
        self.duration
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .map(|seconds| seconds.round() as u64)
    }
}

/// Only the fields the catalog reads; serde skips the rest of each entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEncoding {
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub filesize: Option<f64>,
}

impl RawEncoding {
    pub fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(value) if value != "none")
    }
}

/// One attempt of the fallback ladder.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub selector: String,
    pub output_template: String,
    pub headers: RequestHeaders,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

pub type ProgressFn = dyn Fn(TransferProgress) + Send + Sync;

#[derive(Debug, Error)]
pub enum ExtractorFailure {
    #[error("{0} is not installed")]
    NotInstalled(String),
    #[error("extractor timed out after {0} seconds")]
    TimedOut(u64),
    #[error("{0}")]
    Rejected(String),
    #[error("could not parse extractor metadata: {0}")]
    Malformed(String),
    #[error("could not run extractor: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExtractorFailure> for DownloadError {
    fn from(failure: ExtractorFailure) -> Self {
        match failure {
            ExtractorFailure::NotInstalled(binary) => DownloadError::ToolMissing(binary),
            ExtractorFailure::TimedOut(seconds) => DownloadError::TimedOut(seconds),
            ExtractorFailure::Rejected(text) => DownloadError::extraction(text),
            ExtractorFailure::Malformed(text) => DownloadError::extraction(text),
            ExtractorFailure::Io(error) => DownloadError::Internal(error.to_string()),
        }
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn probe(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<VideoMetadata, ExtractorFailure>;

    /// Downloads into the request's output template. Returns the final path
    /// when the tool reports one.
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressFn,
    ) -> Result<Option<PathBuf>, ExtractorFailure>;
}

pub struct YtDlp {
    binary: String,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn spawn_failure(&self, error: std::io::Error) -> ExtractorFailure {
        if error.kind() == ErrorKind::NotFound {
            ExtractorFailure::NotInstalled(self.binary.clone())
        } else {
            ExtractorFailure::Io(error)
        }
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn probe(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<VideoMetadata, ExtractorFailure> {
        let mut args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-check-certificate".to_string(),
            "--socket-timeout".to_string(),
            PROBE_SOCKET_TIMEOUT_SECONDS.to_string(),
            "--extractor-args".to_string(),
            "youtube:player_client=android,web;skip=hls".to_string(),
        ];
        args.extend(header_args(headers));
        args.push(url.to_string());

        debug!("Consultando metadatos con yt-dlp para {url}");
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| ExtractorFailure::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| self.spawn_failure(error))?;

        if !output.status.success() {
            return Err(ExtractorFailure::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|error| ExtractorFailure::Malformed(error.to_string()))
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressFn,
    ) -> Result<Option<PathBuf>, ExtractorFailure> {
        let mut child = Command::new(&self.binary)
            .args(fetch_args(request))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| self.spawn_failure(error))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractorFailure::Rejected("yt-dlp sin salida estandar".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractorFailure::Rejected("yt-dlp sin salida de errores".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            BufReader::new(stderr).read_to_string(&mut text).await.map(|_| text)
        });

        let drive = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut printed_path = None;
            while let Some(line) = lines.next_line().await? {
                if let Some(sample) = parse_progress_line(&line) {
                    progress(sample);
                } else if let Some(path) = parse_filepath_line(&line) {
                    printed_path = Some(path);
                } else {
                    debug!("yt-dlp: {line}");
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, printed_path))
        };

        let (status, printed_path) = timeout(self.timeout, drive)
            .await
            .map_err(|_| ExtractorFailure::TimedOut(self.timeout.as_secs()))??;

        let stderr_text = match stderr_task.await {
            Ok(Ok(text)) => text,
            Ok(Err(error)) => {
                warn!("No se pudo leer stderr de yt-dlp: {error}");
                String::new()
            }
            Err(error) => {
                warn!("Lectura de stderr de yt-dlp abortada: {error}");
                String::new()
            }
        };

        if !status.success() {
            let message = stderr_text.trim();
            return Err(ExtractorFailure::Rejected(if message.is_empty() {
                format!("yt-dlp termino con estado {status}")
            } else {
                message.to_string()
            }));
        }

        Ok(printed_path)
    }
}

fn header_args(headers: &RequestHeaders) -> Vec<String> {
    let mut args = vec!["--user-agent".to_string(), headers.user_agent.clone()];
    for (name, value) in &headers.extra {
        args.push("--add-header".to_string());
        args.push(format!("{name}:{value}"));
    }
    args
}

fn fetch_args(request: &FetchRequest) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--newline".to_string(),
        "--progress".to_string(),
        "--progress-template".to_string(),
        format!(
            "download:{PROGRESS_MARKER}%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s"
        ),
        "--print".to_string(),
        format!("after_move:{FILEPATH_MARKER}%(filepath)s"),
        "-f".to_string(),
        request.selector.clone(),
        "-o".to_string(),
        request.output_template.clone(),
        "--socket-timeout".to_string(),
        FETCH_SOCKET_TIMEOUT_SECONDS.to_string(),
        "--extractor-args".to_string(),
        "youtube:player_client=android,web;skip=hls".to_string(),
        "--merge-output-format".to_string(),
        "mp4".to_string(),
        "--recode-video".to_string(),
        "mp4".to_string(),
        "--retries".to_string(),
        "2".to_string(),
        "--fragment-retries".to_string(),
        "2".to_string(),
        "--sleep-interval".to_string(),
        "1".to_string(),
        "--max-sleep-interval".to_string(),
        "2".to_string(),
        "--no-write-info-json".to_string(),
        "--no-write-subs".to_string(),
        "--fixup".to_string(),
        "detect_or_warn".to_string(),
    ];
    args.extend(header_args(&request.headers));
    args.push(request.url.clone());
    args
}

fn parse_progress_line(line: &str) -> Option<TransferProgress> {
    let payload = line.trim().strip_prefix(PROGRESS_MARKER)?;
    let mut fields = payload.split('|').map(parse_byte_count);
    let downloaded = fields.next().flatten()?;
    let total = fields.next().flatten();
    let estimate = fields.next().flatten();

    Some(TransferProgress {
        downloaded,
        total: total.or(estimate).filter(|value| *value > 0),
    })
}

fn parse_byte_count(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("NA") || value.eq_ignore_ascii_case("None") {
        return None;
    }
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|number| number as u64))
}

fn parse_filepath_line(line: &str) -> Option<PathBuf> {
    line.trim()
        .strip_prefix(FILEPATH_MARKER)
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Logs whether the extractor and the transcoder can be launched. The
/// service still starts without them.
pub async fn report_tool_availability(binary: &str) {
    let extractor = probe_tool(binary, "--version").await;
    let transcoder = probe_tool("ffmpeg", "-version").await;

    match &extractor {
        Some(version) => info!("{binary} disponible, version {version}"),
        None => warn!("{binary} no esta disponible; las descargas fallaran"),
    }
    match &transcoder {
        Some(version) => info!("ffmpeg disponible: {version}"),
        None => warn!("ffmpeg no esta disponible; la conversion a mp4 fallara"),
    }
}

async fn probe_tool(binary: &str, flag: &str) -> Option<String> {
    let output = Command::new(binary).arg(flag).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

#[cfg(test)]
pub mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;

    /// What the scripted extractor does on one `fetch` call.
    #[derive(Debug, Clone)]
    pub enum FetchOutcome {
        Fail(String),
        /// Never finishes on its own; the caller has to drop the future.
        Stall,
        Produce {
            ext: &'static str,
            bytes: usize,
            progress: Vec<(u64, Option<u64>)>,
        },
    }

    /// Replays canned probe and fetch results and records every fetch call.
    pub struct ScriptedExtractor {
        probe: Result<VideoMetadata, String>,
        outcomes: Mutex<Vec<FetchOutcome>>,
        pub selectors: Arc<Mutex<Vec<String>>>,
        pub headers: Arc<Mutex<Vec<RequestHeaders>>>,
        pub fetched_at: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedExtractor {
        pub fn new(probe: Result<VideoMetadata, String>, outcomes: Vec<FetchOutcome>) -> Self {
            Self {
                probe,
                outcomes: Mutex::new(outcomes),
                selectors: Arc::new(Mutex::new(Vec::new())),
                headers: Arc::new(Mutex::new(Vec::new())),
                fetched_at: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn titled(title: &str, outcomes: Vec<FetchOutcome>) -> Self {
            Self::new(
                Ok(VideoMetadata {
                    title: Some(title.to_string()),
                    duration: Some(125.0),
                    thumbnail: None,
                    formats: Vec::new(),
                }),
                outcomes,
            )
        }
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn probe(
            &self,
            _url: &str,
            _headers: &RequestHeaders,
        ) -> Result<VideoMetadata, ExtractorFailure> {
            self.probe.clone().map_err(ExtractorFailure::Rejected)
        }

        async fn fetch(
            &self,
            request: &FetchRequest,
            progress: &ProgressFn,
        ) -> Result<Option<PathBuf>, ExtractorFailure> {
            self.selectors.lock().push(request.selector.clone());
            self.headers.lock().push(request.headers.clone());
            self.fetched_at.lock().push(Instant::now());
            let outcome = {
                let mut outcomes = self.outcomes.lock();
                if outcomes.is_empty() {
                    FetchOutcome::Fail("ERROR: Requested format is not available".to_string())
                } else {
                    outcomes.remove(0)
                }
            };

            match outcome {
                FetchOutcome::Fail(text) => Err(ExtractorFailure::Rejected(text)),
                FetchOutcome::Stall => {
                    std::future::pending::<()>().await;
                    Err(ExtractorFailure::TimedOut(0))
                }
                FetchOutcome::Produce {
                    ext,
                    bytes,
                    progress: samples,
                } => {
                    for (downloaded, total) in samples {
                        progress(TransferProgress { downloaded, total });
                    }
                    let path = PathBuf::from(request.output_template.replace("%(ext)s", ext));
                    tokio::fs::write(&path, vec![7u8; bytes]).await?;
                    Ok(Some(path))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_with_total() {
        let sample = parse_progress_line("VDPROGRESS|1024|4096|NA").unwrap();
        assert_eq!(
            sample,
            TransferProgress {
                downloaded: 1024,
                total: Some(4096)
            }
        );
    }

    #[test]
    fn progress_line_falls_back_to_estimate() {
        let sample = parse_progress_line("VDPROGRESS|10|NA|2000.5").unwrap();
        assert_eq!(sample.total, Some(2000));
    }

    #[test]
    fn progress_line_without_total() {
        let sample = parse_progress_line("VDPROGRESS|10|NA|NA").unwrap();
        assert_eq!(sample.total, None);
        assert!(parse_progress_line("[download] Destination: x.mp4").is_none());
    }

    #[test]
    fn filepath_line_is_extracted() {
        assert_eq!(
            parse_filepath_line("VDFILE|/tmp/job/Test Video.mp4"),
            Some(PathBuf::from("/tmp/job/Test Video.mp4"))
        );
        assert_eq!(parse_filepath_line("VDFILE|  "), None);
    }

    #[test]
    fn fetch_args_carry_selector_and_headers() {
        let request = FetchRequest {
            url: "https://youtu.be/abc123".to_string(),
            selector: "best[height<=480]".to_string(),
            output_template: "/tmp/job/Test Video.%(ext)s".to_string(),
            headers: RequestHeaders::randomized(),
        };
        let args = fetch_args(&request);
        let selector_at = args.iter().position(|arg| arg == "-f").unwrap();
        assert_eq!(args[selector_at + 1], "best[height<=480]");
        assert!(args.iter().any(|arg| arg.starts_with("Accept-Language:")));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc123"));
    }

    #[test]
    fn metadata_tolerates_missing_fields() {
        let metadata: VideoMetadata =
            serde_json::from_str(r#"{"title": "Test Video", "duration": 125}"#).unwrap();
        assert_eq!(metadata.display_title(), "Test Video");
        assert_eq!(metadata.duration_seconds(), Some(125));
        assert!(metadata.formats.is_empty());
    }

    #[test]
    fn encodings_ignore_fields_the_catalog_does_not_read() {
        let metadata: VideoMetadata = serde_json::from_str(
            r#"{"title": "Test Video", "formats": [
                {"format_id": "137", "ext": "mp4", "height": 1080, "vcodec": "avc1.640028",
                 "acodec": "none", "filesize": 52428800, "tbr": 4400.5},
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(metadata.formats.len(), 2);
        assert_eq!(metadata.formats[0].height, Some(1080));
        assert_eq!(metadata.formats[0].filesize, Some(52_428_800.0));
        assert!(metadata.formats[0].has_video());
        assert!(!metadata.formats[1].has_video());
    }

    #[test]
    fn rejected_failure_keeps_classification() {
        let error: DownloadError =
            ExtractorFailure::Rejected("Sign in to confirm you're not a bot".to_string()).into();
        assert!(error.is_bot_detection());
    }
}
