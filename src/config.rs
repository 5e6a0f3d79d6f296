use std::path::PathBuf;

use tokio::time::Duration;
use tracing::warn;

use crate::catalog::CatalogPolicy;

const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_MAX_ARTIFACT_MB: u64 = 100;
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_SYNC_RETENTION_SECONDS: u64 = 5 * 60;
const DEFAULT_RECORD_RETENTION_SECONDS: u64 = 60 * 60;
const DEFAULT_STALE_RETENTION_SECONDS: u64 = 2 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60 * 60;
const DEFAULT_SUPPORTED_DOMAINS: [&str; 4] = [
    "youtube.com",
    "youtu.be",
    "m.youtube.com",
    "music.youtube.com",
];

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub transfer_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub max_artifact_bytes: u64,
    pub yt_dlp_bin: String,
    pub yt_dlp_timeout: Duration,
    pub sync_retention: Duration,
    pub record_retention: Duration,
    pub stale_retention: Duration,
    pub sweep_interval: Duration,
    pub catalog_policy: CatalogPolicy,
    pub antibot_delays: bool,
    pub supported_domains: Vec<String>,
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            transfer_dir: std::env::temp_dir().join("videodrop"),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_MB * 1024 * 1024,
            yt_dlp_bin: "yt-dlp".to_string(),
            yt_dlp_timeout: Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            sync_retention: Duration::from_secs(DEFAULT_SYNC_RETENTION_SECONDS),
            record_retention: Duration::from_secs(DEFAULT_RECORD_RETENTION_SECONDS),
            stale_retention: Duration::from_secs(DEFAULT_STALE_RETENTION_SECONDS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            catalog_policy: CatalogPolicy::Probed,
            antibot_delays: true,
            supported_domains: DEFAULT_SUPPORTED_DOMAINS
                .iter()
                .map(ToString::to_string)
                .collect(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            bind_addr: resolve_bind_addr().unwrap_or(defaults.bind_addr),
            transfer_dir: read_string_env("TRANSFER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.transfer_dir),
            max_concurrent_downloads: read_u64_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .map(|value| value as usize)
                .unwrap_or(defaults.max_concurrent_downloads),
            max_artifact_bytes: read_u64_env("MAX_ARTIFACT_MB")
                .filter(|value| *value > 0)
                .map(|value| value * 1024 * 1024)
                .unwrap_or(defaults.max_artifact_bytes),
            yt_dlp_bin: read_string_env("YT_DLP_BIN").unwrap_or(defaults.yt_dlp_bin),
            yt_dlp_timeout: read_secs_env("YT_DLP_TIMEOUT_SECS").unwrap_or(defaults.yt_dlp_timeout),
            sync_retention: read_secs_env("SYNC_RETENTION_SECS").unwrap_or(defaults.sync_retention),
            record_retention: read_secs_env("RECORD_RETENTION_SECS")
                .unwrap_or(defaults.record_retention),
            stale_retention: read_secs_env("STALE_RETENTION_SECS")
                .unwrap_or(defaults.stale_retention),
            sweep_interval: read_secs_env("SWEEP_INTERVAL_SECS")
                .filter(|value| !value.is_zero())
                .unwrap_or(defaults.sweep_interval),
            catalog_policy: read_string_env("CATALOG_POLICY")
                .and_then(|value| CatalogPolicy::parse(&value))
                .unwrap_or(defaults.catalog_policy),
            antibot_delays: read_bool_env("ANTIBOT_DELAYS").unwrap_or(defaults.antibot_delays),
            supported_domains: read_list_env("SUPPORTED_DOMAINS")
                .filter(|domains| !domains.is_empty())
                .map(|domains| {
                    domains
                        .into_iter()
                        .map(|domain| domain.to_ascii_lowercase())
                        .collect()
                })
                .unwrap_or(defaults.supported_domains),
            allowed_origins: read_list_env("ALLOWED_ORIGINS").unwrap_or_default(),
        };
        config.with_sweep_after_retention()
    }

    /// The periodic sweep must never reach a directory that a live record or a
    /// pending sync cleanup still points at. A zero stale window disables the
    /// sweep and is kept as is.
    fn with_sweep_after_retention(mut self) -> Self {
        let longest = self.record_retention.max(self.sync_retention);
        if !self.stale_retention.is_zero() && self.stale_retention <= longest {
            let raised = longest * 2;
            warn!(
                "STALE_RETENTION_SECS={} no supera la retencion de descargas; se usa {}",
                self.stale_retention.as_secs(),
                raised.as_secs()
            );
            self.stale_retention = raised;
        }
        self
    }
}

fn resolve_bind_addr() -> Option<String> {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return Some(configured);
    }

    std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .map(|port| format!("0.0.0.0:{port}"))
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_list_env(name: &str) -> Option<Vec<String>> {
    read_string_env(name).map(|value| parse_list(&value))
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn read_secs_env(name: &str) -> Option<Duration> {
    read_u64_env(name).map(Duration::from_secs)
}

fn read_bool_env(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|value| parse_bool(&value))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_values_accept_common_spellings() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn list_values_skip_blank_items() {
        assert_eq!(
            parse_list("youtube.com, ,youtu.be,"),
            vec!["youtube.com".to_string(), "youtu.be".to_string()]
        );
    }

    #[test]
    fn defaults_cap_artifacts_at_one_hundred_megabytes() {
        let config = Config::default();
        assert_eq!(config.max_artifact_bytes, 100 * 1024 * 1024);
        assert_eq!(config.max_concurrent_downloads, 3);
        assert!(config.antibot_delays);
        assert!(config.supported_domains.iter().any(|d| d == "youtu.be"));
    }

    #[test]
    fn default_sweep_outlives_record_retention() {
        let config = Config::default();
        assert!(config.stale_retention > config.record_retention);
        assert!(config.stale_retention > config.sync_retention);
    }

    #[test]
    fn short_stale_window_is_raised_past_retention() {
        let config = Config {
            record_retention: Duration::from_secs(3600),
            stale_retention: Duration::from_secs(3600),
            ..Config::default()
        }
        .with_sweep_after_retention();
        assert_eq!(config.stale_retention, Duration::from_secs(7200));

        let disabled = Config {
            stale_retention: Duration::ZERO,
            ..Config::default()
        }
        .with_sweep_after_retention();
        assert!(disabled.stale_retention.is_zero());

        let longer = Config {
            stale_retention: Duration::from_secs(86_400),
            ..Config::default()
        }
        .with_sweep_after_retention();
        assert_eq!(longer.stale_retention, Duration::from_secs(86_400));
    }
}
