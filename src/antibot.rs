//! Request fingerprint rotation and human-like pauses used around every
//! extractor call.

use tokio::time::Duration;
use tracing::debug;
use uuid::Uuid;

const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Inclusive range of milliseconds to pause.
#[derive(Debug, Clone, Copy)]
pub struct PauseRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

pub const BEFORE_PROBE: PauseRange = PauseRange {
    min_ms: 1_000,
    max_ms: 2_000,
};
pub const BEFORE_DOWNLOAD: PauseRange = PauseRange {
    min_ms: 1_000,
    max_ms: 3_000,
};
pub const BETWEEN_ATTEMPTS: PauseRange = PauseRange {
    min_ms: 2_000,
    max_ms: 4_000,
};
pub const AFTER_BOT_BLOCK: PauseRange = PauseRange {
    min_ms: 5_000,
    max_ms: 10_000,
};

/// Browser-like header set sent with one extractor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub user_agent: String,
    pub extra: Vec<(String, String)>,
}

impl RequestHeaders {
    pub fn randomized() -> Self {
        let index = (random_u64() % USER_AGENTS.len() as u64) as usize;
        Self {
            user_agent: USER_AGENTS[index].to_string(),
            extra: vec![
                (
                    "Accept".to_string(),
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
                ),
                ("Accept-Language".to_string(), "en-us,en;q=0.5".to_string()),
                ("Accept-Encoding".to_string(), "gzip,deflate".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
                ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
            ],
        }
    }
}

/// Randomized sleeps between extractor calls. Disabled pauses return at once.
#[derive(Debug, Clone, Copy)]
pub struct Jitter {
    enabled: bool,
}

impl Jitter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn pick(&self, range: PauseRange) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let span = range.max_ms.saturating_sub(range.min_ms);
        let offset = if span == 0 {
            0
        } else {
            random_u64() % (span + 1)
        };
        Duration::from_millis(range.min_ms + offset)
    }

    pub async fn pause(&self, range: PauseRange) {
        let delay = self.pick(range);
        if delay.is_zero() {
            return;
        }
        debug!("Pausa anti-bot de {} ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}

fn random_u64() -> u64 {
    Uuid::new_v4().as_u64_pair().1
}
