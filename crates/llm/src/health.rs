use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Liveness of the primary service as seen by one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrimaryStatus {
    Up,
    Down,
}

impl PrimaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryStatus::Up => "UP",
            PrimaryStatus::Down => "DOWN",
        }
    }
}

impl fmt::Display for PrimaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answers "is the primary reachable right now?". Failures never escape:
/// anything that is not a timely success is `Down`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> PrimaryStatus;

    /// Result of the most recent check, `None` before the first one.
    fn last_status(&self) -> Option<PrimaryStatus>;

    fn checks_performed(&self) -> u64;

    fn failures_observed(&self) -> u64;
}

const STATUS_UP: u8 = 1;
const STATUS_DOWN: u8 = 2;

/// Counters shared by probe implementations.
#[derive(Debug, Default)]
pub struct ProbeCounters {
    /// 0 until the first check
    last: AtomicU8,
    checks: AtomicU64,
    failures: AtomicU64,
}

impl ProbeCounters {
    pub fn record(&self, status: PrimaryStatus) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let code = match status {
            PrimaryStatus::Up => STATUS_UP,
            PrimaryStatus::Down => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                STATUS_DOWN
            }
        };
        self.last.store(code, Ordering::Release);
    }

    pub fn last(&self) -> Option<PrimaryStatus> {
        match self.last.load(Ordering::Acquire) {
            STATUS_UP => Some(PrimaryStatus::Up),
            STATUS_DOWN => Some(PrimaryStatus::Down),
            _ => None,
        }
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// GETs the primary's liveness route; a 2xx within the timeout means `Up`.
pub struct HttpHealthProbe {
    url: String,
    client: Client,
    timeout: Duration,
    counters: ProbeCounters,
}

impl HttpHealthProbe {
    /// `timeout` is capped by the caller's configuration (at most 5 s).
    pub fn new(url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.to_string(),
            client,
            timeout,
            counters: ProbeCounters::default(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn check(&self) -> PrimaryStatus {
        let start = Instant::now();
        let request = self.client.get(&self.url).send();

        let status = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) if response.status().is_success() => PrimaryStatus::Up,
            Ok(Ok(response)) => {
                warn!("Primary health check returned {}", response.status());
                PrimaryStatus::Down
            }
            Ok(Err(e)) => {
                warn!("Primary health check failed: {}", e);
                PrimaryStatus::Down
            }
            Err(_) => {
                warn!("Primary health check timed out after {:?}", self.timeout);
                PrimaryStatus::Down
            }
        };

        debug!(
            "Primary is {} (checked in {}ms)",
            status,
            start.elapsed().as_millis()
        );
        self.counters.record(status);
        status
    }

    fn last_status(&self) -> Option<PrimaryStatus> {
        self.counters.last()
    }

    fn checks_performed(&self) -> u64 {
        self.counters.checks()
    }

    fn failures_observed(&self) -> u64 {
        self.counters.failures()
    }
}
