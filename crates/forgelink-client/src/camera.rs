// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Camera availability checker.
//
// The printer's MJPEG server is slow to come up after power-on and drops the
// first connections while it does.  An attempt counts as a success only once
// the stream delivers its first body bytes; a bare TCP accept is not enough.
// Failed attempts are retried with exponential backoff, and the summed waits
// never exceed the configured budget.  The outcome is always a result, never
// an error: an unreachable camera is simply `available = false`.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use forgelink_core::config::CameraConfig;
use forgelink_core::error::{ForgeError, Result};
use forgelink_core::types::{CameraProbeResult, PrinterDescriptor};

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The stream delivered body bytes.
    FirstByte,
    TimedOut,
    /// Nothing listening yet.
    Refused(String),
    Failed(String),
}

impl AttemptOutcome {
    fn describe(&self) -> String {
        match self {
            Self::FirstByte => "first byte received".into(),
            Self::TimedOut => "no data before the attempt deadline".into(),
            Self::Refused(detail) => format!("connection refused: {detail}"),
            Self::Failed(detail) => detail.clone(),
        }
    }
}

/// A single "does the stream answer" check.
pub trait StreamProbe: Send + Sync {
    fn first_byte(&self, url: &str, timeout: Duration) -> impl Future<Output = AttemptOutcome> + Send;
}

/// Probe over plain HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpStreamProbe {
    client: reqwest::Client,
}

impl HttpStreamProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            // Cameras live on the LAN; never route them through a proxy.
            .no_proxy()
            .build()
            .map_err(|e| ForgeError::Config(format!("HTTP client setup: {e}")))?;
        Ok(Self { client })
    }
}

impl StreamProbe for HttpStreamProbe {
    async fn first_byte(&self, url: &str, timeout: Duration) -> AttemptOutcome {
        let attempt = async {
            let mut response = self.client.get(url).send().await.map_err(classify)?;
            if !response.status().is_success() {
                return Err(AttemptOutcome::Failed(format!("HTTP {}", response.status())));
            }
            match response.chunk().await.map_err(classify)? {
                Some(bytes) if !bytes.is_empty() => Ok(()),
                _ => Err(AttemptOutcome::Failed(
                    "stream ended before the first frame".into(),
                )),
            }
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(())) => AttemptOutcome::FirstByte,
            Ok(Err(outcome)) => outcome,
            Err(_) => AttemptOutcome::TimedOut,
        }
    }
}

fn classify(err: reqwest::Error) -> AttemptOutcome {
    if err.is_timeout() {
        AttemptOutcome::TimedOut
    } else if err.is_connect() {
        AttemptOutcome::Refused(err.to_string())
    } else {
        AttemptOutcome::Failed(err.to_string())
    }
}

/// Wait before retrying after attempt `attempt_index` (0-based):
/// `base * 2^attempt_index`.
pub fn backoff_delay(base: Duration, attempt_index: u32) -> Duration {
    base.saturating_mul(1u32 << attempt_index.min(20))
}

/// Checks whether a printer's camera stream is up.
#[derive(Debug, Clone)]
pub struct CameraChecker<P = HttpStreamProbe> {
    probe: P,
    config: CameraConfig,
}

impl CameraChecker<HttpStreamProbe> {
    pub fn http(config: CameraConfig) -> Result<Self> {
        Ok(Self::new(HttpStreamProbe::new()?, config))
    }
}

impl<P: StreamProbe> CameraChecker<P> {
    pub fn new(probe: P, config: CameraConfig) -> Self {
        Self { probe, config }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    fn url(&self, descriptor: &PrinterDescriptor, path: &str) -> String {
        let authority = SocketAddr::new(descriptor.ip_address, self.config.port);
        format!("http://{authority}{path}")
    }

    pub fn stream_url(&self, descriptor: &PrinterDescriptor) -> String {
        self.url(descriptor, &self.config.stream_path)
    }

    pub fn snapshot_url(&self, descriptor: &PrinterDescriptor) -> String {
        self.url(descriptor, &self.config.snapshot_path)
    }

    /// Probe with the configured attempt count and backoff base.
    pub async fn probe_default(&self, descriptor: &PrinterDescriptor) -> CameraProbeResult {
        self.probe(descriptor, self.config.max_attempts, self.config.base_delay)
            .await
    }

    /// Probe the stream up to `max_attempts` times.
    ///
    /// After failed attempt `i` the checker waits `base_delay * 2^i`, clamped
    /// to what is left of `max_total_wait`.  No wait follows the last
    /// attempt.
    #[instrument(skip(self, descriptor), fields(printer = %descriptor.serial_number))]
    pub async fn probe(
        &self,
        descriptor: &PrinterDescriptor,
        max_attempts: u32,
        base_delay: Duration,
    ) -> CameraProbeResult {
        let stream_url = self.stream_url(descriptor);
        let snapshot_url = self.snapshot_url(descriptor);
        let attempts_allowed = max_attempts.max(1);
        let mut budget = self.config.max_total_wait;
        let mut last_failure = None;

        for index in 0..attempts_allowed {
            let started = Instant::now();
            match self
                .probe
                .first_byte(&stream_url, self.config.attempt_timeout)
                .await
            {
                AttemptOutcome::FirstByte => {
                    let latency = started.elapsed();
                    info!(
                        attempt = index + 1,
                        latency_ms = latency.as_millis() as u64,
                        "camera stream available"
                    );
                    return CameraProbeResult {
                        stream_url,
                        snapshot_url,
                        available: true,
                        attempts: index + 1,
                        last_latency_ms: Some(latency.as_millis() as u64),
                        last_failure: None,
                    };
                }
                failure => {
                    debug!(attempt = index + 1, outcome = ?failure, "camera attempt failed");
                    last_failure = Some(failure.describe());
                }
            }

            if index + 1 < attempts_allowed {
                let wait = backoff_delay(base_delay, index).min(budget);
                budget = budget.saturating_sub(wait);
                tokio::time::sleep(wait).await;
            }
        }

        warn!(attempts = attempts_allowed, url = %stream_url, "camera stream unavailable");
        CameraProbeResult {
            stream_url,
            snapshot_url,
            available: false,
            attempts: attempts_allowed,
            last_latency_ms: None,
            last_failure,
        }
    }
}
