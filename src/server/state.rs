use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Payload size served by `/test` when no valid `size` is given.
    pub default_payload_size: usize,
    /// Keep a per-request sample log and expose `/save-results`.
    pub record_results: bool,
    pub results_path: PathBuf,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            default_payload_size: 1024 * 1024, // 1MB
            record_results: false,
            results_path: "/results/server-results.json".into(),
        }
    }
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            default_payload_size: config.default_payload_size,
            record_results: config.record_results,
            results_path: config.results_path.clone(),
        }
    }
}

/// One completed `/test` transfer as written by `/save-results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub payload_mb: String,
    pub duration_s: String,
    pub throughput_mbps: String,
    pub timestamp: String,
}

impl ThroughputSample {
    pub fn new(bytes: u64, duration: Duration) -> Self {
        Self {
            payload_mb: format!("{:.2}", bytes as f64 / MIB),
            duration_s: format!("{:.2}", duration.as_secs_f64()),
            throughput_mbps: format!("{:.2}", throughput_mbps(bytes, duration)),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Process-wide counters shared by all handlers of one server.
#[derive(Debug)]
pub struct ServerState {
    started_at: Instant,
    total_bytes_sent: AtomicU64,
    results: Mutex<Vec<ThroughputSample>>,
    options: ServerOptions,
}

impl ServerState {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            started_at: Instant::now(),
            total_bytes_sent: AtomicU64::new(0),
            results: Mutex::new(Vec::new()),
            options,
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn average_throughput_mbps(&self) -> f64 {
        throughput_mbps(self.total_bytes_sent(), self.uptime())
    }

    /// Counts bytes that reached the client without a completed transfer.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.total_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Accounts a finished transfer and, if enabled, keeps a sample of it.
    pub async fn record_transfer(&self, bytes: u64, duration: Duration) {
        self.add_bytes_sent(bytes);
        info!(
            "Sent {} bytes in {:?} ({:.2} MB/s)",
            bytes,
            duration,
            throughput_mbps(bytes, duration)
        );

        if self.options.record_results {
            self.results.lock().await.push(ThroughputSample::new(bytes, duration));
        }
    }

    pub async fn results(&self) -> Vec<ThroughputSample> {
        self.results.lock().await.clone()
    }

    /// Writes all samples as indented JSON to the configured path.
    pub async fn save_results(&self) -> Result<usize, ServerError> {
        let results = self.results.lock().await;
        let data = serde_json::to_string_pretty(&*results)?;

        if let Some(parent) = self.options.results_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.options.results_path, data).await?;

        info!(
            "Saved {} results to {}",
            results.len(),
            self.options.results_path.display()
        );
        Ok(results.len())
    }
}

/// MiB per second; zero when no time has passed.
pub fn throughput_mbps(bytes: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs / MIB
    } else {
        0.0
    }
}
