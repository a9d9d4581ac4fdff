use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::ServerError;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub probe: ProbeConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub default_payload_size: usize,
    pub record_results: bool,
    pub results_path: PathBuf,
}

/// Settings of the load-test client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// `host:port` of the traffic server.
    pub target: String,
    pub host_header: String,
    pub payload_size: usize,
    /// Bytes per second; unthrottled when absent.
    pub bandwidth_limit: Option<u64>,
    pub receive_buffer: Option<usize>,
    pub read_size: usize,
    /// Extra latency per read; switches the probe to delayed reads.
    pub delay_ms: Option<u64>,
    pub iterations: u32,
    pub summary_path: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self, ServerError> {
        // CONFIG_PATH takes precedence over the built-in defaults
        if let Ok(config_path) = std::env::var("CONFIG_PATH") {
            return Self::from_file(&config_path);
        }

        Ok(Self::default())
    }

    pub fn from_file(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ServerError> {
        toml::from_str(content).map_err(|e| ServerError::Config(e.to_string()))
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid listen address: {}", e)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            default_payload_size: 1024 * 1024, // 1MB
            record_results: false,
            results_path: "/results/server-results.json".into(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: "127.0.0.1:8080".to_string(),
            host_header: "server".to_string(),
            payload_size: 1024 * 1024,
            bandwidth_limit: Some(500 * 1024),
            receive_buffer: None,
            read_size: 8192,
            delay_ms: None,
            iterations: 1,
            summary_path: None,
        }
    }
}
