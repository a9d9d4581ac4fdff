//! Load-test client: pulls a payload from the traffic server through a
//! [`Connection`] and measures what arrives.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::config::ProbeConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::server::throughput_mbps;
use crate::socket::SocketOptions;

#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    /// Headers and body.
    pub total_bytes: u64,
    pub payload_bytes: u64,
    pub elapsed: Duration,
}

impl ProbeReport {
    /// Payload throughput in MB/s.
    pub fn throughput_mbps(&self) -> f64 {
        throughput_mbps(self.payload_bytes, self.elapsed)
    }
}

/// Aggregate over all probe runs of one process.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSummary {
    pub total_bytes_received: u64,
    pub test_duration: f64,
    pub avg_throughput: f64,
}

impl ProbeSummary {
    pub fn new(total_bytes_received: u64, duration: Duration) -> Self {
        Self {
            total_bytes_received,
            test_duration: duration.as_secs_f64(),
            avg_throughput: throughput_mbps(total_bytes_received, duration),
        }
    }
}

/// Tells header bytes from body bytes of an HTTP/1.1 response read in pieces.
#[derive(Debug, Default)]
struct BodySplitter {
    header: Vec<u8>,
    in_body: bool,
}

impl BodySplitter {
    /// Returns how many bytes of `chunk` belong to the body.
    fn feed(&mut self, chunk: &[u8]) -> usize {
        if self.in_body {
            return chunk.len();
        }

        // the terminator may straddle the previous chunk
        let search_from = self.header.len().saturating_sub(3);
        self.header.extend_from_slice(chunk);

        match self.header[search_from..]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            Some(pos) => {
                let body_start = search_from + pos + 4;
                let body = self.header.len() - body_start;
                self.in_body = true;
                self.header.clear();
                body
            }
            None => 0,
        }
    }
}

pub fn request(host: &str, size: usize) -> String {
    format!("GET /test?size={size} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n")
}

/// Connects to `config.target`, downloads one payload and closes again.
pub async fn run_probe(config: &ProbeConfig) -> Result<ProbeReport> {
    let mut conn = Connection::connect(&config.target).await?;
    let report = drive(&mut conn, config).await;
    conn.close();
    report
}

/// Runs the download on an established connection. The connection is left open.
pub async fn drive<S>(conn: &mut Connection<S>, config: &ProbeConfig) -> Result<ProbeReport>
where
    S: AsyncRead + AsyncWrite + SocketOptions + Unpin,
{
    if let Some(size) = config.receive_buffer {
        conn.set_receive_buffer(size)?;
    }
    if let Some(limit) = config.bandwidth_limit {
        conn.set_bandwidth_limit(limit)?;
    }

    conn.write(request(&config.host_header, config.payload_size).as_bytes())
        .await?;

    let mut splitter = BodySplitter::default();
    let mut total_bytes = 0u64;
    let mut payload_bytes = 0u64;
    let start = Instant::now();

    loop {
        let data = match config.delay_ms {
            Some(delay) => conn.read_with_delay(config.read_size, delay).await?,
            None => conn.read_throttled(config.read_size).await?,
        };
        if data.is_empty() {
            break;
        }

        total_bytes += data.len() as u64;
        payload_bytes += splitter.feed(&data) as u64;
    }

    let report = ProbeReport {
        total_bytes,
        payload_bytes,
        elapsed: start.elapsed(),
    };
    debug!(?report, "Probe finished");
    info!(
        "TCP throttled: {} bytes payload ({} total) in {:.2}s ({:.2} MB/s)",
        report.payload_bytes,
        report.total_bytes,
        report.elapsed.as_secs_f64(),
        report.throughput_mbps()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ServerOptions, TrafficServer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::test;

    fn spawn_server() -> String {
        let server = TrafficServer::bind("127.0.0.1:0".parse().unwrap(), ServerOptions::default())
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run(std::future::pending()));
        addr.to_string()
    }

    #[test]
    async fn test_splitter_handles_split_terminator() {
        let mut splitter = BodySplitter::default();
        assert_eq!(splitter.feed(b"HTTP/1.1 200 OK\r\nA: b\r"), 0);
        assert_eq!(splitter.feed(b"\n\r"), 0);
        assert_eq!(splitter.feed(b"\nbody"), 4);
        assert_eq!(splitter.feed(b"more"), 4);
    }

    #[test]
    async fn test_splitter_terminator_in_single_chunk() {
        let mut splitter = BodySplitter::default();
        assert_eq!(splitter.feed(b"HTTP/1.1 200 OK\r\n\r\n12345"), 5);
    }

    #[test]
    async fn test_drive_over_in_memory_stream() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut request = [0u8; 1024];
            let n = server.read(&mut request).await.unwrap();
            assert!(request[..n].starts_with(b"GET /test?size="));
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc")
                .await
                .unwrap();
        });

        let mut conn = Connection::from_stream(client);
        let config = ProbeConfig {
            bandwidth_limit: None,
            ..Default::default()
        };
        let report = drive(&mut conn, &config).await.unwrap();
        assert_eq!(report.payload_bytes, 3);
        assert_eq!(report.total_bytes, 41);
    }

    #[test]
    async fn test_probe_against_traffic_server() {
        let config = ProbeConfig {
            target: spawn_server(),
            payload_size: 100_000,
            bandwidth_limit: None,
            receive_buffer: Some(64 * 1024),
            ..Default::default()
        };

        let report = run_probe(&config).await.unwrap();
        assert_eq!(report.payload_bytes, 100_000);
        assert!(report.total_bytes > report.payload_bytes);
    }

    #[test]
    async fn test_throttled_probe_respects_limit() {
        let config = ProbeConfig {
            target: spawn_server(),
            payload_size: 150_000,
            bandwidth_limit: Some(100_000),
            ..Default::default()
        };

        let report = run_probe(&config).await.unwrap();
        assert_eq!(report.payload_bytes, 150_000);
        // the first window opens before the request is written
        assert!(report.elapsed >= Duration::from_millis(900), "{:?}", report.elapsed);
    }

    #[test]
    async fn test_probe_unreachable_target() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ProbeConfig {
            target,
            ..Default::default()
        };
        assert!(matches!(
            run_probe(&config).await.unwrap_err(),
            crate::error::Error::Connect { .. }
        ));
    }
}
