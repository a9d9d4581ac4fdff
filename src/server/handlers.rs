use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::Sender;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use tracing::{debug, error, warn};

use super::state::ServerState;
use crate::error::ServerError;

/// Size of the body chunks `/test` hands to hyper. A multiple of 256 so every
/// chunk starts at the beginning of the byte pattern.
const STREAM_CHUNK: usize = 64 * 1024;

#[async_trait]
pub trait RouteHandler: Send + Sync {
    fn name(&self) -> &str;
    fn can_handle(&self, path: &str) -> bool;
    async fn handle(
        &self,
        req: Request<Body>,
        state: Arc<ServerState>,
    ) -> Result<Response<Body>, ServerError>;
}

/// Deterministic test payload: byte `i` is `i % 256`.
pub fn payload(size: usize) -> Bytes {
    (0..size).map(|i| (i % 256) as u8).collect::<Vec<u8>>().into()
}

/// `GET /test?size=<bytes>`
pub struct PayloadHandler;

impl PayloadHandler {
    fn requested_size(req: &Request<Body>, default: usize) -> usize {
        req.uri()
            .query()
            .and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == "size")
                    .and_then(|(_, value)| value.parse::<usize>().ok())
            })
            .unwrap_or(default)
    }

    async fn stream_payload(mut sender: Sender, size: usize, state: Arc<ServerState>) {
        let pattern = payload(STREAM_CHUNK.min(size));
        let start = Instant::now();
        let mut sent = 0;

        while sent < size {
            let len = (size - sent).min(STREAM_CHUNK);
            if let Err(e) = sender.send_data(pattern.slice(..len)).await {
                warn!("Client went away after {} of {} bytes: {}", sent, size, e);
                state.add_bytes_sent(sent as u64);
                return;
            }
            sent += len;
        }

        state.record_transfer(sent as u64, start.elapsed()).await;
    }
}

#[async_trait]
impl RouteHandler for PayloadHandler {
    fn name(&self) -> &str {
        "payload"
    }

    fn can_handle(&self, path: &str) -> bool {
        path == "/test"
    }

    async fn handle(
        &self,
        req: Request<Body>,
        state: Arc<ServerState>,
    ) -> Result<Response<Body>, ServerError> {
        let size = Self::requested_size(&req, state.options().default_payload_size);
        debug!("Serving {} byte payload", size);

        let response = Response::builder()
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(Body::empty())?;

        let (sender, body) = Body::channel();
        tokio::spawn(Self::stream_payload(sender, size, state));

        Ok(response.map(|_| body))
    }
}

/// `GET /metrics`
pub struct MetricsHandler;

#[async_trait]
impl RouteHandler for MetricsHandler {
    fn name(&self) -> &str {
        "metrics"
    }

    fn can_handle(&self, path: &str) -> bool {
        path == "/metrics"
    }

    async fn handle(
        &self,
        _req: Request<Body>,
        state: Arc<ServerState>,
    ) -> Result<Response<Body>, ServerError> {
        let text = format!(
            "Total bytes sent: {}\nUptime: {:?}\nAverage throughput: {:.2} MB/s\n",
            state.total_bytes_sent(),
            state.uptime(),
            state.average_throughput_mbps(),
        );

        Ok(Response::builder()
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from(text))?)
    }
}

/// `GET /save-results`, only mounted when result recording is enabled.
pub struct SaveResultsHandler;

#[async_trait]
impl RouteHandler for SaveResultsHandler {
    fn name(&self) -> &str {
        "save-results"
    }

    fn can_handle(&self, path: &str) -> bool {
        path == "/save-results"
    }

    async fn handle(
        &self,
        _req: Request<Body>,
        state: Arc<ServerState>,
    ) -> Result<Response<Body>, ServerError> {
        match state.save_results().await {
            Ok(_) => Ok(Response::new(Body::from("Results saved"))),
            Err(e) => {
                error!("Failed to save results: {}", e);
                Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from(e.to_string()))?)
            }
        }
    }
}
