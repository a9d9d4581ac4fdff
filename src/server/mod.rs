//! HTTP traffic source used to feed throttled connections during load tests.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

use crate::error::ServerError;

mod handlers;
mod state;

pub use handlers::{payload, MetricsHandler, PayloadHandler, RouteHandler, SaveResultsHandler};
pub use state::{throughput_mbps, ServerOptions, ServerState, ThroughputSample};

pub struct TrafficServer {
    listener: std::net::TcpListener,
    state: Arc<ServerState>,
    handlers: Vec<Arc<dyn RouteHandler>>,
}

impl TrafficServer {
    /// Binds the listening socket and mounts the default routes.
    pub fn bind(addr: SocketAddr, options: ServerOptions) -> Result<Self, ServerError> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("Traffic server bound to {}", listener.local_addr()?);

        let mut handlers: Vec<Arc<dyn RouteHandler>> =
            vec![Arc::new(PayloadHandler), Arc::new(MetricsHandler)];
        if options.record_results {
            handlers.push(Arc::new(SaveResultsHandler));
        }

        Ok(Self {
            listener,
            state: Arc::new(ServerState::new(options)),
            handlers,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn add_handler(&mut self, handler: Arc<dyn RouteHandler>) {
        info!("Adding new handler: {}", handler.name());
        self.handlers.push(handler);
    }

    /// Serves requests until `shutdown` resolves, then drains open connections.
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            state,
            handlers,
        } = self;
        debug!("Registered handlers: {}", handlers.len());
        let handlers = Arc::new(handlers);

        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let remote_addr = conn.remote_addr();
            debug!("New connection from: {}", remote_addr);

            let handlers = handlers.clone();
            let state = state.clone();

            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    debug!("Received request from {}: {} {}", remote_addr, req.method(), req.uri());
                    Self::handle_request(req, handlers.clone(), state.clone())
                }))
            }
        });

        let server = Server::from_tcp(listener)?
            .serve(make_svc)
            .with_graceful_shutdown(shutdown);
        info!("Traffic server is ready to accept connections");

        if let Err(e) = server.await {
            error!("Server error: {}", e);
            return Err(ServerError::Http(e));
        }

        info!("Traffic server stopped");
        Ok(())
    }

    async fn handle_request(
        req: Request<Body>,
        handlers: Arc<Vec<Arc<dyn RouteHandler>>>,
        state: Arc<ServerState>,
    ) -> Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();

        let Some(handler) = handlers.iter().find(|h| h.can_handle(&path)).cloned() else {
            warn!("No handler found for request: {}", path);
            return Ok(status_response(StatusCode::NOT_FOUND, "404 page not found"));
        };

        match handler.handle(req, state).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Handler {} failed: {}", handler.name(), e);
                Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
            }
        }
    }
}

fn status_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}
