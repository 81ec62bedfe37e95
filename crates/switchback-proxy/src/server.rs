//! Axum HTTP listener.
//!
//! Every method and path is forwarded through [`Proxy::forward`]; there are no
//! local endpoints. Hyper drops the handler future when the caller closes the
//! connection, which cancels the chain walk along with any in-flight attempt.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::ProxyError;
use crate::proxy::{Proxy, ProxyOutcome, ProxyRequest, RelayedResponse, ResponseBody};

/// A bound listener that has not started accepting yet.
pub struct BoundServer {
    listener: TcpListener,
    router: Router,
    pub addr: SocketAddr,
}

impl BoundServer {
    /// Base URL a client should be pointed at.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Accept connections until `shutdown` resolves, then drain in-flight
    /// requests.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> io::Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Bind `host:port` (port 0 picks an ephemeral port).
pub async fn bind(
    proxy: Arc<Proxy>,
    host: &str,
    port: u16,
    max_body_bytes: usize,
) -> Result<BoundServer, ProxyError> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ProxyError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let bound = listener
        .local_addr()
        .map_err(|source| ProxyError::Bind { addr, source })?;
    info!(addr = %bound, "switchback listening");

    Ok(BoundServer {
        listener,
        router: router(proxy, max_body_bytes),
        addr: bound,
    })
}

/// Catch-all router; bodies over `max_body_bytes` are answered with 413.
pub fn router(proxy: Arc<Proxy>, max_body_bytes: usize) -> Router {
    Router::new()
        .fallback(handle)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(proxy)
}

async fn handle(
    State(proxy): State<Arc<Proxy>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = ProxyRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().filter(|q| !q.is_empty()).map(str::to_string),
        headers,
        body,
    };

    match proxy.forward(request).await {
        ProxyOutcome::Relayed(response) => into_response(response),
        ProxyOutcome::Exhausted(failures) => (
            ProxyOutcome::EXHAUSTED_STATUS,
            [(header::CONTENT_TYPE, "application/json")],
            ProxyOutcome::exhausted_body(&failures),
        )
            .into_response(),
    }
}

fn into_response(relayed: RelayedResponse) -> Response {
    let body = match relayed.body {
        ResponseBody::Buffered(bytes) => Body::from(bytes),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };

    let mut response = Response::new(body);
    *response.status_mut() = relayed.status;
    *response.headers_mut() = relayed.headers;
    response
}
