//! Outbound HTTP client for one forwarding application.
//!
//! Each application gets its own pooled client at startup, pointed at the
//! local end of the SSH port-forward for that app's remote port. Hop-by-hop
//! headers are stripped in both directions; everything else passes through
//! verbatim.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

/// Headers that must not be forwarded in either direction.
pub const HOP_BY_HOP_HEADERS: [&str; 5] = [
    "content-encoding",
    "content-length",
    "connection",
    "upgrade",
    "transfer-encoding",
];

/// Error type for backend forwarding
#[derive(Debug)]
pub enum BackendError {
    /// Error from the HTTP client (connect failure, broken transfer)
    Client(hyper_util::client::legacy::Error),
    /// Error building the outbound request
    RequestBuild(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Client(e) => write!(f, "Client error: {}", e),
            BackendError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<hyper_util::client::legacy::Error> for BackendError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        BackendError::Client(err)
    }
}

fn is_hop_by_hop(name: &hyper::header::HeaderName) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// A pooled HTTP client bound to one backend port.
pub struct BackendClient {
    client: Client<HttpConnector, Incoming>,
    remote_port: u16,
}

impl BackendClient {
    /// One client session per application, opened at startup and reused for
    /// the process lifetime.
    pub fn new(remote_port: u16) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .build(connector);

        debug!(remote_port, "Backend client initialized");

        Self {
            client,
            remote_port,
        }
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Forward a request to `http://127.0.0.1:{remote_port}{path}` and
    /// return the backend's response with hop-by-hop headers removed.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, BackendError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", self.remote_port, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| BackendError::RequestBuild(e.to_string()))?;

        let response = self.client.request(backend_req).await?;

        let (mut parts, body) = response.into_parts();
        let drop: Vec<_> = parts
            .headers
            .keys()
            .filter(|name| is_hop_by_hop(name))
            .cloned()
            .collect();
        for name in drop {
            parts.headers.remove(name);
        }

        Ok(Response::from_parts(parts, body.boxed()))
    }
}
