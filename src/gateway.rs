//! Per-application reverse proxy listener.
//!
//! Every configured app gets one listening socket. Forwarding apps record
//! demand from inbound traffic, gate on tunnel readiness, and forward plain
//! HTTP through the pooled backend client or WebSockets frame by frame.
//! The control app routes to the status/shutdown surface instead.

use crate::client::BackendClient;
use crate::error::{json_error_response, GatewayErrorCode};
use crate::state::{GlobalState, ProxyState};
use crate::status;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

/// Everything a request handler needs for one application.
pub struct ProxyApp {
    pub name: String,
    pub proxy: Arc<ProxyState>,
    pub global: Arc<GlobalState>,
    /// None for the control app
    pub backend: Option<BackendClient>,
    /// Path prefixes that must not wake the pod
    pub dont_wake_paths: Vec<String>,
}

/// One listening reverse-proxy server for one application.
pub struct GatewayServer {
    bind_addr: SocketAddr,
    app: Arc<ProxyApp>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, app: Arc<ProxyApp>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            app,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, app = %self.app.name, "Proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let app = Arc::clone(&self.app);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, app).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(app = %self.app.name, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, app: Arc<ProxyApp>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let app = Arc::clone(&app);
        async move { handle_request(req, app).await }
    });

    // serve_connection_with_upgrades keeps WebSocket upgrades working on
    // HTTP/1.1 connections
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    app: Arc<ProxyApp>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if app.proxy.is_control() {
        return status::handle_control_request(req, Arc::clone(&app.global)).await;
    }

    let path = req.uri().path().to_string();
    let is_ws = is_websocket_request(&req);
    let wake = !app
        .dont_wake_paths
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()));

    // WebSocket connections never wake the pod on their own: a stray
    // reconnect attempt while intentionally idle must not cost a cold start
    if !is_ws && wake {
        if app.proxy.record_web_activity() {
            info!(app = %app.name, "web activity detected, starting pod");
        }
        debug!(app = %app.name, %path, "Web activity");
    }

    // Readiness gate: while the tunnel is down there is nothing to reach
    if !app.global.ssh_running() {
        return Ok(status::starting_page(&app.name));
    }

    if is_ws {
        return handle_upgrade(req, app).await;
    }

    let backend = app
        .backend
        .as_ref()
        .expect("forwarding app always has a backend client");

    match backend.forward(req).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(app = %app.name, error = %e, "Failed to forward request to backend");
            Ok(json_error_response(
                GatewayErrorCode::ConnectionFailed,
                "Bad Gateway - Connection error",
            ))
        }
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_websocket_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let is_websocket_upgrade = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    req.method() == hyper::Method::GET && has_upgrade_connection && is_websocket_upgrade
}

fn derive_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Handle a WebSocket upgrade: accept the client side, open a matching
/// upgrade to the backend, then forward frames in both directions until
/// either side closes.
async fn handle_upgrade(
    req: Request<Incoming>,
    app: Arc<ProxyApp>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let key = match req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
    {
        Some(k) => k.to_string(),
        None => {
            return Ok(json_error_response(
                GatewayErrorCode::BadUpgradeRequest,
                "Missing Sec-WebSocket-Key header",
            ));
        }
    };

    let remote_port = app
        .backend
        .as_ref()
        .expect("forwarding app always has a backend client")
        .remote_port();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let cookie = req.headers().get(hyper::header::COOKIE).cloned();

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::UPGRADE, "websocket")
        .header(hyper::header::CONNECTION, "Upgrade")
        .header("sec-websocket-accept", derive_accept_key(&key))
        .body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers");

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(app = %app.name, error = %e, "Failed to upgrade client connection");
                return;
            }
        };

        let mut client_ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        debug!(app = %app.name, "Client WebSocket connection established");

        let backend_ws = match connect_backend_ws(remote_port, &path, cookie).await {
            Ok(ws) => ws,
            Err(e) => {
                // Close the client socket cleanly rather than dropping it
                error!(app = %app.name, error = %e, "Failed to connect to backend WebSocket");
                let _ = client_ws.close(None).await;
                return;
            }
        };
        info!(app = %app.name, %path, "Backend WebSocket connection established");

        forward_frames(client_ws, backend_ws, Arc::clone(&app.proxy)).await;
        debug!(app = %app.name, "WebSocket session ended");
    });

    Ok(response)
}

async fn connect_backend_ws(
    remote_port: u16,
    path: &str,
    cookie: Option<hyper::header::HeaderValue>,
) -> anyhow::Result<WebSocketStream<TcpStream>> {
    let backend_addr = format!("127.0.0.1:{}", remote_port);
    let stream = TcpStream::connect(&backend_addr).await?;

    let url = format!("ws://{}{}", backend_addr, path);
    let mut request = url.into_client_request()?;
    if let Some(cookie) = cookie {
        let value =
            tokio_tungstenite::tungstenite::http::HeaderValue::from_bytes(cookie.as_bytes())?;
        request.headers_mut().insert("cookie", value);
    }

    let (ws, _response) = tokio_tungstenite::client_async(request, stream).await?;
    Ok(ws)
}

/// Run bidirectional frame forwarding. The first direction to finish
/// cancels the other (the select drops its future), which matches the
/// teardown requirement: a close on either side ends the session.
async fn forward_frames<S1, S2>(
    client_ws: WebSocketStream<S1>,
    backend_ws: WebSocketStream<S2>,
    proxy: Arc<ProxyState>,
) where
    S1: AsyncRead + AsyncWrite + Unpin,
    S2: AsyncRead + AsyncWrite + Unpin,
{
    let (client_tx, client_rx) = client_ws.split();
    let (backend_tx, backend_rx) = backend_ws.split();

    let client_to_backend =
        forward_direction(client_rx, backend_tx, Arc::clone(&proxy), "client->backend");
    let backend_to_client =
        forward_direction(backend_rx, client_tx, Arc::clone(&proxy), "backend->client");

    tokio::select! {
        _ = client_to_backend => debug!("client->backend direction ended"),
        _ = backend_to_client => debug!("backend->client direction ended"),
    }
}

async fn forward_direction<R, W>(
    mut rx: futures::stream::SplitStream<WebSocketStream<R>>,
    mut tx: futures::stream::SplitSink<WebSocketStream<W>, Message>,
    proxy: Arc<ProxyState>,
    direction: &'static str,
) where
    R: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(result) = rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!(direction, error = %e, "WebSocket stream error");
                break;
            }
        };

        // Every received frame counts as activity
        proxy.touch();

        match msg {
            Message::Close(frame) => {
                debug!(direction, "Forwarding close frame");
                let _ = tx.send(Message::Close(frame)).await;
                return;
            }
            // Raw frames are not surfaced by the protocol layer in this mode
            Message::Frame(_) => {}
            msg => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = tx.close().await;
}
