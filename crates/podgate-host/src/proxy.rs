//! Hash-addressed reverse proxy
//!
//! Requests whose first path segment is a pod label are sent to that pod
//! instead of the API routes. Plain HTTP goes through reqwest. Upgrade
//! requests (WebSocket) get a fresh backend connection, and once both sides
//! have switched protocols the two sockets are spliced.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use podgate_common::label::is_label_char;
use podgate_common::{PodRegistry, LABEL_LEN};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::ApiError;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// True if the first path segment is a pod label followed by `/`, `?` or
/// the end of the path
pub fn is_pod_request(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    let bytes = rest.as_bytes();
    bytes.len() >= LABEL_LEN
        && bytes[..LABEL_LEN].iter().copied().all(is_label_char)
        && matches!(bytes.get(LABEL_LEN), None | Some(b'/') | Some(b'?'))
}

/// Label addressed by `path`, if any
pub fn pod_label(path: &str) -> Option<&str> {
    if is_pod_request(path) {
        path.get(1..=LABEL_LEN)
    } else {
        None
    }
}

/// Path and query to request from the pod: `path_and_query` without the
/// leading `/<label>`
pub fn strip_label(path_and_query: &str) -> String {
    let rest = path_and_query.get(LABEL_LEN + 1..).unwrap_or("");
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

/// Forwards pod traffic to the backend registered for its label
pub struct PodProxy {
    registry: Arc<dyn PodRegistry>,
    client: reqwest::Client,
    connect_timeout: Duration,
    max_body_bytes: usize,
}

impl PodProxy {
    pub fn new(registry: Arc<dyn PodRegistry>, config: &ProxyConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            registry,
            client,
            connect_timeout: config.connect_timeout(),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Backend address for `label`
    pub async fn target(&self, label: &str) -> Result<Option<SocketAddr>, ApiError> {
        Ok(self.registry.get(label).await?.map(|pod| pod.target()))
    }

    /// Forward a plain HTTP request and stream the response back
    pub async fn forward(&self, target: SocketAddr, req: Request) -> Result<Response, ApiError> {
        let (parts, body) = req.into_parts();
        let url = format!("http://{}{}", target, strip_label(path_and_query(&parts.uri)));

        let body = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| ApiError::BadInput(format!("request body rejected: {}", e)))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(&e, target))?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Forward an upgrade handshake. On `101` from the pod the client's and
    /// the pod's upgraded connections are spliced on a separate task.
    pub async fn forward_upgrade(&self, target: SocketAddr, mut req: Request) -> Result<Response, ApiError> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _body) = req.into_parts();
        let uri: Uri = strip_label(path_and_query(&parts.uri))
            .parse()
            .map_err(|e| ApiError::BadInput(format!("invalid pod path: {}", e)))?;

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_error(&e, target)),
            Err(_) => {
                return Err(ApiError::GatewayTimeout(format!(
                    "timed out connecting to pod. target={}",
                    target
                )))
            }
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(stream))
            .await
            .map_err(|e| ApiError::BadGateway(format!("pod handshake failed. target={}: {}", target, e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(%target, error = %e, "pod connection closed");
            }
        });

        let mut backend_req = Request::new(Body::empty());
        *backend_req.method_mut() = parts.method;
        *backend_req.uri_mut() = uri;
        *backend_req.headers_mut() = parts.headers;
        if let Ok(host) = HeaderValue::from_str(&target.to_string()) {
            backend_req.headers_mut().insert(header::HOST, host);
        }

        let mut backend_res = sender
            .send_request(backend_req)
            .await
            .map_err(|e| ApiError::BadGateway(format!("error forwarding to pod. target={}: {}", target, e)))?;

        if backend_res.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Ok(backend_res.map(Body::new));
        }

        let backend_upgrade = hyper::upgrade::on(&mut backend_res);
        tokio::spawn(splice(client_upgrade, backend_upgrade, target));

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = backend_res.headers().clone();
        Ok(response)
    }
}

/// Middleware routing pod traffic ahead of the API routes
pub async fn proxy_filter(State(proxy): State<Arc<PodProxy>>, req: Request, next: Next) -> Response {
    let Some(label) = pod_label(path_and_query(req.uri())).map(str::to_string) else {
        return next.run(req).await;
    };
    let upgrade = is_upgrade_request(req.headers());

    let target = match proxy.target(&label).await {
        Ok(Some(target)) => target,
        Ok(None) if upgrade => {
            debug!(hash = %label, "upgrade for unknown pod");
            return bare_bad_gateway();
        }
        Ok(None) => {
            return ApiError::NotFound(format!("no pod with that hash found. hash={}", label))
                .into_response()
        }
        Err(e) => return e.into_response(),
    };

    debug!(hash = %label, %target, upgrade, "proxying to pod");
    let result = if upgrade {
        proxy.forward_upgrade(target, req).await
    } else {
        proxy.forward(target, req).await
    };

    result.unwrap_or_else(|e| {
        warn!(hash = %label, %target, error = %e, "proxy error");
        e.into_response()
    })
}

async fn splice(client: OnUpgrade, backend: OnUpgrade, target: SocketAddr) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%target, error = %e, "upgrade failed");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_pod, from_pod)) => debug!(%target, to_pod, from_pod, "websocket session closed"),
        Err(e) if is_benign_teardown(&e) => debug!(%target, error = %e, "websocket peer hung up"),
        Err(e) => warn!(%target, error = %e, "error in websocket proxy"),
    }
}

fn is_benign_teardown(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| uri.path())
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && connection_tokens(headers).any(|t| t.eq_ignore_ascii_case("upgrade"))
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = connection_tokens(headers)
        .filter_map(|t| HeaderName::from_bytes(t.as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Minimal response for an upgrade that has nowhere to go
fn bare_bad_gateway() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

fn connect_error(e: &io::Error, target: SocketAddr) -> ApiError {
    match e.kind() {
        io::ErrorKind::TimedOut => ApiError::GatewayTimeout(format!("timed out connecting to pod. target={}", target)),
        io::ErrorKind::ConnectionRefused => ApiError::Unavailable(format!("pod refused connection. target={}", target)),
        _ => ApiError::BadGateway(format!("could not connect to pod. target={}: {}", target, e)),
    }
}

fn transport_error(err: &reqwest::Error, target: SocketAddr) -> ApiError {
    let kind = io_error_kind(err);
    if err.is_timeout() || kind == Some(io::ErrorKind::TimedOut) {
        ApiError::GatewayTimeout(format!("pod timed out. target={}", target))
    } else if kind == Some(io::ErrorKind::ConnectionRefused) {
        ApiError::Unavailable(format!("pod refused connection. target={}", target))
    } else {
        ApiError::BadGateway(format!("error forwarding to pod. target={}: {}", target, err))
    }
}

fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            return Some(io.kind());
        }
        source = e.source();
    }
    None
}
