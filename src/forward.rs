//! Local forward proxy.
//!
//! Serves `/forward/<port>/<rest>` and relays each request to
//! `127.0.0.1:<port>/<rest>`, WebSocket upgrades included. Every other path is
//! answered with `404 Not found` without touching a target.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:58888";

const FORWARD_PREFIX: &str = "/forward/";

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where a `/forward/...` request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub port: u16,
    /// Path and query on the target, always starting with `/`
    pub path: String,
}

impl ForwardTarget {
    pub fn parse(uri: &Uri) -> Option<Self> {
        let rest = uri.path().strip_prefix(FORWARD_PREFIX)?;
        let (port, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, "/"),
        };

        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let port: u16 = port.parse().ok().filter(|p| *p != 0)?;

        let path = match uri.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        };

        Some(Self { port, path })
    }

    fn url(&self, scheme: &str) -> Result<Url, url::ParseError> {
        Url::parse(&format!("{}://127.0.0.1:{}{}", scheme, self.port, self.path))
    }

    pub fn http_url(&self) -> Result<Url, url::ParseError> {
        self.url("http")
    }

    pub fn ws_url(&self) -> Result<Url, url::ParseError> {
        self.url("ws")
    }
}

#[derive(Clone)]
struct ForwardState {
    client: reqwest::Client,
}

pub fn router() -> Result<Router> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(10)
        .build()
        .context("Failed to create HTTP client")?;

    Ok(Router::new()
        .fallback(forward)
        .with_state(ForwardState { client }))
}

/// Run the forward proxy until `shutdown` fires
pub async fn serve(listen: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind forward proxy to {}", listen))?;
    info!("Forward proxy listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router()?)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Forward proxy failed")
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

fn bad_gateway(reason: impl std::fmt::Display) -> Response {
    (StatusCode::BAD_GATEWAY, format!("Bad gateway: {}", reason)).into_response()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name) && **name != header::HOST && **name != header::CONTENT_LENGTH
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

async fn forward(
    State(state): State<ForwardState>,
    ws: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(target) = ForwardTarget::parse(&uri) else {
        debug!("No forward target in {}", uri);
        return not_found();
    };

    match ws {
        Ok(upgrade) => forward_websocket(target, upgrade, &headers).await,
        Err(_) => forward_http(&state.client, target, method, &headers, body).await,
    }
}

async fn forward_http(
    client: &reqwest::Client,
    target: ForwardTarget,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let url = match target.http_url() {
        Ok(url) => url,
        Err(_) => return not_found(),
    };
    info!("Forward {} {}", method, url);

    let mut request = client
        .request(method, url)
        .headers(forwarded_headers(headers));
    if !body.is_empty() {
        request = request.body(body);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Forward to port {} failed: {}", target.port, e);
            return bad_gateway(e);
        }
    };

    let status = response.status();
    let response_headers = forwarded_headers(response.headers());
    match response.bytes().await {
        Ok(body) => (status, response_headers, body).into_response(),
        Err(e) => bad_gateway(e),
    }
}

async fn forward_websocket(
    target: ForwardTarget,
    upgrade: WebSocketUpgrade,
    headers: &HeaderMap,
) -> Response {
    let url = match target.ws_url() {
        Ok(url) => url,
        Err(_) => return not_found(),
    };
    info!("Forward WebSocket {}", url);

    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => return bad_gateway(e),
    };
    for name in [header::COOKIE, header::AUTHORIZATION] {
        if let Some(value) = headers.get(&name) {
            request.headers_mut().insert(name, value.clone());
        }
    }

    // Connect before upgrading so a dead target can still get a 502
    let upstream = match connect_async(request).await {
        Ok((upstream, _)) => upstream,
        Err(e) => {
            warn!("WebSocket forward to port {} failed: {}", target.port, e);
            return bad_gateway(e);
        }
    };

    upgrade.on_upgrade(move |socket| bridge(socket, upstream))
}

async fn bridge(client: WebSocket, upstream: Upstream) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let Some(msg) = into_upstream(msg) else { continue };
            let closing = matches!(msg, Message::Close(_));
            if upstream_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(msg) = into_client(msg) else { continue };
            let closing = matches!(msg, AxumMessage::Close(_));
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = to_upstream => debug!("Client side of forwarded WebSocket ended"),
        _ = to_client => debug!("Target side of forwarded WebSocket ended"),
    }
}

/// Ping and pong are answered per hop and not forwarded
fn into_upstream(msg: AxumMessage) -> Option<Message> {
    match msg {
        AxumMessage::Text(text) => Some(Message::Text(text.as_str().to_string())),
        AxumMessage::Binary(data) => Some(Message::Binary(data.to_vec())),
        AxumMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().to_string().into(),
        }))),
        AxumMessage::Ping(_) | AxumMessage::Pong(_) => None,
    }
}

fn into_client(msg: Message) -> Option<AxumMessage> {
    match msg {
        Message::Text(text) => Some(AxumMessage::Text(text.into())),
        Message::Binary(data) => Some(AxumMessage::Binary(data.into())),
        Message::Close(frame) => Some(AxumMessage::Close(frame.map(|f| AxumCloseFrame {
            code: f.code.into(),
            reason: f.reason.into_owned().into(),
        }))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}
