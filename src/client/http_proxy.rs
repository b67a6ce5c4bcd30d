use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde_json::Value;
use std::error::Error as _;
use std::io;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::link::RelayLink;
use crate::protocol::{display_id, ApiFailure, ApiRequest, CorrelationId, OutgoingMessage};

/// Upper bound for one proxied call, connect through body
pub const API_TIMEOUT: Duration = Duration::from_secs(200);

const MAX_REDIRECTS: usize = 5;

/// Content type of `data` sent as a raw string
const TEXT_CONTENT_TYPE: &str = "text/plain;charset=utf-8";

/// Executes `octo_api` calls against local services
#[derive(Clone)]
pub struct HttpRelay {
    client: Client,
}

impl HttpRelay {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(API_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .pool_max_idle_per_host(10)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Run one call in the background and send exactly one `response` for it
    pub fn spawn(
        &self,
        id: Option<CorrelationId>,
        request: ApiRequest,
        link: RelayLink,
    ) -> JoinHandle<()> {
        let relay = self.clone();

        tokio::spawn(async move {
            let msg = match relay.execute(&request).await {
                Ok(data) => OutgoingMessage::api_data(id.clone(), data),
                Err(failure) => {
                    warn!(
                        "[#{}] {} {} -> {}",
                        display_id(id.as_ref()),
                        request.method(),
                        request.path(),
                        failure.message
                    );
                    OutgoingMessage::api_failure(id.clone(), failure)
                }
            };

            if let Err(e) = link.send(&msg).await {
                warn!("Dropping response for [#{}]: {}", display_id(id.as_ref()), e);
            }
        })
    }

    pub async fn execute(&self, request: &ApiRequest) -> Result<Value, ApiFailure> {
        let url = join_url(request.base_url(), request.path());

        let method = Method::from_bytes(request.method().to_ascii_uppercase().as_bytes())
            .map_err(|e| failure(format!("Invalid method {:?}: {}", request.method(), e), None))?;

        let mut builder = self.client.request(method, &url);
        match &request.data {
            None | Some(Value::Null) => {}
            Some(Value::String(body)) => {
                builder = builder
                    .header(CONTENT_TYPE, TEXT_CONTENT_TYPE)
                    .body(body.clone())
            }
            Some(other) => builder = builder.json(other),
        }

        let response = builder.send().await.map_err(transport_failure)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_failure)?;
        let data = parse_body(&body);

        debug!("{} -> {} ({} bytes)", url, status, body.len());

        if !status.is_success() {
            let code = if status.is_client_error() {
                "ERR_BAD_REQUEST"
            } else {
                "ERR_BAD_RESPONSE"
            };
            return Err(ApiFailure {
                message: format!("Request failed with status code {}", status.as_u16()),
                code: Some(code.to_string()),
                status: Some(status.as_u16()),
                data: Some(data),
            });
        }

        Ok(data)
    }
}

/// Combine `baseURL` and `url` the way the relay expects: an absolute `url`
/// wins, otherwise the two are joined with a single slash.
pub fn join_url(base: &str, path: &str) -> String {
    if is_absolute_url(path) {
        return path.to_string();
    }
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn is_absolute_url(url: &str) -> bool {
    if url.starts_with("//") {
        return true;
    }
    match url.split_once("://") {
        Some((scheme, _)) => {
            let mut chars = scheme.chars();
            chars.next().is_some_and(|c| c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// JSON bodies are passed through as JSON, anything else as a string
fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::String(String::new());
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn failure(message: String, code: Option<&str>) -> ApiFailure {
    ApiFailure {
        message,
        code: code.map(str::to_string),
        status: None,
        data: None,
    }
}

fn transport_failure(err: reqwest::Error) -> ApiFailure {
    let code = if err.is_timeout() {
        "ETIMEDOUT"
    } else if io_kind(&err) == Some(io::ErrorKind::ConnectionRefused) {
        "ECONNREFUSED"
    } else if err.is_builder() {
        "ERR_INVALID_URL"
    } else {
        "ERR_NETWORK"
    };

    // reqwest's Display hides the cause; include the chain
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    failure(message, Some(code))
}

fn io_kind(err: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = cause.source();
    }
    None
}
