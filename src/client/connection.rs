use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, AUTHORIZATION};
use http::StatusCode;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Error as WsError, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::http_proxy::HttpRelay;
use super::link::{relay_link, LinkPublisher, RelayLink};
use super::router::MessageRouter;
use super::ws_proxy::Multiplexer;
use crate::credentials::{Credential, CredentialSource, Credentials};

/// Base reconnect delay in seconds
const RECONNECT_BASE_SECS: u64 = 5;
/// Attempts beyond this no longer lengthen the delay
const RECONNECT_MAX_STEPS: u32 = 20;

/// How long a closing connection may take to flush its close frame
const CLOSE_FLUSH: Duration = Duration::from_secs(2);

/// Delay before reconnect attempt number `attempt`: 6s, 7s, ... up to 25s
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(RECONNECT_BASE_SECS + u64::from(attempt.min(RECONNECT_MAX_STEPS)))
}

/// Attempt number for the next reconnect. A connection that opened resets
/// the count.
pub fn next_attempt(previous: u32, opened: bool) -> u32 {
    if opened {
        1
    } else {
        previous.saturating_add(1)
    }
}

/// How a failed connection reflects on the credentials used for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Handshake rejected with 401: the token is no good
    Unauthorized,
    /// Network unreachable: the address is no good
    Unreachable,
    Other,
}

impl Failure {
    pub fn classify(error: &WsError) -> Self {
        match error {
            WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                Failure::Unauthorized
            }
            WsError::Io(e) if is_unreachable(e) => Failure::Unreachable,
            _ => Failure::Other,
        }
    }

    fn invalidates(self) -> Option<Credential> {
        match self {
            Failure::Unauthorized => Some(Credential::Token),
            Failure::Unreachable => Some(Credential::Address),
            Failure::Other => None,
        }
    }
}

fn is_unreachable(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::NetworkUnreachable
}

/// Outcome of one connection generation
#[derive(Debug)]
struct Generation {
    opened: bool,
    failure: Option<Failure>,
}

impl Generation {
    fn failed(failure: Failure) -> Self {
        Self {
            opened: false,
            failure: Some(failure),
        }
    }
}

/// Keeps one authenticated control connection to the relay alive
pub struct TunnelClient<C> {
    credentials: C,
    shutdown: CancellationToken,
    publisher: LinkPublisher,
    link: RelayLink,
    http: HttpRelay,
}

impl<C: CredentialSource> TunnelClient<C> {
    pub fn new(credentials: C, shutdown: CancellationToken) -> Result<Self> {
        let (publisher, link) = relay_link();

        Ok(Self {
            credentials,
            shutdown,
            publisher,
            link,
            http: HttpRelay::new()?,
        })
    }

    /// Connect and reconnect until shutdown is requested
    pub async fn run(mut self) -> Result<()> {
        let mut attempt = 0;

        loop {
            let credentials = self
                .credentials
                .resolve()
                .await
                .context("Failed to resolve relay credentials")?;

            let generation = self.connect_and_run(&credentials).await;

            if let Some(credential) = generation.failure.and_then(Failure::invalidates) {
                warn!("Relay rejected the {:?}, it will be re-acquired", credential);
                self.credentials.invalidate(credential);
            }

            if self.shutdown.is_cancelled() {
                info!("Shutdown requested");
                break;
            }

            attempt = next_attempt(attempt, generation.opened);
            let delay = reconnect_delay(attempt);
            info!("Try reconnect in {} sec...", delay.as_secs());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn connect_and_run(&self, credentials: &Credentials) -> Generation {
        info!("Try connect to [{}]", credentials.address);

        let mut request = match credentials.address.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                error!("Invalid relay address {}: {}", credentials.address, e);
                return Generation::failed(Failure::Other);
            }
        };
        match HeaderValue::from_str(&format!("Bearer {}", credentials.token)) {
            Ok(value) => {
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => {
                error!("Access token contains characters not allowed in a header");
                return Generation::failed(Failure::Unauthorized);
            }
        }

        let connect = tokio::select! {
            result = connect_async(request) => result,
            _ = self.shutdown.cancelled() => {
                return Generation { opened: false, failure: None };
            }
        };
        let (ws_stream, _) = match connect {
            Ok(connected) => connected,
            Err(e) => {
                error!("WS error: {}", e);
                return Generation::failed(Failure::classify(&e));
            }
        };

        info!("Connected");
        let (mut write, mut read) = ws_stream.split();

        // Liveness marker: the first frame on every connection
        let marker = Message::Text(Utc::now().timestamp_millis().to_string());
        if let Err(e) = write.send(marker).await {
            error!("WS error: {}", e);
            return Generation {
                opened: true,
                failure: Some(Failure::classify(&e)),
            };
        }

        let generation_token = self.shutdown.child_token();
        let (outbox, mut outbox_rx) = mpsc::channel::<Message>(256);

        // Spawn message sender task; it exclusively owns the write half
        let writer_token = generation_token.clone();
        let mut writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => {
                        let _ = write.close().await;
                        break;
                    }
                    msg = outbox_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = write.send(msg).await {
                            debug!("Send error (connection closing): {}", e);
                            break;
                        }
                    }
                }
            }
        });

        self.publisher.attach(outbox.clone());
        let (mux, mux_task) = Multiplexer::spawn(self.link.clone(), generation_token.clone());
        let router = MessageRouter::new(self.link.clone(), self.http.clone(), mux);

        let mut failure = None;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = &mut writer => {
                    debug!("Sender task ended");
                    break;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => router.dispatch(&text).await,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => router.dispatch(&text).await,
                        Err(_) => warn!("Dropping binary frame that is not UTF-8"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        debug!("Received ping, sending pong");
                        let _ = outbox.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => debug!("Received pong"),
                    Some(Ok(Message::Close(frame))) => {
                        info!(
                            "Relay closed connection: {:?}",
                            frame.map(|f| f.reason.to_string())
                        );
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!("WS error: {}", e);
                        failure = Some(Failure::classify(&e));
                        break;
                    }
                    None => break,
                },
            }
        }

        // Responses still in flight resolve against the next connection
        self.publisher.detach();
        generation_token.cancel();
        drop(router);
        let _ = mux_task.await;
        if !writer.is_finished() {
            let _ = tokio::time::timeout(CLOSE_FLUSH, &mut writer).await;
        }

        info!("Disconnected");
        Generation {
            opened: true,
            failure,
        }
    }
}
