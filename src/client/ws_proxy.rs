//! Multiplexing of local WebSocket sessions over the control connection.
//!
//! Each session runs in its own task and reports a typed event stream
//! ([`SessionEvent`]). The [`Multiplexer`] task owns the endpoint registry
//! and is the only place it is mutated; the router talks to it through a
//! [`MultiplexerHandle`].

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::link::RelayLink;
use crate::protocol::{
    display_id, CorrelationId, EndpointKey, Frame, OutgoingMessage, SessionReport,
};

type LocalStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a closing session waits for the peer's close reply
const CLOSE_GRACE: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a closed session still waits for a handshake already underway
const HANDSHAKE_GRACE: Duration = Duration::from_secs(1);

const CLOSED_WHILE_CONNECTING: &str = "WebSocket was closed before the connection was established";

/// Commands the router submits to the multiplexer
#[derive(Debug)]
pub enum MuxCommand {
    Init {
        id: Option<CorrelationId>,
        key: EndpointKey,
    },
    Send {
        id: Option<CorrelationId>,
        key: EndpointKey,
        frame: Frame,
    },
    Close {
        id: Option<CorrelationId>,
        key: EndpointKey,
    },
}

/// Lifecycle of a registered session. Absent and closed both mean
/// "no registry entry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
}

/// What a local session reports, in the order it happens
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    Message(Frame),
    Failed(String),
    Closed,
}

#[derive(Debug)]
struct SessionUpdate {
    key: EndpointKey,
    ticket: u64,
    event: SessionEvent,
}

#[derive(Clone)]
struct EventSink {
    key: EndpointKey,
    ticket: u64,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl EventSink {
    fn emit(&self, event: SessionEvent) {
        let _ = self.updates.send(SessionUpdate {
            key: self.key.clone(),
            ticket: self.ticket,
            event,
        });
    }
}

/// Handle on a local WebSocket session running in its own task
struct LocalSession {
    frames: mpsc::UnboundedSender<Frame>,
    closing: CancellationToken,
    task: JoinHandle<()>,
}

impl LocalSession {
    /// Start a session. It will not connect before `predecessor` has finished.
    fn spawn(sink: EventSink, predecessor: Option<JoinHandle<()>>) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();
        let task = tokio::spawn(drive_session(
            sink,
            predecessor,
            frames_rx,
            closing.clone(),
        ));

        Self {
            frames: frames_tx,
            closing,
            task,
        }
    }

    /// Queued frames are written once the session is open
    fn send(&self, frame: Frame) {
        let _ = self.frames.send(frame);
    }

    fn close(&self) {
        self.closing.cancel();
    }
}

async fn drive_session(
    sink: EventSink,
    predecessor: Option<JoinHandle<()>>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    closing: CancellationToken,
) {
    // At most one live local session per key
    if let Some(previous) = predecessor {
        let _ = previous.await;
    }

    // A session closed mid-handshake gives the handshake HANDSHAKE_GRACE to
    // finish so it can be closed cleanly; a stalled one is dropped.
    let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(sink.key.as_str()));
    tokio::pin!(connect);
    let connected = tokio::select! {
        result = &mut connect => Some(result),
        _ = closing.cancelled() => tokio::time::timeout(HANDSHAKE_GRACE, &mut connect).await.ok(),
    };

    let mut ws = match connected {
        Some(Ok(Ok((ws, _)))) => ws,
        Some(Ok(Err(e))) => {
            sink.emit(SessionEvent::Failed(e.to_string()));
            sink.emit(SessionEvent::Closed);
            return;
        }
        Some(Err(_)) => {
            sink.emit(SessionEvent::Failed(format!(
                "Timed out after {}s connecting to {}",
                CONNECT_TIMEOUT.as_secs(),
                sink.key
            )));
            sink.emit(SessionEvent::Closed);
            return;
        }
        None => {
            debug!("Dropped stalled handshake to {}", sink.key);
            sink.emit(SessionEvent::Failed(CLOSED_WHILE_CONNECTING.to_string()));
            sink.emit(SessionEvent::Closed);
            return;
        }
    };

    if closing.is_cancelled() {
        shutdown(&mut ws).await;
        sink.emit(SessionEvent::Failed(CLOSED_WHILE_CONNECTING.to_string()));
        sink.emit(SessionEvent::Closed);
        return;
    }

    sink.emit(SessionEvent::Opened);

    loop {
        tokio::select! {
            biased;
            _ = closing.cancelled() => {
                shutdown(&mut ws).await;
                break;
            }
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws.send(into_message(frame)).await {
                        sink.emit(SessionEvent::Failed(e.to_string()));
                        break;
                    }
                }
                None => {
                    shutdown(&mut ws).await;
                    break;
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => sink.emit(SessionEvent::Message(Frame::Text(text))),
                Some(Ok(Message::Binary(data))) => {
                    sink.emit(SessionEvent::Message(Frame::Binary(data)))
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    sink.emit(SessionEvent::Failed(e.to_string()));
                    break;
                }
            },
        }
    }

    sink.emit(SessionEvent::Closed);
}

/// Close handshake, bounded so a silent peer cannot hold the key
async fn shutdown(ws: &mut LocalStream) {
    let _ = ws.close(None).await;
    let drain = async { while let Some(Ok(_)) = ws.next().await {} };
    let _ = tokio::time::timeout(CLOSE_GRACE, drain).await;
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
    }
}

struct Endpoint {
    ticket: u64,
    /// Cleared by the first event relayed for this session
    init_id: Option<CorrelationId>,
    state: SessionState,
    session: LocalSession,
}

/// Sends commands to the multiplexer task
#[derive(Clone)]
pub struct MultiplexerHandle {
    commands: mpsc::Sender<MuxCommand>,
}

impl MultiplexerHandle {
    pub async fn submit(&self, command: MuxCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("Multiplexer stopped, dropping command");
        }
    }
}

/// Owner of the endpoint registry for one connection generation
pub struct Multiplexer {
    registry: HashMap<EndpointKey, Endpoint>,
    link: RelayLink,
    next_ticket: u64,
    commands: mpsc::Receiver<MuxCommand>,
    updates_tx: mpsc::UnboundedSender<SessionUpdate>,
    updates_rx: mpsc::UnboundedReceiver<SessionUpdate>,
}

impl Multiplexer {
    /// Start the multiplexer task. It stops, closing every session, when
    /// `shutdown` fires or every handle is dropped.
    pub fn spawn(link: RelayLink, shutdown: CancellationToken) -> (MultiplexerHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(256);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let mux = Self {
            registry: HashMap::new(),
            link,
            next_ticket: 0,
            commands: commands_rx,
            updates_tx,
            updates_rx,
        };
        let task = tokio::spawn(mux.run(shutdown));

        (
            MultiplexerHandle {
                commands: commands_tx,
            },
            task,
        )
    }

    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(update) = self.updates_rx.recv() => self.on_update(update).await,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
            }
        }

        for (key, endpoint) in self.registry.drain() {
            debug!("Closing {:?} session {}", endpoint.state, key);
            endpoint.session.close();
        }
    }

    async fn on_command(&mut self, command: MuxCommand) {
        match command {
            MuxCommand::Init { id, key } => self.open(id, key),
            MuxCommand::Send { id, key, frame } => match self.registry.get(&key) {
                Some(endpoint) if endpoint.state == SessionState::Closing => {
                    debug!("Session {} is closing, dropping frame", key);
                }
                Some(endpoint) => endpoint.session.send(frame),
                None => self.report_missing(id, key).await,
            },
            MuxCommand::Close { id, key } => match self.registry.get_mut(&key) {
                Some(endpoint) => {
                    endpoint.state = SessionState::Closing;
                    endpoint.session.close();
                }
                None => self.report_missing(id, key).await,
            },
        }
    }

    /// Register a new session for `key`, replacing any existing one
    fn open(&mut self, id: Option<CorrelationId>, key: EndpointKey) {
        let predecessor = self.registry.remove(&key).map(|old| {
            debug!("Replacing {:?} session {}", old.state, key);
            old.session.close();
            old.session.task
        });

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let sink = EventSink {
            key: key.clone(),
            ticket,
            updates: self.updates_tx.clone(),
        };
        let session = LocalSession::spawn(sink, predecessor);

        self.registry.insert(
            key,
            Endpoint {
                ticket,
                init_id: id,
                state: SessionState::Connecting,
                session,
            },
        );
    }

    async fn on_update(&mut self, update: SessionUpdate) {
        let SessionUpdate { key, ticket, event } = update;

        let Some(endpoint) = self
            .registry
            .get_mut(&key)
            .filter(|endpoint| endpoint.ticket == ticket)
        else {
            debug!("Dropping {:?} from replaced session {}", event, key);
            return;
        };

        let id = endpoint.init_id.take();
        let closed = event == SessionEvent::Closed;
        let report = match event {
            SessionEvent::Opened => {
                endpoint.state = SessionState::Open;
                info!("Local WebSocket open: {}", key);
                SessionReport::opened()
            }
            SessionEvent::Message(frame) => SessionReport::frame(frame),
            SessionEvent::Failed(error) => {
                warn!("Local WebSocket {} failed: {}", key, error);
                SessionReport::error(error)
            }
            SessionEvent::Closed => {
                info!("Local WebSocket closed: {}", key);
                SessionReport::closed()
            }
        };

        if closed {
            self.registry.remove(&key);
        }

        self.emit(OutgoingMessage::session_event(id, key, report))
            .await;
    }

    async fn report_missing(&self, id: Option<CorrelationId>, key: EndpointKey) {
        debug!("No session for {} [#{}]", key, display_id(id.as_ref()));
        self.emit(OutgoingMessage::endpoint_missing(id, key)).await;
    }

    async fn emit(&self, msg: OutgoingMessage) {
        if let Err(e) = self.link.send(&msg).await {
            debug!("Dropping session event: {}", e);
        }
    }
}
