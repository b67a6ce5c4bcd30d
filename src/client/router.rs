use tracing::{debug, info, warn};

use super::http_proxy::HttpRelay;
use super::link::RelayLink;
use super::ws_proxy::{MultiplexerHandle, MuxCommand};
use crate::protocol::{display_id, Frame, InboundFrame, RelayRequest};

/// Per-request log lines go to this target so `--silence` can mute them
pub const TRAFFIC: &str = "traffic";

/// Dispatches inbound relay frames to the HTTP relay or the multiplexer
pub struct MessageRouter {
    link: RelayLink,
    http: HttpRelay,
    mux: MultiplexerHandle,
}

impl MessageRouter {
    pub fn new(link: RelayLink, http: HttpRelay, mux: MultiplexerHandle) -> Self {
        Self { link, http, mux }
    }

    /// Handle one frame. Never fails: bad frames are logged and dropped.
    pub async fn dispatch(&self, text: &str) {
        let (id, request) = match InboundFrame::parse(text) {
            Ok(InboundFrame::Request { id, request }) => (id, request),
            Ok(InboundFrame::Ignored { kind }) => {
                debug!("Ignoring message of type {:?}", kind);
                return;
            }
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };

        match request {
            RelayRequest::OctoApi(api) => {
                info!(
                    target: TRAFFIC,
                    "HTTP\t[#{}]\t{} {} {}",
                    display_id(id.as_ref()),
                    api.base_url(),
                    api.method(),
                    api.path()
                );
                self.http.spawn(id, api, self.link.clone());
            }
            RelayRequest::WsInit { ws_endpoint_url } => {
                info!(
                    target: TRAFFIC,
                    "[WS] INIT\t[#{}]\t{}",
                    display_id(id.as_ref()),
                    ws_endpoint_url
                );
                self.mux
                    .submit(MuxCommand::Init {
                        id,
                        key: ws_endpoint_url,
                    })
                    .await;
            }
            RelayRequest::WsSend {
                ws_endpoint_url,
                message,
            } => {
                let frame = Frame::from_relay(message);
                info!(
                    target: TRAFFIC,
                    "[WS] SEND\t[#{}]\t{} ({} bytes)",
                    display_id(id.as_ref()),
                    ws_endpoint_url,
                    frame.size()
                );
                self.mux
                    .submit(MuxCommand::Send {
                        id,
                        key: ws_endpoint_url,
                        frame,
                    })
                    .await;
            }
            RelayRequest::WsClose { ws_endpoint_url } => {
                info!(
                    target: TRAFFIC,
                    "[WS] CLOSE\t[#{}]\t{}",
                    display_id(id.as_ref()),
                    ws_endpoint_url
                );
                self.mux
                    .submit(MuxCommand::Close {
                        id,
                        key: ws_endpoint_url,
                    })
                    .await;
            }
        }
    }
}
