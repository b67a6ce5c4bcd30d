//! Handle on "the current control connection".
//!
//! Adapters never hold a generation's sender directly. They hold a
//! [`RelayLink`] and resolve the live sender each time they send, so a
//! response finishing after a reconnect goes out on the new connection.

use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{AgentError, Result};
use crate::protocol::OutgoingMessage;

/// Outbound frame queue of one connection generation
pub type Outbox = mpsc::Sender<Message>;

/// Sends envelopes on whichever control connection is live
#[derive(Clone)]
pub struct RelayLink {
    current: watch::Receiver<Option<Outbox>>,
}

/// Owner side of the link, held by the connection manager
pub struct LinkPublisher {
    current: watch::Sender<Option<Outbox>>,
}

pub fn relay_link() -> (LinkPublisher, RelayLink) {
    let (tx, rx) = watch::channel(None);
    (LinkPublisher { current: tx }, RelayLink { current: rx })
}

impl LinkPublisher {
    /// Routes all sends to a freshly opened connection
    pub fn attach(&self, outbox: Outbox) {
        self.current.send_replace(Some(outbox));
    }

    pub fn detach(&self) {
        self.current.send_replace(None);
    }
}

impl RelayLink {
    pub async fn send(&self, msg: &OutgoingMessage) -> Result<()> {
        let json = msg.to_json()?;
        let outbox = self
            .current
            .borrow()
            .clone()
            .ok_or(AgentError::Disconnected)?;

        outbox
            .send(Message::Text(json))
            .await
            .map_err(|_| AgentError::Disconnected)
    }
}
