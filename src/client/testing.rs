//! Fixtures shared by the client tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::link::{relay_link, LinkPublisher, RelayLink};
use crate::credentials::{Credential, CredentialSource, Credentials};

/// Serves `app` on an ephemeral loopback port
pub async fn serve(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A link attached to a channel standing in for the control connection
pub fn attached_link() -> (LinkPublisher, RelayLink, mpsc::Receiver<Message>) {
    let (publisher, link) = relay_link();
    let (tx, rx) = mpsc::channel(64);
    publisher.attach(tx);
    (publisher, link, rx)
}

/// Next envelope sent to the relay, decoded
pub async fn next_json(rx: &mut mpsc::Receiver<Message>) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a relay message")
        .expect("outbox closed");
    serde_json::from_str(msg.to_text().expect("text frame")).expect("valid JSON")
}

pub async fn assert_quiet(rx: &mut mpsc::Receiver<Message>) {
    let next = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(next.is_err(), "unexpected relay message: {:?}", next);
}

/// Credential source with fixed values that records invalidations
pub struct FixedCredentials {
    pub credentials: Credentials,
    pub invalidated: Arc<Mutex<Vec<Credential>>>,
}

impl FixedCredentials {
    pub fn new(address: &str, token: &str) -> Self {
        Self {
            credentials: Credentials {
                address: address.parse().unwrap(),
                token: token.to_string(),
            },
            invalidated: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl CredentialSource for FixedCredentials {
    async fn resolve(&mut self) -> anyhow::Result<Credentials> {
        Ok(self.credentials.clone())
    }

    fn invalidate(&mut self, credential: Credential) {
        self.invalidated.lock().unwrap().push(credential);
    }
}
