//! Relay client implementation.
//!
//! This module provides the agent side of the control connection:
//! - [`TunnelClient`] - keeps the connection to the relay alive and reconnects
//! - HTTP relay for forwarding `octo_api` calls to local services
//! - WebSocket multiplexer for relay-driven sessions to local endpoints

mod connection;
mod http_proxy;
mod link;
mod router;
mod ws_proxy;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::TunnelClient;
pub use router::TRAFFIC;
