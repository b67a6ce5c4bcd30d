//! Type-safe wrappers for protocol identifiers.
//!
//! Endpoint keys are plain strings on the wire. Correlation ids are opaque:
//! whatever JSON value the relay sends is echoed back unchanged. The newtypes
//! keep the two from being swapped by accident.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Relay-generated id pairing a request with its response(s)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Value);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        CorrelationId(Value::String(s))
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId(Value::from(s))
    }
}

/// Target WebSocket URL identifying one multiplexed local session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointKey(pub String);

impl EndpointKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EndpointKey {
    fn from(s: String) -> Self {
        EndpointKey(s)
    }
}

impl From<&str> for EndpointKey {
    fn from(s: &str) -> Self {
        EndpointKey(s.to_string())
    }
}

/// Formats an optional id the way log lines show it
pub fn display_id(id: Option<&CorrelationId>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
}
