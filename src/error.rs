use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    Protocol(String),

    #[error("Relay connection is not open")]
    Disconnected,

    #[error("Credentials unavailable: {0}")]
    Credentials(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
