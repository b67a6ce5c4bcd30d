//! Resolution of the relay address and access token.
//!
//! The connection manager asks a [`CredentialSource`] for credentials before
//! every connect attempt and tells it which credential the relay rejected.
//! [`ConfigCredentials`] fills missing values from command-line flags, the
//! config file, and finally interactive prompts.

use anyhow::Context;
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{debug, warn};
use url::Url;

use crate::config::{AuthConfig, Config};
use crate::error::AgentError;

/// A resolved `(address, token)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub address: Url,
    pub token: String,
}

/// Which credential a failed connection attempt invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Address,
    Token,
}

pub trait CredentialSource: Send {
    /// Produce usable credentials, re-acquiring any that were invalidated
    fn resolve(&mut self) -> impl Future<Output = anyhow::Result<Credentials>> + Send;

    fn invalidate(&mut self, credential: Credential);
}

/// Checks that `input` is a WebSocket URL the agent can connect to
pub fn parse_relay_address(input: &str) -> Result<Url, AgentError> {
    let url = Url::parse(input.trim())
        .map_err(|e| AgentError::Credentials(format!("invalid URL {:?}: {}", input, e)))?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(AgentError::Credentials(format!(
            "unsupported scheme {:?} in {:?}, expected ws or wss",
            other, input
        ))),
    }
}

/// Flags, then config file, then prompts
pub struct ConfigCredentials {
    address: Option<String>,
    token: Option<String>,
    config_path: PathBuf,
    used_config: bool,
    interactive: bool,
}

impl ConfigCredentials {
    pub fn new(
        address: Option<String>,
        token: Option<String>,
        config_path: PathBuf,
        interactive: bool,
    ) -> Self {
        let non_empty = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            address: non_empty(address),
            token: non_empty(token),
            config_path,
            used_config: false,
            interactive,
        }
    }

    fn fill_from_config(&mut self) {
        if self.address.is_some() && self.token.is_some() {
            return;
        }

        let config = match Config::load_from(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring config file: {:#}", e);
                return;
            }
        };

        if self.address.is_none() {
            if let Some(address) = config.auth.address.filter(|a| !a.trim().is_empty()) {
                self.address = Some(address);
                self.used_config = true;
            }
        }
        if self.token.is_none() {
            if let Some(token) = config.auth.token.filter(|t| !t.trim().is_empty()) {
                self.token = Some(token);
                self.used_config = true;
            }
        }
    }

    fn persist(&self) -> anyhow::Result<()> {
        let config = Config {
            auth: AuthConfig {
                address: self.address.clone(),
                token: self.token.clone(),
            },
        };
        config.save_to(&self.config_path)?;
        debug!("Saved credentials to {}", self.config_path.display());
        Ok(())
    }

    fn require_interactive(&self, what: &str, flag: &str) -> Result<(), AgentError> {
        if self.interactive {
            return Ok(());
        }
        Err(AgentError::Credentials(format!(
            "{} is not set; pass --{} or add it to {}",
            what,
            flag,
            self.config_path.display()
        )))
    }
}

impl CredentialSource for ConfigCredentials {
    async fn resolve(&mut self) -> anyhow::Result<Credentials> {
        self.fill_from_config();
        let mut prompted = false;

        let current = self.address.as_deref().map(parse_relay_address);
        let address = match current {
            Some(Ok(url)) => url,
            invalid => {
                if let Some(Err(e)) = invalid {
                    warn!("Ignoring relay address: {}", e);
                }
                self.require_interactive("Relay address", "address")?;
                eprintln!("Relay address is not set");
                let (input, url) = prompt_address().await?;
                self.address = Some(input);
                prompted = true;
                url
            }
        };

        let token = match self.token.clone() {
            Some(token) => token,
            None => {
                self.require_interactive("Access token", "token")?;
                eprintln!("Access token is not set");
                let token = prompt_token().await?;
                self.token = Some(token.clone());
                prompted = true;
                token
            }
        };

        if prompted && confirm("Save token and address?", true).await? {
            self.persist()?;
            self.used_config = true;
        }

        Ok(Credentials { address, token })
    }

    fn invalidate(&mut self, credential: Credential) {
        match credential {
            Credential::Address => self.address = None,
            Credential::Token => self.token = None,
        }

        // Keep the config file from handing the rejected value back
        if self.used_config {
            if let Err(e) = self.persist() {
                warn!("Failed to update config file: {:#}", e);
            }
        }
    }
}

async fn prompt(label: String) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || read_line(&label))
        .await
        .context("Prompt task failed")?
}

fn read_line(label: &str) -> anyhow::Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        anyhow::bail!("stdin closed while waiting for {}", label);
    }
    Ok(line.trim().to_string())
}

async fn prompt_address() -> anyhow::Result<(String, Url)> {
    loop {
        let input = prompt("Relay address (ws:// or wss://)".to_string()).await?;
        match parse_relay_address(&input) {
            Ok(url) => return Ok((input, url)),
            Err(e) => println!("{}", e),
        }
    }
}

async fn prompt_token() -> anyhow::Result<String> {
    loop {
        let token = prompt("Access token".to_string()).await?;
        if !token.is_empty() {
            return Ok(token);
        }
    }
}

async fn confirm(question: &str, default: bool) -> anyhow::Result<bool> {
    let hint = if default { "Y/n" } else { "y/N" };
    let answer = prompt(format!("{} [{}]", question, hint)).await?;

    Ok(match answer.to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    })
}
