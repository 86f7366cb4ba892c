//! Agent-level error type

use crate::admin::AdminError;
use crate::config::ConfigError;
use crate::membership::FeedError;
use crate::shutdown::ShutdownError;
use std::time::Duration;

#[derive(Debug)]
pub enum AgentError {
    /// A reconciliation command was rejected; remaining steps were skipped
    Command { command: String, source: AdminError },
    /// A probe query failed; distinct from an unhealthy classification
    Probe { query: String, source: AdminError },
    /// The admin connection is unavailable
    Connection(AdminError),
    /// The membership feed did not finish its initial sync in time
    FeedDesync { timeout: Duration },
    Feed(FeedError),
    Shutdown(ShutdownError),
    Config(ConfigError),
    Io(std::io::Error),
    Transport(String),
}

impl AgentError {
    pub fn command(command: impl Into<String>, source: AdminError) -> Self {
        AgentError::Command {
            command: command.into(),
            source,
        }
    }

    pub fn probe(query: impl Into<String>, source: AdminError) -> Self {
        AgentError::Probe {
            query: query.into(),
            source,
        }
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Command { command, source } => {
                write!(f, "failed to execute command '{}': {}", command, source)
            }
            AgentError::Probe { query, source } => {
                write!(f, "probe query '{}' failed: {}", query, source)
            }
            AgentError::Connection(e) => write!(f, "{}", e),
            AgentError::FeedDesync { timeout } => {
                write!(f, "membership feed did not sync within {:?}", timeout)
            }
            AgentError::Feed(e) => write!(f, "membership feed error: {}", e),
            AgentError::Shutdown(e) => write!(f, "{}", e),
            AgentError::Config(e) => write!(f, "{}", e),
            AgentError::Io(e) => write!(f, "I/O error: {}", e),
            AgentError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Command { source, .. } | AgentError::Probe { source, .. } => Some(source),
            AgentError::Connection(e) => Some(e),
            AgentError::Feed(e) => Some(e),
            AgentError::Shutdown(e) => Some(e),
            AgentError::Config(e) => Some(e),
            AgentError::Io(e) => Some(e),
            AgentError::FeedDesync { .. } | AgentError::Transport(_) => None,
        }
    }
}

impl From<AdminError> for AgentError {
    fn from(e: AdminError) -> Self {
        AgentError::Connection(e)
    }
}

impl From<FeedError> for AgentError {
    fn from(e: FeedError) -> Self {
        AgentError::Feed(e)
    }
}

impl From<ShutdownError> for AgentError {
    fn from(e: ShutdownError) -> Self {
        AgentError::Shutdown(e)
    }
}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        AgentError::Config(e)
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
