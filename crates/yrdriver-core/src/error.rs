//! Error types for yrdriver sessions.
//!
//! Failures fall into four classes: transport (connect/relay failures, retried up
//! to a budget), protocol desync (an expected envelope fails to unpack, never
//! retried), timeouts (local to the caller that set the deadline) and
//! remote-reported command errors (delivered as results, raised only by the
//! higher-level command helpers).

use std::time::Duration;
use thiserror::Error;

/// Main error type for yrdriver.
#[derive(Debug, Error)]
pub enum SessionError {
    // Transport errors
    #[error("Failed to connect to {addr} after {attempts} attempts: {message}")]
    Connect {
        addr: String,
        attempts: u32,
        message: String,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Channel closed")]
    ChannelClosed,

    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Result poller failed: {message}")]
    PollerFailed { message: String },

    // Timeouts
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Condition not met within {timeout:?}{}", reason_suffix(.reason))]
    WaitTimeout {
        timeout: Duration,
        reason: Option<String>,
    },

    // Command errors
    #[error("Command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    // Loop errors
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Synchronization loop is not running")]
    LoopStopped,

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

/// Result type alias for yrdriver operations.
pub type Result<T> = std::result::Result<T, SessionError>;

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl SessionError {
    /// Create a protocol desync error.
    pub fn protocol(message: impl Into<String>) -> Self {
        SessionError::Protocol {
            message: message.into(),
        }
    }

    /// Whether this error is a deadline expiry local to one call.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::Timeout(_) | SessionError::WaitTimeout { .. }
        )
    }

    /// Whether this error ends the task that observed it.
    ///
    /// Transport exhaustion and protocol desync are session-fatal; timeouts and
    /// remote-reported command failures are not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Connect { .. }
                | SessionError::Protocol { .. }
                | SessionError::PollerFailed { .. }
                | SessionError::ChannelClosed
                | SessionError::Invariant(_)
        )
    }

    /// Copy of this error suitable for handing to several waiters.
    ///
    /// Source errors are not `Clone`, so they are flattened to their message.
    pub fn duplicate(&self) -> Self {
        match self {
            SessionError::Connect {
                addr,
                attempts,
                message,
            } => SessionError::Connect {
                addr: addr.clone(),
                attempts: *attempts,
                message: message.clone(),
            },
            SessionError::Transport { message } => SessionError::Transport {
                message: message.clone(),
            },
            SessionError::ChannelClosed => SessionError::ChannelClosed,
            SessionError::Protocol { message } => SessionError::Protocol {
                message: message.clone(),
            },
            SessionError::PollerFailed { message } => SessionError::PollerFailed {
                message: message.clone(),
            },
            SessionError::Timeout(d) => SessionError::Timeout(*d),
            SessionError::WaitTimeout { timeout, reason } => SessionError::WaitTimeout {
                timeout: *timeout,
                reason: reason.clone(),
            },
            SessionError::CommandFailed { command, message } => SessionError::CommandFailed {
                command: command.clone(),
                message: message.clone(),
            },
            SessionError::Invariant(m) => SessionError::Invariant(m.clone()),
            SessionError::LoopStopped => SessionError::LoopStopped,
            SessionError::Json { message, .. } => SessionError::Json {
                message: message.clone(),
                source: None,
            },
            SessionError::Io { message, .. } => SessionError::Io {
                message: message.clone(),
                source: None,
            },
            SessionError::Config { message } => SessionError::Config {
                message: message.clone(),
            },
            SessionError::Other(m) => SessionError::Other(m.clone()),
        }
    }
}
