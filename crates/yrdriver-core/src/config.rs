//! Centralized configuration for yrdriver sessions.
//!
//! Constant tables hold the protocol and pacing defaults; [`SessionConfig`] is the
//! per-session builder handed to [`crate::SyncLoop`] and [`crate::RpcClient`].

use crate::net::RetryConfig;
use crate::{Result, SessionError};
use std::time::Duration;

/// Connection defaults for the game's remote command endpoint.
pub struct ChannelConfig;

impl ChannelConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 14521;
    pub const CONNECT_ATTEMPTS: u32 = 15;
    pub const CONNECT_DELAY: Duration = Duration::from_secs(1);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Outbound slots per channel; only one request is ever in flight.
    pub const OUTBOUND_CAPACITY: usize = 4;
}

/// Result polling defaults.
pub struct PollConfig;

impl PollConfig {
    /// Timeout sent to the peer with every blocking poll. Bounds shutdown latency.
    pub const WIRE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Loopback peer limits.
pub struct PeerConfig;

impl PeerConfig {
    pub const BIND_ADDR: &'static str = "127.0.0.1:0";
    pub const MAX_CONNECTIONS: usize = 16;
}

/// Synchronization loop pacing.
pub struct LoopConfig;

impl LoopConfig {
    pub const DEFAULT_FREQUENCY: u32 = 20;
    pub const MIN_FREQUENCY: u32 = 1;
    pub const MAX_FREQUENCY: u32 = 60;
    pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
    pub const STATS_EVERY: u64 = 30;
}

/// Settings for one session against one game process.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Host of the game's command endpoint.
    pub host: String,
    /// Port of the game's command endpoint.
    pub port: u16,
    /// State fetch frequency in Hz, always within `[MIN_FREQUENCY, MAX_FREQUENCY]`.
    pub frequency: u32,
    /// Deadline for a single state fetch.
    pub fetch_timeout: Duration,
    /// Timeout carried by every blocking poll request.
    pub poll_timeout: Duration,
    /// Reconnect policy for both channels.
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: ChannelConfig::DEFAULT_HOST.to_string(),
            port: ChannelConfig::DEFAULT_PORT,
            frequency: LoopConfig::DEFAULT_FREQUENCY,
            fetch_timeout: LoopConfig::FETCH_TIMEOUT,
            poll_timeout: PollConfig::WIRE_TIMEOUT,
            retry: RetryConfig::fixed(ChannelConfig::CONNECT_ATTEMPTS, ChannelConfig::CONNECT_DELAY),
        }
    }
}

impl SessionConfig {
    /// Create a config for the given endpoint with default pacing.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the loop frequency, clamped to the supported range.
    pub fn with_frequency(mut self, hz: u32) -> Self {
        self.frequency = hz.clamp(LoopConfig::MIN_FREQUENCY, LoopConfig::MAX_FREQUENCY);
        self
    }

    /// Set the state fetch deadline.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the wire-level poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the reconnect policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Reject settings no session can run with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SessionError::Config {
                message: "host is empty".to_string(),
            });
        }
        if self.port == 0 {
            return Err(SessionError::Config {
                message: "port 0 is not connectable".to_string(),
            });
        }
        if self.fetch_timeout.is_zero() || self.poll_timeout.is_zero() {
            return Err(SessionError::Config {
                message: "timeouts must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// `host:port` string used to connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Target duration of one loop iteration.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frequency.max(1)))
    }
}
