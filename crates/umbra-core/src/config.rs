//! Configuration structs carrying the protocol's operating constants.
//!
//! Everything is a plain struct with a `Default`; tests and embedders
//! override fields directly. There is no config-file layer.

use std::time::Duration;
use umbra_wire::{DEFAULT_MAX_BUFFER, DEFAULT_MAX_FRAME};

/// Handshake driving parameters.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Wall-clock bound on the whole handshake loop.
    pub timeout: Duration,
    /// Initial capacity of each session buffer.
    pub initial_buffer: usize,
    /// Hard cap on session buffer growth.
    pub max_buffer: usize,
    /// Queue depth of the handshake task pool.
    pub task_queue_depth: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            initial_buffer: 4096,
            max_buffer: DEFAULT_MAX_BUFFER,
            task_queue_depth: 24,
        }
    }
}

/// Keepalive probing parameters.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Interval between keepalive timer ticks.
    pub interval: Duration,
    /// Missed-pong count that triggers reconnection.
    pub max_missed: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed: 3,
        }
    }
}

/// Reconnection parameters.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive failures tolerated before the client stops permanently.
    pub max_attempts: u32,
    /// Base backoff; the wait before attempt `n` (1-based) is `n * base`.
    pub backoff_base: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(3),
        }
    }
}

/// Outbound queue bounds, per connection.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued messages.
    pub max_messages: usize,
    /// Maximum queued payload bytes across all messages.
    pub max_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_messages: 256,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Everything a relay client needs.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Handshake driving parameters.
    pub handshake: HandshakeConfig,
    /// Keepalive probing parameters.
    pub keepalive: KeepaliveConfig,
    /// Reconnection parameters.
    pub reconnect: ReconnectConfig,
    /// Outbound queue bounds.
    pub queue: QueueConfig,
    /// Cap on a single undelimited frame.
    pub max_frame: usize,
}

impl ClientConfig {
    /// Effective frame cap (0 means the wire default).
    #[must_use]
    pub fn max_frame(&self) -> usize {
        if self.max_frame == 0 {
            DEFAULT_MAX_FRAME
        } else {
            self.max_frame
        }
    }
}

/// Everything a relay server needs.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Handshake driving parameters (server side: responder).
    pub handshake: HandshakeConfig,
    /// Outbound queue bounds, applied per accepted connection.
    pub queue: QueueConfig,
    /// Cap on a single undelimited frame.
    pub max_frame: usize,
}

impl ServerConfig {
    /// Effective frame cap (0 means the wire default).
    #[must_use]
    pub fn max_frame(&self) -> usize {
        if self.max_frame == 0 {
            DEFAULT_MAX_FRAME
        } else {
            self.max_frame
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_defaults() {
        let config = HandshakeConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.task_queue_depth, 24);
        assert!(config.initial_buffer <= config.max_buffer);
    }

    #[test]
    fn test_keepalive_defaults() {
        let config = KeepaliveConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.max_missed, 3);
    }

    #[test]
    fn test_reconnect_defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(3));
    }

    #[test]
    fn test_queue_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_messages, 256);
        assert_eq!(config.max_bytes, 1024 * 1024);
    }

    #[test]
    fn test_frame_cap_falls_back_to_wire_default() {
        assert_eq!(ClientConfig::default().max_frame(), DEFAULT_MAX_FRAME);
        let config = ServerConfig {
            max_frame: 128,
            ..Default::default()
        };
        assert_eq!(config.max_frame(), 128);
    }
}
