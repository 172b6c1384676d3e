//! Configuration for connections, credentials, and the owning client

use std::time::Duration;

/// Which protocol a logical endpoint speaks.
///
/// Public endpoints multiplex channels with explicit SUBSCRIBE/UNSUBSCRIBE
/// control frames. Private endpoints carry no control frames: holding an open
/// authenticated connection is the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Public,
    Private,
}

/// Connection manager configuration for one logical endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on a single transport handshake attempt.
    pub connect_timeout: Duration,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Maximum reconnection attempts (0 = infinite).
    pub max_reconnect_attempts: u32,
    /// Initial reconnection delay.
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnection delay.
    pub max_reconnect_delay: Duration,
    /// Buffer size for the inbound raw-frame broadcast channel.
    pub frame_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            max_reconnect_attempts: 0, // Infinite retries
            initial_reconnect_delay: Duration::from_millis(1000),
            max_reconnect_delay: Duration::from_millis(30000),
            frame_buffer_size: 1000,
        }
    }
}

/// Session credential manager configuration (private endpoints).
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// How often to send a keep-alive. Must leave margin before the token ttl;
    /// the manager clamps it to half the reported ttl when it does not.
    pub renewal_interval: Duration,
    /// Bound on each create/keep-alive/close call.
    pub call_timeout: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            renewal_interval: Duration::from_secs(30 * 60),
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_reconnect_attempts, 0);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert!(config.initial_reconnect_delay < config.max_reconnect_delay);
    }

    #[test]
    fn test_credential_config_default() {
        let config = CredentialConfig::default();
        assert!(config.call_timeout < config.renewal_interval);
    }
}
