//! Network and per-session configuration.

use std::time::Duration;

/// Listener configuration for a performer.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Per-session settings.
    pub session: SessionConfig,
    /// Maximum time to wait for in-flight invocations during shutdown.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            session: SessionConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-session configuration controlling backpressure and framing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bounded mpsc channel capacity for outbound PDUs per session.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when queueing a PDU on a full session.
    pub send_timeout: Duration,
    /// Largest frame accepted or produced, in bytes.
    pub max_frame_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            max_frame_length: 8 * 1024 * 1024, // 8 MiB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.outbound_channel_capacity, 256);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.max_frame_length, 8_388_608);
    }
}
