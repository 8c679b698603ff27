//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host for the TCP listener (default `"127.0.0.1"`).
    pub host: String,
    /// TCP port (default `0` for auto-assign).
    pub port: u16,
    /// Local socket serving both the packet and the text protocol.
    pub socket_path: Option<PathBuf>,
    /// Capacity of each display client's outbound channel.
    pub max_send_queue: usize,
    /// Largest accepted packet frame in bytes.
    pub max_frame_len: usize,
    /// Trailing debounce window for display clients.
    pub client_debounce_ms: u64,
    /// Fixed coalescing delay for batches headed to an external backend.
    pub backend_batch_delay_ms: u64,
    /// Minimum spacing between non-interactive refreshes.
    pub refresh_throttle_ms: u64,
    /// How long a dropped display client stays reconnectable.
    pub reconnect_grace_secs: u64,
    /// Idle sessions are closed after this long; `0` keeps them forever.
    pub session_timeout_secs: u64,
    /// Upper bound on a long-poll wait.
    pub max_poll_wait_ms: u64,
    pub cleanup_interval_secs: u64,
    pub registry_prune_interval_secs: u64,
    /// Interval between WebSocket pings.
    pub heartbeat_interval_secs: u64,
    /// A display client silent for this long is parked.
    pub heartbeat_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            socket_path: Some(PathBuf::from("/tmp/varsync.sock")),
            max_send_queue: 256,
            max_frame_len: 10 * 1024 * 1024,
            client_debounce_ms: 20,
            backend_batch_delay_ms: 10,
            refresh_throttle_ms: 50,
            reconnect_grace_secs: 30,
            session_timeout_secs: 86_400,
            max_poll_wait_ms: 30_000,
            cleanup_interval_secs: 1,
            registry_prune_interval_secs: 30,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
        }
    }
}

impl ServerConfig {
    pub fn client_debounce(&self) -> Duration {
        Duration::from_millis(self.client_debounce_ms)
    }

    pub fn backend_batch_delay(&self) -> Duration {
        Duration::from_millis(self.backend_batch_delay_ms)
    }

    pub fn refresh_throttle(&self) -> Duration {
        Duration::from_millis(self.refresh_throttle_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
    }

    pub fn max_poll_wait(&self) -> Duration {
        Duration::from_millis(self.max_poll_wait_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn registry_prune_interval(&self) -> Duration {
        Duration::from_secs(self.registry_prune_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}
