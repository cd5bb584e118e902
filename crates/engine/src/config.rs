use std::time::Duration;

use crate::{pump::DEFAULT_BUFFER_SIZE, session::SessionConfig};

/// Tuning shared by every bridge of a registry.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Intermediate buffer of each pump direction.
    pub buffer_size: usize,
    /// Bound for a session's drain and close handshake, and for `stop()` to wait on sessions.
    pub session_grace: Duration,
    /// Bound for opening the opposite side of an accepted connection.
    pub connect_timeout: Duration,
    /// Bound for an accept loop to exit after its bridge is closed.
    pub stop_timeout: Duration,
    /// Pause after a recoverable accept error before accepting again.
    pub accept_retry_delay: Duration,
    pub tcp_nodelay: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            session_grace: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            accept_retry_delay: Duration::from_millis(100),
            tcp_nodelay: true,
        }
    }
}

impl EngineConfig {
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            buffer_size: self.buffer_size,
            grace: self.session_grace,
        }
    }
}
