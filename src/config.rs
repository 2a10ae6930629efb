use std::time::Duration;

use crate::connector::{DEFAULT_INITIAL_RETRY_DELAY, DEFAULT_MAX_RETRY_DELAY};
use crate::tcp_connection::DEFAULT_HIGH_WATERMARK;

/// Options for a [`crate::tcp_server::TcpServer`], builder-style like
/// muduo's `TcpServer::setThreadNum` / `EventLoopThreadPool::setThreadNum`
/// setters (see `EventLoopThreadPool.h`), consuming `self` rather than
/// mutating in place since nothing here is read until `TcpServer::new`.
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Number of worker loops. `0` means the accept loop also serves.
    pub num_threads: usize,
    /// `SO_REUSEPORT` on the listening socket.
    pub reuse_port: bool,
    /// `TCP_NODELAY` on accepted connections.
    pub tcp_no_delay: bool,
    /// `SO_KEEPALIVE` on accepted connections.
    pub keep_alive: bool,
    /// Output-buffer size at which `on_high_watermark` fires.
    pub high_watermark: usize,
    /// Poll timeout used by worker loops when no timer is pending.
    pub poll_timeout: Duration,
}

impl Default for TcpServerConfig {
    fn default() -> TcpServerConfig {
        TcpServerConfig {
            num_threads: 0,
            reuse_port: false,
            tcp_no_delay: true,
            keep_alive: true,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            poll_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpServerConfig {
    pub fn new() -> TcpServerConfig {
        TcpServerConfig::default()
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn reuse_port(mut self, on: bool) -> Self {
        self.reuse_port = on;
        self
    }

    pub fn tcp_no_delay(mut self, on: bool) -> Self {
        self.tcp_no_delay = on;
        self
    }

    pub fn keep_alive(mut self, on: bool) -> Self {
        self.keep_alive = on;
        self
    }

    pub fn high_watermark(mut self, bytes: usize) -> Self {
        self.high_watermark = bytes;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

/// Options for a [`crate::connector::Connector`]'s back-off schedule.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorConfig {
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> ConnectorConfig {
        ConnectorConfig {
            initial_retry_delay: DEFAULT_INITIAL_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl ConnectorConfig {
    pub fn new() -> ConnectorConfig {
        ConnectorConfig::default()
    }

    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = TcpServerConfig::default();
        assert_eq!(cfg.num_threads, 0);
        assert!(cfg.keep_alive);
        assert_eq!(cfg.high_watermark, DEFAULT_HIGH_WATERMARK);
    }

    #[test]
    fn builder_overrides_fields() {
        let cfg = TcpServerConfig::new().num_threads(4).reuse_port(true);
        assert_eq!(cfg.num_threads, 4);
        assert!(cfg.reuse_port);
    }
}
