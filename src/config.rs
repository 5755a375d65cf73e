// ABOUTME: Defines ServerConfig and its builder, the tunables shared by every transport
// ABOUTME: Carries the default table (buffer sizes, connection caps, timeouts) transports fall back to

//! Server configuration — spec.md §3 `ServerConfig` and §6's default table.

use std::time::Duration;

/// Immutable server configuration, fixed once a `Server`/`DatagramServer` is
/// constructed.
///
/// Build one with [`ServerConfig::builder`], or use [`ServerConfig::default`]
/// for the defaults spec.md §6 specifies.
///
/// # Example
///
/// ```
/// use netcore::ServerConfig;
///
/// let config = ServerConfig::builder()
///     .max_connections(500)
///     .heartbeat_interval_ms(15_000)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Size of each pooled read buffer, and the socket's `SO_RCVBUF`.
    pub read_buffer_size: usize,
    /// The socket's `SO_SNDBUF`.
    pub write_buffer_size: usize,
    /// Admission-control cap; excess accepts are dropped with no callback.
    pub max_connections: usize,
    /// Per-connection outbound queue depth; excess `send` calls are dropped.
    pub max_send_queue_size: usize,
    /// Upper bound on a framed message's total size, in bytes.
    pub max_package_size: usize,
    /// Read-idle threshold, reserved (see `SPEC_FULL.md` §9 — not currently
    /// consulted; the heartbeat interval drives idle detection instead).
    pub connection_read_timeout_ms: u64,
    /// Heartbeat timer period; a connection is considered idle and closed
    /// after `2 * heartbeat_interval_ms` without a successful read or write.
    pub heartbeat_interval_ms: u64,
    /// Whether `TCP_NODELAY` is set on accepted sockets.
    pub tcp_no_delay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8 * 1024,
            write_buffer_size: 8 * 1024,
            max_connections: 10_000,
            max_send_queue_size: 1_000,
            max_package_size: 64 * 1024,
            connection_read_timeout_ms: 30_000,
            heartbeat_interval_ms: 60_000,
            tcp_no_delay: true,
        }
    }
}

impl ServerConfig {
    /// Start building a config from the defaults in spec.md §6.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// The idle threshold derived from `heartbeat_interval_ms`: a connection
    /// that hasn't read or written successfully within this long is closed.
    /// See `SPEC_FULL.md` §9 — this is deliberately `2 *
    /// heartbeat_interval_ms`, not `connection_read_timeout_ms`.
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.saturating_mul(2))
    }

    /// The heartbeat timer period as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Fluent builder for [`ServerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Size of each pooled read buffer and `SO_RCVBUF`.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// `SO_SNDBUF`.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Admission-control cap on concurrent connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Per-connection outbound queue depth.
    pub fn max_send_queue_size(mut self, size: usize) -> Self {
        self.config.max_send_queue_size = size;
        self
    }

    /// Upper bound on a framed message's total size.
    pub fn max_package_size(mut self, size: usize) -> Self {
        self.config.max_package_size = size;
        self
    }

    /// Read-idle threshold in milliseconds (reserved, see
    /// [`ServerConfig::connection_read_timeout_ms`]).
    pub fn connection_read_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.connection_read_timeout_ms = timeout_ms;
        self
    }

    /// Heartbeat timer period in milliseconds.
    pub fn heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Whether to set `TCP_NODELAY` on accepted sockets.
    pub fn tcp_no_delay(mut self, enable: bool) -> Self {
        self.config.tcp_no_delay = enable;
        self
    }

    /// Finish building the config.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
