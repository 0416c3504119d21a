//! Tunables for clients and servers.

use std::time::Duration;

/// Default bound on one client round trip.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the server's wait for the next request.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default keepalive period of accepted TCP connections.
pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(10);

/// Default linger time of accepted TCP connections.
pub const DEFAULT_TCP_LINGER: Duration = Duration::from_secs(5);

/// Default size of the read and write buffers of a connection.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Configuration of a [`Client`](crate::client::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline applied to every request/response round trip.
    pub action_timeout: Duration,

    /// Initial capacity of the read buffer in bytes.
    pub read_buffer_size: usize,

    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the round trip deadline.
    pub fn action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }
}

/// Configuration of a [`Server`](crate::srv::Server) and its sessions.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a session waits for the next request (and for the
    /// handshake) before dropping the connection.
    pub idle_timeout: Duration,

    /// Initial capacity of the read buffer in bytes.
    pub read_buffer_size: usize,

    /// Write buffer size in bytes.
    pub write_buffer_size: usize,

    /// Keepalive probe period for TCP peers; `None` leaves it off.
    pub tcp_keepalive: Option<Duration>,

    /// How long closing a TCP connection waits for unsent data.
    pub tcp_linger: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            tcp_keepalive: Some(DEFAULT_TCP_KEEPALIVE),
            tcp_linger: Some(DEFAULT_TCP_LINGER),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle deadline.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn tcp_keepalive(mut self, period: Option<Duration>) -> Self {
        self.tcp_keepalive = period;
        self
    }

    pub fn tcp_linger(mut self, linger: Option<Duration>) -> Self {
        self.tcp_linger = linger;
        self
    }
}
