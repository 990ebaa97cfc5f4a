use std::time::Duration;

/// Pool and connection tuning knobs.
///
/// Consumed by the connection manager and the pool resizer. Plain values,
/// no file format.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cap on open HTTP/1 connections per pool.
    pub max_http1_connections: usize,
    /// Cap on open HTTP/2 connections per pool. HTTP/2 multiplexes many
    /// exchanges over one connection, so this is usually much smaller.
    pub max_http2_connections: usize,
    /// Cap on concurrent connection attempts per pool.
    pub max_pending_connections: usize,
    /// Cap on acquires allowed to queue while no connection is free.
    pub max_pending_acquires: usize,
    /// How long an acquire may wait for a connection before failing.
    pub acquire_timeout: Duration,
    /// Idle connections parked longer than this are closed instead of reused.
    pub idle_timeout: Duration,
    /// How long a response read may stall before the connection is
    /// considered unhealthy and closed.
    pub read_timeout: Duration,
    /// When false, connections are never returned to the pool; every
    /// exchange gets a fresh connection.
    pub keep_alive: bool,
    /// A response body buffered past this many bytes devolves to streaming
    /// delivery even if the socket still has data ready.
    pub buffer_body_limit: usize,
    /// Cap on a fully-collected response body (`exchange`). Exceeding it
    /// fails the exchange with `Error::BodyTooLarge`.
    pub max_body_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_http1_connections: 8,
            max_http2_connections: 1,
            max_pending_connections: 4,
            max_pending_acquires: 64,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
            keep_alive: true,
            buffer_body_limit: 64 * 1024,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl PoolConfig {
    /// Cap on open HTTP/1 connections per pool.
    pub fn with_max_http1_connections(mut self, max: usize) -> Self {
        self.max_http1_connections = max;
        self
    }

    /// Cap on open HTTP/2 connections per pool.
    pub fn with_max_http2_connections(mut self, max: usize) -> Self {
        self.max_http2_connections = max;
        self
    }

    /// Cap on concurrent connection attempts per pool.
    pub fn with_max_pending_connections(mut self, max: usize) -> Self {
        self.max_pending_connections = max;
        self
    }

    /// Cap on queued acquires.
    pub fn with_max_pending_acquires(mut self, max: usize) -> Self {
        self.max_pending_acquires = max;
        self
    }

    /// How long an acquire may wait.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// How long a parked connection stays reusable.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// How long a response read may stall.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Whether connections are returned to the pool at all.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Buffered bytes past which a body devolves to streaming.
    pub fn with_buffer_body_limit(mut self, limit: usize) -> Self {
        self.buffer_body_limit = limit;
        self
    }

    /// Cap on a fully-collected response body.
    pub fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }
}
