//! Tunables for the server and the client.
//!
//! Defaults: a five-minute idle limit on server reads and a three-second
//! connect bound on the client.

use std::time::Duration;

/// Longest a server handler waits for the next read before dropping the peer.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Upper bound for a single client connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// How long a fresh client connection listens for a rejection frame.
pub const DEFAULT_REJECTION_GRACE: Duration = Duration::from_millis(250);
/// Bounded wait when joining the client receive task during teardown.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Per-socket bound on a single write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Size of the buffer used for each socket read.
pub const DEFAULT_READ_BUFFER: usize = 4096;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub rejection_grace: Duration,
    pub join_timeout: Duration,
    pub write_timeout: Duration,
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            rejection_grace: DEFAULT_REJECTION_GRACE,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}
