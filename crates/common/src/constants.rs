/// Default deadline for a forwarded request, covering send back-pressure and the wait for a response
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Heartbeat interval used by agents to keep the session alive (30 seconds)
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// A session that sends no frame for this long is torn down (90 seconds)
pub const SESSION_IDLE_TIMEOUT_SECS: u64 = 90;

/// Consecutive unparseable frames tolerated before a session is torn down
pub const MAX_MALFORMED_FRAMES: u32 = 8;

/// Capacity of a session's outbound frame queue; senders wait when it is full
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Response bytes buffered for one requester before that request is failed (16 MiB)
pub const MAX_BUFFERED_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// Maximum size of a single body chunk carried in one frame (64 KiB)
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum request body accepted from a public client (10 MiB)
pub const MAX_BODY_SIZE_BYTES: usize = 10 * 1024 * 1024;

/// How long closed sessions stay visible in connection status (1 hour)
pub const STATUS_RETENTION_SECS: u64 = 3600;

/// Upper bound on closed sessions retained in connection status
pub const MAX_CLOSED_STATUS_ENTRIES: usize = 1024;

/// Interval of the background cleanup task (60 seconds)
pub const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Length of generated subdomains
pub const RANDOM_SUBDOMAIN_LENGTH: usize = 6;

/// Length of generated tunnel user secret keys
pub const SECRET_KEY_LENGTH: usize = 16;

/// Upgrade request header carrying the requested subdomain
pub const SUBDOMAIN_HEADER: &str = "x-tunnel-subdomain";

/// Upgrade request header carrying the tunnel user's secret key
pub const SECRET_KEY_HEADER: &str = "x-secret-key";

/// Response header naming the tunnel failure class on router-generated errors
pub const TUNNEL_ERROR_HEADER: &str = "x-tunnel-error";

/// Minimum delay for exponential backoff reconnection (1 second)
pub const RECONNECT_MIN_DELAY_MS: u64 = 1000;

/// Maximum delay for exponential backoff reconnection (60 seconds)
pub const RECONNECT_MAX_DELAY_MS: u64 = 60000;

/// Multiplier for exponential backoff reconnection
pub const RECONNECT_MULTIPLIER: f64 = 2.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_values() {
        const _: () = assert!(HEARTBEAT_INTERVAL_SECS < SESSION_IDLE_TIMEOUT_SECS);
        const _: () = assert!(BODY_CHUNK_SIZE < MAX_BODY_SIZE_BYTES);
        const _: () = assert!(BODY_CHUNK_SIZE < MAX_BUFFERED_RESPONSE_BYTES);
        const _: () = assert!(RECONNECT_MIN_DELAY_MS < RECONNECT_MAX_DELAY_MS);
        const _: () = assert!(RECONNECT_MULTIPLIER > 1.0);
        const _: () = assert!(MAX_MALFORMED_FRAMES > 0);

        assert_eq!(BODY_CHUNK_SIZE, 65536);
    }
}
