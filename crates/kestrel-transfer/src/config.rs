//! Defaults and process-level tuning.

use std::time::Duration;

/// Per-chunk inactivity timeout while a transfer is active.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Inactivity timeout for the initial handshake, where the peer may need to
/// open resources before its first chunk.
pub const DEFAULT_INITIAL_CHUNK_TIMEOUT: Duration = Duration::from_secs(4);

/// Per-stall retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Total retry budget over a whole session.
pub const DEFAULT_MAX_LIFETIME_RETRIES: u32 = 1500;

/// Window-extension threshold divisor: the receiver extends once less than
/// `max_window / divisor` of the window remains unacknowledged.
pub const DEFAULT_EXTEND_WINDOW_DIVISOR: u32 = 2;

/// Concurrent session slots owned by one event loop.
pub const MAX_SESSIONS: usize = 8;

const DEFAULT_QUEUE_DEPTH: usize = 32;

/// Work-queue capacity for the transfer event loop.
///
/// Chunks arriving while the queue is full are dropped and recovered by the
/// protocol's retries, so depth trades memory for retransmissions.
pub fn queue_depth() -> usize {
    std::env::var("KESTREL_TRANSFER_QUEUE_DEPTH")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_QUEUE_DEPTH)
}

/// Service id of the transfer service.
pub const TRANSFER_SERVICE_ID: u32 = 0x21;

/// Method id of the read stream (server resource to client).
pub const READ_METHOD_ID: u32 = 1;

/// Method id of the write stream (client data to server).
pub const WRITE_METHOD_ID: u32 = 2;
