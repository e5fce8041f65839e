//! Shared protocol constants for the incremental-install streaming channel

/// Request-command magic. The little-endian byte order of this value spells
/// `I N C R` on the wire.
pub const INCR_MAGIC: u32 = 0x52434E49;

/// Handshake the remote peer sends before any chunk.
pub const OKAY: &[u8; 4] = b"OKAY";

/// On-wire size of a block header: fileIdx u16 + type i8 + compression i8 +
/// blockIdx u32 + blockSize u16.
pub const HEADER_SIZE: usize = 2 + 1 + 1 + 4 + 2;

/// On-wire size of a request command: magic u32 + type i16 + fileIdx i16 +
/// blockIdx i32.
pub const COMMAND_SIZE: usize = 4 + 2 + 2 + 4;

// Request type IDs (keep numeric stable for wire compat)
pub mod request {
    pub const EXIT: i16 = 0;
    pub const BLOCK_MISSING: i16 = 1;
    pub const PREFETCH: i16 = 2;
}

// Centralized timing constants for the streaming loop and the trace watcher
pub mod timeouts {
    use std::time::Duration;

    /// Receiver poll timeout on (channel, cancel) in milliseconds.
    pub const POLL_MS: i32 = 5000;

    /// Sleep between retries when a wait-on-eof input runs dry.
    pub const EOF_WAIT: Duration = Duration::from_millis(10);

    /// Interval between ambient trace-tag rechecks.
    pub const TRACE_TAG_CHECK: Duration = Duration::from_secs(1);
}
