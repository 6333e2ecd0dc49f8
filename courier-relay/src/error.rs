//! Error types for courier-relay.

/// Main error type for courier-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored payload is not valid data.
    #[error("corrupt queue entry for {recipient}: {reason}")]
    CorruptEntry {
        /// The recipient key the entry was queued under.
        recipient: String,
        /// Why the payload could not be used.
        reason: String,
    },

    /// Per-recipient queue depth cap reached.
    #[error("queue full for {recipient} (limit: {limit} entries)")]
    QueueFull {
        /// The recipient whose queue is full.
        recipient: String,
        /// The configured depth limit.
        limit: u64,
    },
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Invalid message format.
    #[error("invalid message format: {reason}")]
    InvalidMessage {
        /// Reason the message is invalid.
        reason: String,
    },

    /// Wire type error from courier-types.
    #[error(transparent)]
    Wire(#[from] courier_types::WireError),

    /// Handshake is missing a required parameter.
    #[error("missing or empty handshake parameter: {param}")]
    BadHandshake {
        /// The offending query parameter.
        param: &'static str,
    },

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },

    /// The hub has shut down and is no longer accepting events.
    #[error("hub unavailable")]
    HubClosed,
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
