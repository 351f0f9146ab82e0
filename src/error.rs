//! Error types for the session cache.

use std::fmt;

/// Result type for session cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the session cache.
///
/// Variants fall into two families. Cache-layer errors (pool, breaker,
/// transport, decoding) are recovered inside [`SessionCache`](crate::SessionCache)
/// by falling back to the system-of-record. Repository errors are the only
/// ones a validation caller ever sees.
#[derive(Debug, Clone)]
pub enum Error {
    /// No pooled connection became available within the acquire timeout.
    ///
    /// Retryable. The pool was at `max_size` and no lease was returned in time.
    PoolTimeout(String),

    /// The pool was closed while the caller was waiting or trying to acquire.
    PoolClosed,

    /// The circuit breaker rejected the call without running it.
    ///
    /// Returned immediately while the breaker is OPEN, or while a HALF_OPEN
    /// probe is already in flight.
    CircuitOpen,

    /// A wrapped call exceeded the breaker's request timeout.
    Timeout(String),

    /// Establishing or using a connection to the cache service failed.
    ///
    /// The connection involved is discarded rather than returned to the pool.
    Connection(String),

    /// The cache service answered with an error (wrong type, protocol error, ...).
    Backend(String),

    /// A cached hash could not be decoded into a session record.
    ///
    /// **Recovery:** treated as a miss; the entry is deleted eagerly.
    Deserialization(String),

    /// A cached record decoded but failed integrity checks
    /// (token hash mismatch, schema version mismatch).
    ///
    /// **Recovery:** treated as a miss; the entry is deleted eagerly.
    Integrity(String),

    /// The system-of-record query failed.
    ///
    /// There is no further fallback, so this propagates to the caller.
    Repository(String),

    /// Invalid configuration.
    Config(String),
}

impl Error {
    /// Whether this error belongs to the cache layer and must be recovered
    /// locally by falling back to the system-of-record.
    pub fn is_cache_layer(&self) -> bool {
        !matches!(self, Error::Repository(_) | Error::Config(_))
    }

    /// Whether the connection that produced this error should be discarded.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    /// Whether the error came from a corrupt or foreign cache entry.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Error::Deserialization(_) | Error::Integrity(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PoolTimeout(msg) => write!(f, "Pool timeout: {}", msg),
            Error::PoolClosed => write!(f, "Pool closed"),
            Error::CircuitOpen => write!(f, "Circuit open"),
            Error::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Error::Connection(msg) => write!(f, "Connection error: {}", msg),
            Error::Backend(msg) => write!(f, "Backend error: {}", msg),
            Error::Deserialization(msg) => write!(f, "Deserialization error: {}", msg),
            Error::Integrity(msg) => write!(f, "Integrity error: {}", msg),
            Error::Repository(msg) => write!(f, "Repository error: {}", msg),
            Error::Config(msg) => write!(f, "Config error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Connection(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            Error::Connection(format!("Redis error: {}", e))
        } else if e.is_timeout() {
            Error::Timeout(format!("Redis error: {}", e))
        } else {
            Error::Backend(format!("Redis error: {}", e))
        }
    }
}
