//! Rate limiting for courier-relay.
//!
//! Provides protection against connection flooding and message spam.
//!
//! ## Design Notes
//!
//! Clients may sit behind shared NATs or proxies, so limiting by IP address
//! punishes the wrong party. Instead we rate limit by:
//! - **identity key** (`user_id:device_id`) for connection attempts
//! - **identity key** for message operations
//!
//! Both use the governor crate's keyed rate limiters backed by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits connection attempts per identity key.
    connection_limiter: Arc<KeyedLimiter<String>>,

    /// Limits message operations per identity key.
    message_limiter: Arc<KeyedLimiter<String>>,

    /// Global rate limiter across all clients.
    ///
    /// Prevents aggregate overload even if individual clients are within
    /// limits.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<String>")
            .field("message_limiter", &"KeyedLimiter<String>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configured values are zero.
    pub fn new(config: &LimitsConfig) -> Self {
        let connections_per_minute = NonZeroU32::new(config.connections_per_minute)
            .expect("connections_per_minute must be > 0");
        let connection_quota = Quota::per_minute(connections_per_minute);

        let messages_per_minute =
            NonZeroU32::new(config.messages_per_minute).expect("messages_per_minute must be > 0");
        let message_quota = Quota::per_minute(messages_per_minute);

        let global_rps = NonZeroU32::new(config.global_requests_per_second)
            .expect("global_requests_per_second must be > 0");
        let global_quota = Quota::per_second(global_rps);

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            message_limiter: Arc::new(RateLimiter::keyed(message_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a connection attempt by this identity is allowed.
    pub fn check_connection(&self, identity_key: &str) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(&identity_key.to_string())
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if a message from this identity is allowed.
    pub fn check_message(&self, identity_key: &str) -> Result<(), RateLimitError> {
        self.message_limiter
            .check_key(&identity_key.to_string())
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Check if the global request rate is within limits.
    ///
    /// This is a server-wide rate limit that caps aggregate throughput
    /// regardless of individual client limits.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Get the number of tracked connection keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Get the number of tracked message keys (for metrics).
    pub fn message_keys_count(&self) -> usize {
        self.message_limiter.len()
    }

    /// Evict stale entries from the keyed rate limiter DashMaps.
    ///
    /// Over time, disconnected clients leave entries in the DashMap.
    /// `retain_recent()` removes entries whose rate limit cells have fully
    /// recharged (i.e., idle clients). Call periodically from cleanup task.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.message_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many connection attempts from this identity.
    ConnectionLimitExceeded,
    /// Too many messages from this identity.
    MessageLimitExceeded,
    /// Global request rate exceeded across all clients.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLimitExceeded => {
                write!(f, "connection rate limit exceeded")
            }
            Self::MessageLimitExceeded => {
                write!(f, "message rate limit exceeded")
            }
            Self::GlobalLimitExceeded => {
                write!(f, "global rate limit exceeded")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
