//! Storage layer for courier-relay.
//!
//! Two concerns share one backend: the durable per-recipient message queue
//! used for offline delivery, and the pre-key bundle registry.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use courier_types::{Identity, PreKeyBundle};

/// A durable per-recipient FIFO of serialized frames.
///
/// Append at tail, pop from head; ordering holds per recipient only. Both
/// operations must be atomic per key, with no cross-key coupling.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Append a serialized frame to the recipient's queue tail.
    ///
    /// The entry expires `ttl_secs` from now and becomes eligible for
    /// [`cleanup_expired`](Self::cleanup_expired).
    async fn enqueue(
        &self,
        recipient: &Identity,
        payload: &[u8],
        ttl_secs: u64,
    ) -> Result<(), StorageError>;

    /// Remove and return the head of the recipient's queue.
    ///
    /// Returns `None` when the queue is empty.
    async fn pop_front(&self, recipient: &Identity) -> Result<Option<Vec<u8>>, StorageError>;

    /// Number of entries currently queued for the recipient.
    async fn pending_count(&self, recipient: &Identity) -> Result<u64, StorageError>;

    /// Remove expired entries across all recipients.
    ///
    /// Returns the number of entries deleted.
    async fn cleanup_expired(&self) -> Result<u64, StorageError>;
}

/// Per-identity pre-key bundle records. Opaque to the relay.
#[async_trait]
pub trait PreKeyStore: Send + Sync {
    /// Store (or replace) the bundle for an identity.
    async fn put_bundle(
        &self,
        identity: &Identity,
        bundle: &PreKeyBundle,
    ) -> Result<(), StorageError>;

    /// Fetch the bundle for an identity, if one was published.
    async fn get_bundle(&self, identity: &Identity)
        -> Result<Option<PreKeyBundle>, StorageError>;
}
