//! SQLite storage backend for courier-relay.

use super::{OfflineQueue, PreKeyStore};
use crate::error::StorageError;
use async_trait::async_trait;
use courier_types::{Identity, PreKeyBundle};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// SQLite-based queue and pre-key storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(path.to_str().unwrap_or("courier.db"))
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL,
                payload BLOB NOT NULL,
                enqueued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prekeys (
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                bundle BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_recipient_seq ON queue(recipient, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_expires ON queue(expires_at)")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(())
    }

    /// Total entries queued across all recipients (for metrics).
    pub async fn total_queued(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(count as u64)
    }

    /// Number of recipients with at least one queued entry (for metrics).
    pub async fn recipients_with_backlog(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT recipient) FROM queue")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(count as u64)
    }

    /// Number of stored pre-key bundles (for metrics).
    pub async fn total_bundles(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prekeys")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(count as u64)
    }

    fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl OfflineQueue for SqliteStorage {
    async fn enqueue(
        &self,
        recipient: &Identity,
        payload: &[u8],
        ttl_secs: u64,
    ) -> Result<(), StorageError> {
        let now = Self::current_timestamp();
        let expires_at = now + ttl_secs as i64;

        sqlx::query(
            r#"
            INSERT INTO queue (recipient, payload, enqueued_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(recipient.as_key())
        .bind(payload)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn pop_front(&self, recipient: &Identity) -> Result<Option<Vec<u8>>, StorageError> {
        // Single-statement head removal keeps pop atomic without a transaction
        let payload: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            DELETE FROM queue
            WHERE seq = (
                SELECT seq FROM queue WHERE recipient = ?1 ORDER BY seq ASC LIMIT 1
            )
            RETURNING payload
            "#,
        )
        .bind(recipient.as_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(payload)
    }

    async fn pending_count(&self, recipient: &Identity) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM queue WHERE recipient = ?1
            "#,
        )
        .bind(recipient.as_key())
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(count as u64)
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let now = Self::current_timestamp();

        let result = sqlx::query(
            r#"
            DELETE FROM queue WHERE expires_at <= ?1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PreKeyStore for SqliteStorage {
    async fn put_bundle(
        &self,
        identity: &Identity,
        bundle: &PreKeyBundle,
    ) -> Result<(), StorageError> {
        let bytes = bundle.to_bytes().map_err(|e| StorageError::CorruptEntry {
            recipient: identity.as_key(),
            reason: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO prekeys (user_id, device_id, bundle, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, device_id) DO UPDATE SET bundle = ?3, updated_at = ?4
            "#,
        )
        .bind(identity.user_id.as_str())
        .bind(identity.device_id.as_str())
        .bind(&bytes)
        .bind(Self::current_timestamp())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn get_bundle(
        &self,
        identity: &Identity,
    ) -> Result<Option<PreKeyBundle>, StorageError> {
        let row: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT bundle FROM prekeys WHERE user_id = ?1 AND device_id = ?2
            "#,
        )
        .bind(identity.user_id.as_str())
        .bind(identity.device_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        match row {
            Some(bytes) => {
                let bundle =
                    PreKeyBundle::from_bytes(&bytes).map_err(|e| StorageError::CorruptEntry {
                        recipient: identity.as_key(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(bundle))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(user: &str, device: &str) -> Identity {
        Identity::new(user, device).unwrap()
    }

    fn bundle(registration_id: u32) -> PreKeyBundle {
        PreKeyBundle {
            identity_key: vec![1; 32],
            signed_pre_key: vec![2; 32],
            signed_pre_key_signature: vec![3; 64],
            one_time_pre_key: vec![4; 32],
            registration_id,
        }
    }

    #[tokio::test]
    async fn pop_front_returns_fifo_order() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let to = ident("alice", "phone");

        storage.enqueue(&to, b"one", 3600).await.unwrap();
        storage.enqueue(&to, b"two", 3600).await.unwrap();
        storage.enqueue(&to, b"three", 3600).await.unwrap();

        assert_eq!(storage.pop_front(&to).await.unwrap().unwrap(), b"one");
        assert_eq!(storage.pop_front(&to).await.unwrap().unwrap(), b"two");
        assert_eq!(storage.pop_front(&to).await.unwrap().unwrap(), b"three");
        assert!(storage.pop_front(&to).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queues_are_independent_per_recipient() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let a = ident("alice", "phone");
        let b = ident("bob", "laptop");

        storage.enqueue(&a, b"for alice", 3600).await.unwrap();
        storage.enqueue(&b, b"for bob", 3600).await.unwrap();

        assert_eq!(storage.pending_count(&a).await.unwrap(), 1);
        assert_eq!(storage.pending_count(&b).await.unwrap(), 1);

        assert_eq!(storage.pop_front(&b).await.unwrap().unwrap(), b"for bob");
        // Alice's queue is untouched
        assert_eq!(storage.pending_count(&a).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_user_different_devices_have_separate_queues() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let phone = ident("alice", "phone");
        let tablet = ident("alice", "tablet");

        storage.enqueue(&phone, b"to phone", 3600).await.unwrap();

        assert_eq!(storage.pending_count(&phone).await.unwrap(), 1);
        assert_eq!(storage.pending_count(&tablet).await.unwrap(), 0);
        assert!(storage.pop_front(&tablet).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_front_on_empty_queue_is_none() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage
            .pop_front(&ident("nobody", "nowhere"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn payload_survives_byte_for_byte() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let to = ident("alice", "phone");
        let payload: Vec<u8> = (0u8..=255).collect();

        storage.enqueue(&to, &payload, 3600).await.unwrap();
        assert_eq!(storage.pop_front(&to).await.unwrap().unwrap(), payload);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_only_expired() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let to = ident("alice", "phone");

        storage.enqueue(&to, b"stale", 0).await.unwrap();
        storage.enqueue(&to, b"fresh", 3600).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let deleted = storage.cleanup_expired().await.unwrap();
        assert_eq!(deleted, 1);

        assert_eq!(storage.pop_front(&to).await.unwrap().unwrap(), b"fresh");
        assert!(storage.pop_front(&to).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prekey_bundle_roundtrip() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let id = ident("alice", "phone");

        assert!(storage.get_bundle(&id).await.unwrap().is_none());

        let b = bundle(7);
        storage.put_bundle(&id, &b).await.unwrap();
        assert_eq!(storage.get_bundle(&id).await.unwrap().unwrap(), b);
    }

    #[tokio::test]
    async fn prekey_put_replaces_existing_bundle() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let id = ident("alice", "phone");

        storage.put_bundle(&id, &bundle(1)).await.unwrap();
        storage.put_bundle(&id, &bundle(2)).await.unwrap();

        let stored = storage.get_bundle(&id).await.unwrap().unwrap();
        assert_eq!(stored.registration_id, 2);
    }

    #[tokio::test]
    async fn prekey_bundles_are_per_device() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let phone = ident("alice", "phone");
        let tablet = ident("alice", "tablet");

        storage.put_bundle(&phone, &bundle(1)).await.unwrap();

        assert!(storage.get_bundle(&phone).await.unwrap().is_some());
        assert!(storage.get_bundle(&tablet).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backed_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.db");
        let to = ident("alice", "phone");

        {
            let storage = SqliteStorage::new(&path).await.unwrap();
            storage.enqueue(&to, b"persisted", 3600).await.unwrap();
        }

        let reopened = SqliteStorage::new(&path).await.unwrap();
        assert_eq!(
            reopened.pop_front(&to).await.unwrap().unwrap(),
            b"persisted"
        );
    }

    #[tokio::test]
    async fn backlog_gauges_count_correctly() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        storage
            .enqueue(&ident("alice", "phone"), b"a", 3600)
            .await
            .unwrap();
        storage
            .enqueue(&ident("alice", "phone"), b"b", 3600)
            .await
            .unwrap();
        storage
            .enqueue(&ident("bob", "laptop"), b"c", 3600)
            .await
            .unwrap();
        storage
            .put_bundle(&ident("carol", "watch"), &bundle(1))
            .await
            .unwrap();

        assert_eq!(storage.total_queued().await.unwrap(), 3);
        assert_eq!(storage.recipients_with_backlog().await.unwrap(), 2);
        assert_eq!(storage.total_bundles().await.unwrap(), 1);
    }
}
