//! The Hub: single serialization point for the connection directory.
//!
//! All directory reads and writes happen inside one spawned task consuming a
//! bounded event channel. Connections and the HTTP layer hold an [`Hub`]
//! handle and talk to the task through [`Hub::register`], [`Hub::deregister`]
//! and [`Hub::route`]; the three operations are mutually exclusive because
//! the loop processes one event at a time.

use crate::config::Config;
use crate::connection::ConnectionId;
use crate::error::{ProtocolError, RelayError, StorageError};
use crate::limits::RateLimits;
use crate::storage::{OfflineQueue, SqliteStorage};
use courier_types::{Frame, Identity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Capacity of the hub's event mailbox.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
/// Thread-safe via `AtomicU64` — no locks needed for incrementing.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total WebSocket connections accepted.
    pub connections_total: AtomicU64,
    /// Total frames delivered to a live connection.
    pub delivered_total: AtomicU64,
    /// Total frames appended to the durable queue.
    pub queued_total: AtomicU64,
    /// Total frames drained from the durable queue into a fresh connection.
    pub drained_total: AtomicU64,
    /// Total inbound frames dropped as malformed.
    pub malformed_total: AtomicU64,
    /// Total connections dropped for not draining their outbound buffer.
    pub slow_consumer_closes: AtomicU64,
    /// Total connections superseded by a re-registration of their identity.
    pub superseded_total: AtomicU64,
    /// Total durable-queue failures (message dropped for that attempt).
    pub storage_errors_total: AtomicU64,
    /// Total rate limit rejections (connection + message + global).
    pub rate_limit_hits: AtomicU64,
    /// Total payload bytes received from clients.
    pub bytes_received: AtomicU64,
    /// Total payload bytes written to clients.
    pub bytes_sent: AtomicU64,
    /// Current number of directory entries.
    pub directory_size: AtomicUsize,
}

/// Handle to the relay core, constructed once at startup.
///
/// Cheap to share via `Arc`; every connection and the HTTP layer get one.
pub struct Hub {
    config: Config,
    storage: Arc<SqliteStorage>,
    rate_limits: RateLimits,
    metrics: Arc<RelayMetrics>,
    events: mpsc::Sender<HubEvent>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Start the hub: spawns the directory task and returns the shared
    /// handle plus the task's join handle (joined after [`Hub::stop`]).
    pub fn start(config: Config, storage: SqliteStorage) -> (Arc<Self>, JoinHandle<()>) {
        let storage = Arc::new(storage);
        let metrics = Arc::new(RelayMetrics::default());
        let rate_limits = RateLimits::new(&config.limits);
        let (events, mailbox) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let directory = Directory {
            entries: HashMap::new(),
            queue: storage.clone(),
            metrics: metrics.clone(),
            message_ttl: config.storage.message_ttl_secs,
            max_queue_depth: config.storage.max_queue_depth,
            drain_send_timeout: config.connection.write_timeout(),
        };
        let task = tokio::spawn(directory.run(mailbox));

        let hub = Arc::new(Self {
            config,
            storage,
            rate_limits,
            metrics,
            events,
        });
        (hub, task)
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Get a clone of the storage Arc for background tasks.
    pub fn storage_arc(&self) -> Arc<SqliteStorage> {
        self.storage.clone()
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Current number of registered connections.
    pub fn active_connections(&self) -> usize {
        self.metrics.directory_size.load(Ordering::Relaxed)
    }

    /// Register a connection's outbound buffer under its identity.
    ///
    /// Resolves once the directory insert **and** the offline backlog drain
    /// have completed, so the caller can hold off inbound traffic until the
    /// queued history is in its buffer. A previous registration under the
    /// same identity is superseded and its buffer closed.
    pub async fn register(
        &self,
        identity: Identity,
        id: ConnectionId,
        outbound: mpsc::Sender<String>,
    ) -> Result<(), RelayError> {
        let (done, ack) = oneshot::channel();
        self.events
            .send(HubEvent::Register {
                identity,
                id,
                outbound,
                done,
            })
            .await
            .map_err(|_| ProtocolError::HubClosed)?;
        ack.await.map_err(|_| ProtocolError::HubClosed)?;
        Ok(())
    }

    /// Remove a connection from the directory.
    ///
    /// A no-op if the identity has since been re-registered by a newer
    /// connection; only the entry owning `id` is ever removed.
    pub async fn deregister(&self, identity: Identity, id: ConnectionId) {
        let _ = self.events.send(HubEvent::Deregister { identity, id }).await;
    }

    /// Submit a frame for delivery-or-enqueue.
    ///
    /// Fire-and-forget from the sender's perspective: the result only
    /// reports whether the hub accepted the event, never whether the
    /// recipient got the frame. A frame whose `to` is not a well-formed
    /// identity is dropped here without error.
    pub async fn route(&self, frame: Frame) -> Result<(), RelayError> {
        let to = match frame.recipient() {
            Ok(to) => to,
            Err(e) => {
                tracing::debug!(to = %frame.to, "dropping frame with malformed recipient: {e}");
                self.metrics.malformed_total.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let payload = frame.to_text().map_err(ProtocolError::Wire)?;
        self.events
            .send(HubEvent::Route { to, payload })
            .await
            .map_err(|_| ProtocolError::HubClosed)?;
        Ok(())
    }

    /// Stop the directory task. Pending events ahead of the stop are still
    /// processed; events submitted afterwards fail with `HubClosed`.
    pub async fn stop(&self) {
        let _ = self.events.send(HubEvent::Shutdown).await;
    }
}

/// Events consumed by the directory task.
enum HubEvent {
    Register {
        identity: Identity,
        id: ConnectionId,
        outbound: mpsc::Sender<String>,
        done: oneshot::Sender<()>,
    },
    Deregister {
        identity: Identity,
        id: ConnectionId,
    },
    Route {
        to: Identity,
        payload: String,
    },
    Shutdown,
}

/// A live directory entry.
struct Entry {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
}

/// The task-private directory state. Never leaves the hub task.
struct Directory {
    entries: HashMap<Identity, Entry>,
    queue: Arc<SqliteStorage>,
    metrics: Arc<RelayMetrics>,
    message_ttl: u64,
    max_queue_depth: u64,
    drain_send_timeout: Duration,
}

impl Directory {
    async fn run(mut self, mut mailbox: mpsc::Receiver<HubEvent>) {
        while let Some(event) = mailbox.recv().await {
            match event {
                HubEvent::Register {
                    identity,
                    id,
                    outbound,
                    done,
                } => {
                    self.handle_register(identity, id, outbound).await;
                    let _ = done.send(());
                }
                HubEvent::Deregister { identity, id } => {
                    if self.remove_if_current(&identity, id) {
                        tracing::debug!(%identity, conn = %id, "deregistered");
                    }
                }
                HubEvent::Route { to, payload } => self.handle_route(to, payload).await,
                HubEvent::Shutdown => break,
            }
        }
        tracing::info!("hub directory task stopped");
    }

    async fn handle_register(
        &mut self,
        identity: Identity,
        id: ConnectionId,
        outbound: mpsc::Sender<String>,
    ) {
        let entry = Entry {
            id,
            outbound: outbound.clone(),
        };
        if let Some(prev) = self.entries.insert(identity.clone(), entry) {
            // Newest registration wins; dropping the old sender closes the
            // superseded writer once it has flushed.
            tracing::info!(%identity, old = %prev.id, new = %id, "superseding connection");
            self.metrics.superseded_total.fetch_add(1, Ordering::Relaxed);
        }
        self.publish_size();
        tracing::debug!(%identity, conn = %id, "registered");

        self.drain_backlog(&identity, id, &outbound).await;
    }

    /// Move every queued frame for `identity` into the fresh connection's
    /// buffer, head first. Runs inside the hub loop, so routes targeting the
    /// same identity are ordered entirely before or after the drain.
    async fn drain_backlog(
        &mut self,
        identity: &Identity,
        id: ConnectionId,
        outbound: &mpsc::Sender<String>,
    ) {
        loop {
            let payload = match self.queue.pop_front(identity).await {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(%identity, "queue drain failed: {e}");
                    self.metrics.storage_errors_total.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };

            let text = match String::from_utf8(payload) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(%identity, "skipping corrupt queue entry: {e}");
                    self.metrics.storage_errors_total.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let sent =
                tokio::time::timeout(self.drain_send_timeout, outbound.send(text.clone())).await;
            match sent {
                Ok(Ok(())) => {
                    self.metrics.drained_total.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(_)) | Err(_) => {
                    // Buffer closed or wedged. Put the frame back (tail) so it
                    // is not lost, then drop the connection.
                    if let Err(e) = self
                        .queue
                        .enqueue(identity, text.as_bytes(), self.message_ttl)
                        .await
                    {
                        tracing::error!(%identity, "failed to re-queue after drain stall: {e}");
                        self.metrics.storage_errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                    self.remove_if_current(identity, id);
                    self.metrics.slow_consumer_closes.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%identity, conn = %id, "connection stalled during drain, dropped");
                    break;
                }
            }
        }
    }

    async fn handle_route(&mut self, to: Identity, payload: String) {
        let Some(entry) = self.entries.get(&to) else {
            self.enqueue_offline(&to, payload).await;
            return;
        };
        let id = entry.id;

        match entry.outbound.try_send(payload) {
            Ok(()) => {
                self.metrics.delivered_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(payload)) => {
                // Recipient is connected but not draining. Dropping it beats
                // blocking the hub or buffering without bound; the frame goes
                // to the durable queue for the next registration.
                tracing::warn!(%to, conn = %id, "outbound buffer full, dropping slow consumer");
                self.entries.remove(&to);
                self.publish_size();
                self.metrics.slow_consumer_closes.fetch_add(1, Ordering::Relaxed);
                self.enqueue_offline(&to, payload).await;
            }
            Err(TrySendError::Closed(payload)) => {
                // Writer already gone; the entry is stale. Treat as offline.
                self.remove_if_current(&to, id);
                self.enqueue_offline(&to, payload).await;
            }
        }
    }

    async fn enqueue_offline(&mut self, to: &Identity, payload: String) {
        let depth = match self.queue.pending_count(to).await {
            Ok(depth) => depth,
            Err(e) => {
                tracing::error!(%to, "queue depth check failed, dropping frame: {e}");
                self.metrics.storage_errors_total.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if depth >= self.max_queue_depth {
            let err = StorageError::QueueFull {
                recipient: to.as_key(),
                limit: self.max_queue_depth,
            };
            tracing::warn!("dropping frame: {err}");
            self.metrics.storage_errors_total.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self
            .queue
            .enqueue(to, payload.as_bytes(), self.message_ttl)
            .await
        {
            Ok(()) => {
                self.metrics.queued_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Non-fatal to the hub: the frame is lost for this attempt,
                // routing of other messages continues.
                tracing::error!(%to, "durable enqueue failed: {e}");
                self.metrics.storage_errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn remove_if_current(&mut self, identity: &Identity, id: ConnectionId) -> bool {
        match self.entries.get(identity) {
            Some(entry) if entry.id == id => {
                self.entries.remove(identity);
                self.publish_size();
                true
            }
            _ => false,
        }
    }

    fn publish_size(&self) {
        self.metrics
            .directory_size
            .store(self.entries.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::value::RawValue;

    fn ident(user: &str, device: &str) -> Identity {
        Identity::new(user, device).unwrap()
    }

    fn frame(from: &str, to: &str, body: &str) -> Frame {
        Frame {
            kind: "message".into(),
            from: from.into(),
            to: to.into(),
            content: RawValue::from_string(body.to_string()).unwrap(),
        }
    }

    async fn start_hub() -> (Arc<Hub>, JoinHandle<()>) {
        let storage = SqliteStorage::in_memory().await.unwrap();
        Hub::start(Config::default(), storage)
    }

    /// Register-and-drop a throwaway identity. Because events are processed
    /// in order, the ack guarantees every previously submitted event has
    /// been handled.
    async fn settle(hub: &Arc<Hub>) {
        let (tx, _rx) = mpsc::channel(1);
        let id = ConnectionId::new();
        let identity = ident("settle", "probe");
        hub.register(identity.clone(), id, tx).await.unwrap();
        hub.deregister(identity, id).await;
    }

    async fn recv(rx: &mut mpsc::Receiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for delivery")
    }

    #[tokio::test]
    async fn route_to_registered_identity_delivers_live() {
        let (hub, _task) = start_hub().await;
        let bob = ident("bob", "laptop");

        let (tx, mut rx) = mpsc::channel(8);
        hub.register(bob.clone(), ConnectionId::new(), tx).await.unwrap();

        hub.route(frame("alice:phone", "bob:laptop", r#"{"n":1}"#))
            .await
            .unwrap();

        let text = recv(&mut rx).await.unwrap();
        let delivered = Frame::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(delivered.from, "alice:phone");
        assert_eq!(delivered.content.get(), r#"{"n":1}"#);
        assert_eq!(hub.metrics().delivered_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn route_to_absent_identity_queues_durably() {
        let (hub, _task) = start_hub().await;

        hub.route(frame("alice:phone", "bob:laptop", "1")).await.unwrap();
        settle(&hub).await;

        let pending = hub
            .storage()
            .pending_count(&ident("bob", "laptop"))
            .await
            .unwrap();
        assert_eq!(pending, 1);
        assert_eq!(hub.metrics().queued_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn offline_round_trip_preserves_content() {
        let (hub, _task) = start_hub().await;
        let bob = ident("bob", "laptop");
        let body = r#"{"ciphertext":"3q2+7w==","counter":9}"#;

        hub.route(frame("alice:phone", "bob:laptop", body)).await.unwrap();

        // Bob connects later; registration drains the backlog.
        let (tx, mut rx) = mpsc::channel(8);
        hub.register(bob.clone(), ConnectionId::new(), tx).await.unwrap();

        let text = recv(&mut rx).await.unwrap();
        let delivered = Frame::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(delivered.content.get(), body);
        assert_eq!(hub.storage().pending_count(&bob).await.unwrap(), 0);
        assert_eq!(hub.metrics().drained_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn drain_delivers_in_enqueue_order_without_duplicates() {
        let (hub, _task) = start_hub().await;
        let bob = ident("bob", "laptop");

        for n in 0..5 {
            hub.route(frame("alice:phone", "bob:laptop", &n.to_string()))
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        hub.register(bob.clone(), ConnectionId::new(), tx).await.unwrap();
        // Routed concurrently with (after) the drain: must arrive exactly once
        hub.route(frame("alice:phone", "bob:laptop", "5")).await.unwrap();
        settle(&hub).await;

        let mut bodies = Vec::new();
        for _ in 0..6 {
            let text = recv(&mut rx).await.unwrap();
            let f = Frame::from_bytes(text.as_bytes()).unwrap();
            bodies.push(f.content.get().to_string());
        }
        assert_eq!(bodies, ["0", "1", "2", "3", "4", "5"]);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "no duplicate deliveries"
        );
    }

    #[tokio::test]
    async fn new_registration_supersedes_and_closes_old_connection() {
        let (hub, _task) = start_hub().await;
        let bob = ident("bob", "laptop");

        let (old_tx, mut old_rx) = mpsc::channel(8);
        hub.register(bob.clone(), ConnectionId::new(), old_tx)
            .await
            .unwrap();

        let (new_tx, mut new_rx) = mpsc::channel(8);
        hub.register(bob.clone(), ConnectionId::new(), new_tx)
            .await
            .unwrap();

        // Old buffer is closed (sender dropped by the hub)
        assert!(recv(&mut old_rx).await.is_none());
        assert_eq!(hub.metrics().superseded_total.load(Ordering::Relaxed), 1);
        assert_eq!(hub.active_connections(), 1);

        // Traffic flows to the new connection only
        hub.route(frame("alice:phone", "bob:laptop", "1")).await.unwrap();
        assert!(recv(&mut new_rx).await.is_some());
    }

    #[tokio::test]
    async fn deregister_of_superseded_connection_keeps_new_entry() {
        let (hub, _task) = start_hub().await;
        let bob = ident("bob", "laptop");
        let old_id = ConnectionId::new();
        let new_id = ConnectionId::new();

        let (old_tx, _old_rx) = mpsc::channel(8);
        hub.register(bob.clone(), old_id, old_tx).await.unwrap();
        let (new_tx, mut new_rx) = mpsc::channel(8);
        hub.register(bob.clone(), new_id, new_tx).await.unwrap();

        // The old connection's late deregister must not evict the new one
        hub.deregister(bob.clone(), old_id).await;
        settle(&hub).await;

        assert_eq!(hub.active_connections(), 1);
        hub.route(frame("alice:phone", "bob:laptop", "1")).await.unwrap();
        assert!(recv(&mut new_rx).await.is_some());
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let (hub, _task) = start_hub().await;
        let bob = ident("bob", "laptop");
        let id = ConnectionId::new();

        let (tx, _rx) = mpsc::channel(8);
        hub.register(bob.clone(), id, tx).await.unwrap();
        hub.deregister(bob.clone(), id).await;
        hub.deregister(bob.clone(), id).await;
        settle(&hub).await;

        assert_eq!(hub.active_connections(), 0);
    }

    #[tokio::test]
    async fn full_buffer_drops_slow_consumer_and_queues_frame() {
        let (hub, _task) = start_hub().await;
        let bob = ident("bob", "laptop");

        // Capacity 1 and nobody draining
        let (tx, mut rx) = mpsc::channel(1);
        hub.register(bob.clone(), ConnectionId::new(), tx).await.unwrap();

        hub.route(frame("alice:phone", "bob:laptop", "1")).await.unwrap();
        hub.route(frame("alice:phone", "bob:laptop", "2")).await.unwrap();
        settle(&hub).await;

        assert_eq!(hub.metrics().slow_consumer_closes.load(Ordering::Relaxed), 1);
        assert_eq!(hub.active_connections(), 0);

        // The first frame was buffered, the overflow frame went durable
        assert_eq!(hub.storage().pending_count(&bob).await.unwrap(), 1);
        assert!(recv(&mut rx).await.is_some());
        assert!(recv(&mut rx).await.is_none(), "buffer closed after drop");
    }

    #[tokio::test]
    async fn hub_survives_slow_consumer_and_serves_others() {
        let (hub, _task) = start_hub().await;
        let bob = ident("bob", "laptop");
        let carol = ident("carol", "watch");

        let (bob_tx, _bob_rx) = mpsc::channel(1);
        hub.register(bob.clone(), ConnectionId::new(), bob_tx)
            .await
            .unwrap();
        let (carol_tx, mut carol_rx) = mpsc::channel(8);
        hub.register(carol.clone(), ConnectionId::new(), carol_tx)
            .await
            .unwrap();

        // Saturate bob
        hub.route(frame("alice:phone", "bob:laptop", "1")).await.unwrap();
        hub.route(frame("alice:phone", "bob:laptop", "2")).await.unwrap();
        // Carol is unaffected
        hub.route(frame("alice:phone", "carol:watch", "3")).await.unwrap();

        assert!(recv(&mut carol_rx).await.is_some());
        assert_eq!(hub.active_connections(), 1);
    }

    #[tokio::test]
    async fn malformed_recipient_is_a_noop() {
        let (hub, _task) = start_hub().await;

        hub.route(frame("alice:phone", "no-separator", "1")).await.unwrap();
        hub.route(frame("alice:phone", ":empty-user", "1")).await.unwrap();
        settle(&hub).await;

        assert_eq!(hub.metrics().malformed_total.load(Ordering::Relaxed), 2);
        assert_eq!(hub.storage().total_queued().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn route_after_stop_reports_hub_closed() {
        let (hub, task) = start_hub().await;

        hub.stop().await;
        task.await.unwrap();

        let err = hub
            .route(frame("alice:phone", "bob:laptop", "1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::HubClosed)
        ));
    }

    #[tokio::test]
    async fn queue_depth_cap_drops_excess_frames() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let mut config = Config::default();
        config.storage.max_queue_depth = 2;
        let (hub, _task) = Hub::start(config, storage);

        for n in 0..4 {
            hub.route(frame("alice:phone", "bob:laptop", &n.to_string()))
                .await
                .unwrap();
        }
        settle(&hub).await;

        let pending = hub
            .storage()
            .pending_count(&ident("bob", "laptop"))
            .await
            .unwrap();
        assert_eq!(pending, 2);
        assert_eq!(hub.metrics().storage_errors_total.load(Ordering::Relaxed), 2);
    }
}
