//! Per-connection lifecycle.
//!
//! Each accepted WebSocket gets a [`Connection`] bound to one identity. Two
//! tasks share it: a reader that decodes inbound frames and submits them to
//! the hub, and a writer that drains the outbound buffer and emits liveness
//! pings. The tasks meet only through the bounded buffer; directory
//! membership is mutated exclusively by the hub.

use crate::error::RelayError;
use crate::hub::Hub;
use axum::extract::ws::{Message, WebSocket};
use courier_types::{Frame, Identity};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Unique id of one connection instance.
///
/// Identities recur across reconnects; instance ids never do. The hub uses
/// them to tell a stale deregister from a current one.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

/// Connection lifecycle states. Transitions are one-way; a closed
/// connection is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport handshake done; not yet in the directory.
    Connecting,
    /// Registered; reader and writer running.
    Active,
    /// Outbound buffer closed; writer flushing what is already queued.
    Draining,
    /// Transport released. Terminal.
    Closed,
}

/// One physical duplex channel bound to one identity.
pub struct Connection {
    hub: Arc<Hub>,
    identity: Identity,
    id: ConnectionId,
    state: ConnectionState,
}

impl Connection {
    /// Create a connection for an identity whose handshake succeeded.
    pub fn new(hub: Arc<Hub>, identity: Identity) -> Self {
        Self {
            hub,
            identity,
            id: ConnectionId::new(),
            state: ConnectionState::Connecting,
        }
    }

    /// This connection's instance id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the connection until the transport goes away.
    ///
    /// Registers with the hub (which also drains the identity's offline
    /// backlog into the outbound buffer), then reads until close, error,
    /// or idle timeout.
    pub async fn run(mut self, socket: WebSocket) -> Result<(), RelayError> {
        let buffer = self.hub.config().connection.outbound_buffer;
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);

        // Inbound traffic waits until registration and the backlog drain
        // are done, so queued history lands ahead of anything live.
        self.hub
            .register(self.identity.clone(), self.id, outbound_tx)
            .await?;
        self.state = ConnectionState::Active;
        tracing::info!(identity = %self.identity, conn = %self.id, "connection active");

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            self.hub.clone(),
            self.identity.clone(),
            self.id,
        ));

        self.read_loop(stream).await;

        self.state = ConnectionState::Draining;
        // No-op if a newer connection has taken the identity over.
        self.hub.deregister(self.identity.clone(), self.id).await;
        let _ = writer.await;

        self.state = ConnectionState::Closed;
        tracing::info!(identity = %self.identity, conn = %self.id, "connection closed");
        Ok(())
    }

    async fn read_loop(&mut self, mut stream: SplitStream<WebSocket>) {
        let idle = self.hub.config().connection.idle_timeout();

        loop {
            let msg = match tokio::time::timeout(idle, stream.next()).await {
                Err(_) => {
                    tracing::info!(identity = %self.identity, conn = %self.id, "idle timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(identity = %self.identity, conn = %self.id, "transport error: {e}");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => {
                    if self.submit(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Message::Binary(bytes) => {
                    if self.submit(&bytes).await.is_err() {
                        break;
                    }
                }
                // Any traffic, pongs included, resets the idle deadline.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => break,
            }
        }
    }

    /// Decode one inbound frame, stamp the sender, hand it to the hub.
    ///
    /// Malformed or rate-limited frames are dropped without ending the
    /// connection; only a closed hub propagates as an error.
    async fn submit(&self, bytes: &[u8]) -> Result<(), RelayError> {
        let metrics = self.hub.metrics();
        metrics
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let limits = self.hub.rate_limits();
        if let Err(e) = limits
            .check_global()
            .and_then(|()| limits.check_message(&self.identity.as_key()))
        {
            metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(identity = %self.identity, "frame rate limited: {e}");
            return Ok(());
        }

        let mut frame = match Frame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                metrics.malformed_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(identity = %self.identity, "dropping malformed frame: {e}");
                return Ok(());
            }
        };

        // The sender cannot impersonate another identity.
        frame.stamp_from(&self.identity);
        self.hub.route(frame).await
    }
}

/// Drain the outbound buffer to the transport and keep the peer alive.
///
/// Ends when the buffer closes (hub dropped the sender) after flushing the
/// remaining frames, or when a write fails or exceeds its deadline.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    hub: Arc<Hub>,
    identity: Identity,
    id: ConnectionId,
) {
    let config = &hub.config().connection;
    let write_timeout = config.write_timeout();
    let mut ping = tokio::time::interval(config.ping_interval());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(text) => {
                    let len = text.len() as u64;
                    match tokio::time::timeout(write_timeout, sink.send(Message::Text(text))).await {
                        Ok(Ok(())) => {
                            hub.metrics().bytes_sent.fetch_add(len, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(%identity, conn = %id, "write failed: {e}");
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(%identity, conn = %id, "write deadline exceeded");
                            break;
                        }
                    }
                }
                None => {
                    // Buffer closed; already-queued frames were flushed above.
                    let _ = tokio::time::timeout(
                        write_timeout,
                        sink.send(Message::Close(None)),
                    )
                    .await;
                    break;
                }
            },
            _ = ping.tick() => {
                match tokio::time::timeout(write_timeout, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        tracing::debug!(%identity, conn = %id, "ping failed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteStorage;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn connection_id_display_is_short() {
        let id = ConnectionId::new();
        assert_eq!(id.to_string().len(), 8);
    }

    #[tokio::test]
    async fn new_connection_starts_in_connecting_state() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let (hub, _task) = Hub::start(Config::default(), storage);
        let conn = Connection::new(hub, Identity::new("alice", "phone").unwrap());
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }
}
