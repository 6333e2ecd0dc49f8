//! Prometheus metrics endpoint.

use crate::hub::Hub;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(hub): Extension<Arc<Hub>>) -> impl IntoResponse {
    let m = hub.metrics();

    // Gauges — current state
    let connections = hub.active_connections();

    // Counters — monotonic since startup
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let delivered = m.delivered_total.load(Ordering::Relaxed);
    let queued = m.queued_total.load(Ordering::Relaxed);
    let drained = m.drained_total.load(Ordering::Relaxed);
    let malformed = m.malformed_total.load(Ordering::Relaxed);
    let slow_closes = m.slow_consumer_closes.load(Ordering::Relaxed);
    let superseded = m.superseded_total.load(Ordering::Relaxed);
    let storage_errors = m.storage_errors_total.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let bytes_rx = m.bytes_received.load(Ordering::Relaxed);
    let bytes_tx = m.bytes_sent.load(Ordering::Relaxed);

    // Storage stats (async queries — best effort)
    let backlog = hub.storage().total_queued().await.unwrap_or(0);
    let backlog_recipients = hub.storage().recipients_with_backlog().await.unwrap_or(0);
    let bundles = hub.storage().total_bundles().await.unwrap_or(0);

    let body = format!(
        r#"# HELP courier_relay_connections_active Number of active connections
# TYPE courier_relay_connections_active gauge
courier_relay_connections_active {connections}

# HELP courier_relay_info Server information
# TYPE courier_relay_info gauge
courier_relay_info{{version="{version}"}} 1

# HELP courier_relay_connections_total Total connections accepted
# TYPE courier_relay_connections_total counter
courier_relay_connections_total {conns_total}

# HELP courier_relay_delivered_total Total frames delivered to live connections
# TYPE courier_relay_delivered_total counter
courier_relay_delivered_total {delivered}

# HELP courier_relay_queued_total Total frames stored for offline delivery
# TYPE courier_relay_queued_total counter
courier_relay_queued_total {queued}

# HELP courier_relay_drained_total Total frames drained into fresh connections
# TYPE courier_relay_drained_total counter
courier_relay_drained_total {drained}

# HELP courier_relay_malformed_total Total inbound frames dropped as malformed
# TYPE courier_relay_malformed_total counter
courier_relay_malformed_total {malformed}

# HELP courier_relay_slow_consumer_closes_total Total connections dropped for a full outbound buffer
# TYPE courier_relay_slow_consumer_closes_total counter
courier_relay_slow_consumer_closes_total {slow_closes}

# HELP courier_relay_superseded_total Total connections replaced by a newer registration
# TYPE courier_relay_superseded_total counter
courier_relay_superseded_total {superseded}

# HELP courier_relay_storage_errors_total Total durable-queue failures
# TYPE courier_relay_storage_errors_total counter
courier_relay_storage_errors_total {storage_errors}

# HELP courier_relay_rate_limit_hits_total Total rate limit rejections
# TYPE courier_relay_rate_limit_hits_total counter
courier_relay_rate_limit_hits_total {rate_limits}

# HELP courier_relay_bytes_received_total Total payload bytes received
# TYPE courier_relay_bytes_received_total counter
courier_relay_bytes_received_total {bytes_rx}

# HELP courier_relay_bytes_sent_total Total payload bytes sent
# TYPE courier_relay_bytes_sent_total counter
courier_relay_bytes_sent_total {bytes_tx}

# HELP courier_relay_queue_backlog Frames currently queued for offline recipients
# TYPE courier_relay_queue_backlog gauge
courier_relay_queue_backlog {backlog}

# HELP courier_relay_queue_recipients Recipients with at least one queued frame
# TYPE courier_relay_queue_recipients gauge
courier_relay_queue_recipients {backlog_recipients}

# HELP courier_relay_prekey_bundles Stored pre-key bundles
# TYPE courier_relay_prekey_bundles gauge
courier_relay_prekey_bundles {bundles}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
