//! WebSocket upgrade endpoint.
//!
//! `GET /ws?user_id=U&device_id=D` upgrades to the relay's duplex channel.
//! Both parameters are required and non-empty; the request is rejected
//! otherwise. Rate and capacity checks happen before the upgrade so a
//! rejected client never costs a socket.

use crate::connection::Connection;
use crate::hub::Hub;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use courier_types::Identity;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Handshake query parameters.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    device_id: String,
}

/// WebSocket upgrade handler.
///
/// The upgrade extractor is taken as a `Result` so identity validation runs
/// first and a bad handshake gets a 400 even from a non-upgradable request.
pub async fn ws_handler(
    Extension(hub): Extension<Arc<Hub>>,
    Query(params): Query<WsParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match Identity::new(params.user_id, params.device_id) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::debug!("rejecting handshake: {e}");
            return (StatusCode::BAD_REQUEST, "Missing user_id or device_id").into_response();
        }
    };

    if let Err(e) = hub.rate_limits().check_connection(&identity.as_key()) {
        tracing::warn!(%identity, "connection rate limited: {e}");
        hub.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
    }

    let max_connections = hub.config().limits.max_connections;
    if hub.active_connections() >= max_connections {
        tracing::warn!(
            "connection limit reached ({}/{}), rejecting {}",
            hub.active_connections(),
            max_connections,
            identity
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    hub.metrics().connections_total.fetch_add(1, Ordering::Relaxed);

    let max_frame = hub.config().connection.max_frame_bytes;
    ws.max_message_size(max_frame).on_upgrade(move |socket| async move {
        let connection = Connection::new(hub, identity);
        if let Err(e) = connection.run(socket).await {
            tracing::warn!("connection error: {e}");
        }
    })
}
