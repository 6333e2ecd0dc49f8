//! HTTP endpoints for courier-relay.
//!
//! The WebSocket upgrade lives here alongside the pre-key registry, health
//! check, and metrics endpoints.

pub mod health;
mod metrics;
mod prekeys;
mod ws;

use crate::hub::Hub;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(hub: Arc<Hub>) -> Router {
    let mut router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route(
            "/prekey",
            get(prekeys::get_bundle_handler).post(prekeys::put_bundle_handler),
        )
        .route("/health", get(health::health_handler));

    if hub.config().server.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }

    router.layer(Extension(hub))
}
