//! Pre-key bundle endpoints.
//!
//! `POST /prekey?user_id=U&device_id=D` stores a bundle; `GET` with the same
//! parameters returns it. Bundles are opaque to the relay.

use crate::hub::Hub;
use crate::storage::PreKeyStore;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use courier_types::{Identity, PreKeyBundle};
use serde::Deserialize;
use std::sync::Arc;

/// Identity query parameters shared by both handlers.
#[derive(Debug, Deserialize)]
pub struct KeyParams {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    device_id: String,
}

fn identity_from(params: KeyParams) -> Result<Identity, Response> {
    Identity::new(params.user_id, params.device_id)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Missing user_id or device_id").into_response())
}

/// Store a pre-key bundle for an identity.
pub async fn put_bundle_handler(
    Extension(hub): Extension<Arc<Hub>>,
    Query(params): Query<KeyParams>,
    Json(bundle): Json<PreKeyBundle>,
) -> Response {
    let identity = match identity_from(params) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match hub.storage().put_bundle(&identity, &bundle).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => {
            tracing::error!(%identity, "failed to store pre-key bundle: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Retrieve the pre-key bundle for an identity.
pub async fn get_bundle_handler(
    Extension(hub): Extension<Arc<Hub>>,
    Query(params): Query<KeyParams>,
) -> Response {
    let identity = match identity_from(params) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match hub.storage().get_bundle(&identity).await {
        Ok(Some(bundle)) => Json(bundle).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Pre-key bundle not found").into_response(),
        Err(e) => {
            tracing::error!(%identity, "failed to load pre-key bundle: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
