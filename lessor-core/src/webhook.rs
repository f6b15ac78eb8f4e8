//! Inbound HTTP surface: signed backend callbacks and a health probe.

use std::fmt;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::{ErrorClass, LessorError, Result};
use crate::events::SourceState;
use crate::lifecycle::{BackendCallback, LifecycleController};

pub const SIGNATURE_HEADER: &str = "x-lessor-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookState {
    controller: Arc<LifecycleController>,
    mac: HmacSha256,
    source_state: watch::Receiver<SourceState>,
}

impl fmt::Debug for WebhookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookState")
            .field("source_state", &*self.source_state.borrow())
            .finish_non_exhaustive()
    }
}

impl WebhookState {
    pub fn new(
        controller: Arc<LifecycleController>,
        secret: &[u8],
        source_state: watch::Receiver<SourceState>,
    ) -> Result<Self> {
        if secret.is_empty() {
            return Err(LessorError::Validation("webhook secret is empty".into()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|err| LessorError::Validation(format!("webhook secret: {err}")))?;
        Ok(Self {
            controller,
            mac,
            source_state,
        })
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        let Some(signature) = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| hex::decode(value.trim()).ok())
        else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(body);
        mac.verify_slice(&signature).is_ok()
    }
}

/// Hex HMAC-SHA256 of `body`, as senders put it in [`SIGNATURE_HEADER`].
pub fn sign_body(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| LessorError::Validation(format!("webhook secret: {err}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/v1/callbacks", post(receive_callback))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn reject(status: StatusCode, message: impl fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

async fn receive_callback(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.verify(&headers, &body) {
        warn!(target: "lessor::webhook", "callback rejected: bad signature");
        return reject(StatusCode::UNAUTHORIZED, "invalid signature");
    }
    let callback: BackendCallback = match serde_json::from_slice(&body) {
        Ok(callback) => callback,
        Err(err) => return reject(StatusCode::BAD_REQUEST, err),
    };

    match state.controller.submit_callback(&callback).await {
        Ok(handle) => {
            debug!(
                target: "lessor::webhook",
                resource = %callback.resource_ref,
                event = ?callback.event,
                command_id = %handle.command_id,
                merged = !handle.accepted,
                "callback accepted"
            );
            (StatusCode::ACCEPTED, Json(handle)).into_response()
        }
        Err(err @ LessorError::NotFound(_)) => reject(StatusCode::NOT_FOUND, err),
        Err(err) => match err.class() {
            ErrorClass::Validation => reject(StatusCode::BAD_REQUEST, err),
            ErrorClass::Transient => reject(StatusCode::SERVICE_UNAVAILABLE, err),
            _ => {
                warn!(target: "lessor::webhook", error = %err, "callback could not be queued");
                reject(StatusCode::INTERNAL_SERVER_ERROR, err)
            }
        },
    }
}

async fn healthz(State(state): State<WebhookState>) -> Response {
    let source = *state.source_state.borrow();
    let status = if source == SourceState::Halted {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(json!({ "event_source": source }))).into_response()
}
