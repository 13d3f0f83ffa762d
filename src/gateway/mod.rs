//! Axum webhook gateway for the WhatsApp Cloud API.
//!
//! - Request body size limit (64KB)
//! - Request timeout (30s)
//! - `X-Hub-Signature-256` verification when an app secret is configured
//! - Redelivered webhook messages are dropped by message id
//!
//! Handlers only parse and enqueue; the dispatch loop feeds the broker.

use crate::channels::{ChannelMessage, WhatsAppChannel};
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Meta retries unacknowledged deliveries for about a day.
pub const IDEMPOTENCY_TTL_SECS: u64 = 86_400;
pub const IDEMPOTENCY_MAX_KEYS_DEFAULT: usize = 10_000;

const COMPONENT: &str = "gateway";

#[derive(Debug)]
pub struct IdempotencyStore {
    ttl: Duration,
    max_keys: usize,
    keys: Mutex<HashMap<String, Instant>>,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            ttl,
            max_keys: max_keys.max(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if this key is new and is now recorded.
    pub fn record_if_new(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        keys.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);

        if keys.contains_key(key) {
            return false;
        }

        if keys.len() >= self.max_keys {
            let oldest = keys
                .iter()
                .min_by_key(|(_, seen_at)| *seen_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                keys.remove(&oldest);
            }
        }

        keys.insert(key.to_owned(), now);
        true
    }

    /// Forget a key so a redelivery is accepted again.
    pub fn forget(&self, key: &str) {
        self.keys.lock().remove(key);
    }
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(IDEMPOTENCY_TTL_SECS),
            IDEMPOTENCY_MAX_KEYS_DEFAULT,
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub whatsapp: Arc<WhatsAppChannel>,
    pub app_secret: Option<Arc<str>>,
    pub tx: mpsc::Sender<ChannelMessage>,
    pub idempotency: Arc<IdempotencyStore>,
}

impl AppState {
    pub fn new(
        whatsapp: Arc<WhatsAppChannel>,
        app_secret: Option<&str>,
        tx: mpsc::Sender<ChannelMessage>,
    ) -> Self {
        Self {
            whatsapp,
            app_secret: app_secret
                .map(str::trim)
                .filter(|secret| !secret.is_empty())
                .map(Arc::from),
            tx,
            idempotency: Arc::new(IdempotencyStore::default()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/whatsapp",
            get(handle_whatsapp_verify).post(handle_whatsapp_message),
        )
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Serve the webhook until `cancel` fires.
pub async fn run_gateway(
    host: &str,
    port: u16,
    state: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    let local = listener.local_addr()?;

    if state.app_secret.is_none() {
        tracing::warn!("WhatsApp app secret not set; webhook signatures are not verified");
    }
    tracing::info!("Gateway listening on http://{local} (POST /whatsapp, GET /health)");
    crate::health::mark_component_ok(COMPONENT);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Constant-time string comparison
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "runtime": crate::health::snapshot_json(),
    }))
}

/// `WhatsApp` verification query params
#[derive(serde::Deserialize)]
pub struct WhatsAppVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET /whatsapp: Meta webhook verification
async fn handle_whatsapp_verify(
    State(state): State<AppState>,
    Query(params): Query<WhatsAppVerifyQuery>,
) -> impl IntoResponse {
    let token_matches = params
        .verify_token
        .as_deref()
        .is_some_and(|t| constant_time_eq(t, state.whatsapp.verify_token()));
    if params.mode.as_deref() == Some("subscribe") && token_matches {
        if let Some(ch) = params.challenge {
            tracing::info!("WhatsApp webhook verified successfully");
            return (StatusCode::OK, ch);
        }
        return (StatusCode::BAD_REQUEST, "Missing hub.challenge".to_string());
    }

    tracing::warn!("WhatsApp webhook verification failed: token mismatch");
    (StatusCode::FORBIDDEN, "Forbidden".to_string())
}

/// Verify `WhatsApp` webhook signature (`X-Hub-Signature-256`).
/// See: <https://developers.facebook.com/docs/graph-api/webhooks/getting-started#verification-requests>
pub fn verify_whatsapp_signature(app_secret: &str, body: &[u8], signature_header: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    // "sha256=<hex>"
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&expected).is_ok()
}

/// POST /whatsapp: incoming message webhook
async fn handle_whatsapp_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(ref app_secret) = state.app_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !verify_whatsapp_signature(app_secret, &body, signature) {
            tracing::warn!(
                "WhatsApp webhook signature verification failed (signature: {})",
                if signature.is_empty() {
                    "missing"
                } else {
                    "invalid"
                }
            );
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid signature"})),
            );
        }
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid JSON payload"})),
        );
    };

    for msg in state.whatsapp.parse_webhook_payload(&payload) {
        if !state.idempotency.record_if_new(&msg.id) {
            tracing::debug!(id = %msg.id, "Dropping redelivered WhatsApp message");
            continue;
        }

        tracing::info!(
            "WhatsApp message from {}: {}",
            msg.sender,
            truncate_with_ellipsis(&msg.content, 50)
        );

        let id = msg.id.clone();
        if let Err(e) = state.tx.try_send(msg) {
            // Unacknowledged deliveries are retried by Meta.
            state.idempotency.forget(&id);
            tracing::error!("Inbound queue rejected WhatsApp message {id}: {e}");
            crate::health::mark_component_error(COMPONENT, format!("inbound queue: {e}"));
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "Busy, retry later"})),
            );
        }
    }

    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
