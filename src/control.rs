//! HTTP control surface: liveness and externally pushed secret ids.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::ControlConfig;
use crate::identity::Identity;
use crate::watcher::Regenerator;
use crate::{Error, Result};

/// Shared handler state
pub struct ControlState {
    /// Regenerator whose cycle lock the surface shares with the debouncer
    pub regenerator: Arc<Regenerator>,
}

/// Body of `POST|PUT /cert`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CertUpdateRequest {
    /// Fresh one-time secret id
    pub secret_id: Option<String>,
    /// Match on the published hostname
    pub domain: Option<String>,
    /// Same as `domain`
    pub virtual_host: Option<String>,
    /// Match on the certificate name override
    pub cert_name: Option<String>,
    /// Match on the container name
    pub container_name: Option<String>,
    /// Match on the image reference
    pub image: Option<String>,
}

impl CertUpdateRequest {
    fn has_target(&self) -> bool {
        [
            &self.domain,
            &self.virtual_host,
            &self.cert_name,
            &self.container_name,
            &self.image,
        ]
        .iter()
        .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }

    /// Whether `identity` is the one addressed, checking keys in order
    #[must_use]
    pub fn matches(&self, identity: &Identity) -> bool {
        let eq = |want: &Option<String>, have: Option<&str>| {
            matches!((want.as_deref(), have), (Some(w), Some(h)) if !w.is_empty() && w == h)
        };
        let fqdn = identity.service_fqdn.as_deref();

        eq(&self.domain, fqdn)
            || eq(&self.virtual_host, fqdn)
            || eq(&self.cert_name, identity.cert_name.as_deref())
            || eq(&self.container_name, Some(identity.name.as_str()))
            || eq(&self.image, identity.image.as_deref())
    }
}

/// Client-facing failure with a structured reason
#[derive(Debug)]
pub struct ControlError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ControlError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }
}

impl From<Error> for ControlError {
    fn from(err: Error) -> Self {
        if err.is_reload() {
            Self::new(StatusCode::BAD_GATEWAY, "reload_failed", err.to_string())
        } else {
            Self::new(StatusCode::INTERNAL_SERVER_ERROR, "regeneration_failed", err.to_string())
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.error, "message": self.message })),
        )
            .into_response()
    }
}

/// Create the router
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/cert", axum::routing::post(cert_handler).put(cert_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping_handler() -> &'static str {
    "PONG!\n"
}

async fn cert_handler(
    State(state): State<Arc<ControlState>>,
    body: Bytes,
) -> std::result::Result<Json<Value>, ControlError> {
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| ControlError::bad_request(format!("body is not JSON: {e}")))?;
    if !value.is_object() {
        return Err(ControlError::bad_request("body must be a JSON object"));
    }
    let request: CertUpdateRequest = serde_json::from_value(value)
        .map_err(|e| ControlError::bad_request(format!("malformed request: {e}")))?;

    let secret_id = request
        .secret_id
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ControlError::bad_request("secret_id is required"))?;
    if !request.has_target() {
        return Err(ControlError::bad_request(
            "one of domain, virtual_host, cert_name, container_name, image is required",
        ));
    }

    let identity = state
        .regenerator
        .confgen()
        .base_identities()
        .await?
        .into_iter()
        .find(|identity| request.matches(identity))
        .ok_or_else(|| {
            ControlError::new(StatusCode::NOT_FOUND, "not_found", "no running container matches")
        })?;
    let fqdn = identity.service_fqdn.clone().ok_or_else(|| {
        ControlError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("container {} publishes no hostname", identity.name),
        )
    })?;

    info!(container = %identity.name, fqdn = %fqdn, "secret id pushed");
    let outcome = state.regenerator.recertify(identity, &secret_id).await.map_err(|e| {
        warn!(fqdn = %fqdn, error = %e, "recertification cycle failed");
        ControlError::from(e)
    })?;

    Ok(Json(json!({
        "regen": outcome.cycle.rewritten || outcome.cycle.reloaded,
        "admitted": outcome.admitted,
        "updated": fqdn,
    })))
}

/// Bind and serve until `shutdown_rx` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve(
    config: &ControlConfig,
    state: Arc<ControlState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid control address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "control surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}
