//! Change-notification listener.
//!
//! The registration CRUD service posts here after it adds, updates or
//! deletes a registration. Endpoints:
//! - `POST /api/v1/notify/registrations` with `{"name": ..., "operation": ...}`
//! - `GET /api/v1/ping` liveness check

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::models::NotifyUpdate;

/// Start the listener on `host:port`.
///
/// Returns only when the server stops; the caller treats that as fatal.
pub async fn serve(
    host: &str,
    port: u16,
    notifications: mpsc::Sender<NotifyUpdate>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind((host, port)).await?;
    serve_listener(listener, notifications).await
}

/// Serve on an already bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    notifications: mpsc::Sender<NotifyUpdate>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!(address = %addr, "Notification listener started");
    axum::serve(listener, router(notifications)).await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(notifications: mpsc::Sender<NotifyUpdate>) -> Router {
    Router::new()
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/notify/registrations", post(notify_registration))
        .with_state(notifications)
}

async fn ping() -> &'static str {
    "pong"
}

async fn notify_registration(
    State(notifications): State<mpsc::Sender<NotifyUpdate>>,
    Json(update): Json<NotifyUpdate>,
) -> StatusCode {
    if update.name.is_empty() {
        warn!("Notification without registration name");
        return StatusCode::BAD_REQUEST;
    }

    info!(registration = %update.name, operation = ?update.operation, "Registration changed");
    match notifications.send(update).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
