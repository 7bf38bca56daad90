//! Push-notification intake endpoint
//!
//! Optional fast path: the dispatcher (or a database change feed bridge)
//! POSTs here to wake the claim loop immediately. Polling remains the
//! correctness path, so this endpoint only ever nudges.

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Loose view of the job payload the notifier forwards; only identifiers
/// are read, the claim loop fetches authoritative state from the store.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the intake router
pub fn router(notify: Arc<Notify>) -> Router {
    Router::new()
        .route("/webhook/photo-generation", post(intake))
        .with_state(notify)
}

async fn intake(
    State(notify): State<Arc<Notify>>,
    Json(payload): Json<WebhookPayload>,
) -> Json<WebhookResponse> {
    tracing::debug!(
        job_id = ?payload.id,
        batch_id = ?payload.batch_id,
        "Wake-up received on intake endpoint"
    );

    notify.notify_one();

    Json(WebhookResponse {
        success: true,
        error: None,
    })
}

/// Serve the intake endpoint on its own port
pub async fn serve(port: u16, notify: Arc<Notify>) -> std::io::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(port, "Intake endpoint listening");

    axum::serve(listener, router(notify))
        .await
        .map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_intake_notifies_claim_loop() {
        let notify = Arc::new(Notify::new());
        let waiter = notify.clone();
        let notified = tokio::spawn(async move { waiter.notified().await });

        let response = intake(
            State(notify),
            Json(WebhookPayload {
                id: Some(Uuid::new_v4()),
                batch_id: None,
            }),
        )
        .await;

        assert!(response.0.success);
        notified.await.unwrap();
    }
}
