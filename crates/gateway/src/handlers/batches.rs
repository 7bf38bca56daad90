//! Batch status handlers
//!
//! The terminal query surface: clients poll a batch until its status is
//! terminal, receiving the photos produced so far alongside.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;
use portray_common::errors::{AppError, Result};

/// Batch status response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_id: Uuid,
    pub status: String,
    pub total_images_generated: i32,
    pub credits_used: i32,
    pub aspect_ratio: String,
    pub photos: Vec<PhotoResponse>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoResponse {
    pub id: Uuid,
    pub url: String,
    pub prompt: String,
    pub aspect_ratio: String,
    pub created_at: String,
}

/// Get batch status plus its photos
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchResponse>> {
    let batch = state
        .store
        .find_batch(batch_id)
        .await?
        .ok_or_else(|| AppError::BatchNotFound {
            id: batch_id.to_string(),
        })?;

    let photos = state.store.photos_for_batch(batch_id).await?;

    Ok(Json(BatchResponse {
        batch_id: batch.id,
        status: batch.status.clone(),
        total_images_generated: batch.total_images_generated,
        credits_used: batch.credits_used,
        aspect_ratio: batch.aspect_ratio.clone(),
        photos: photos
            .into_iter()
            .map(|p| PhotoResponse {
                id: p.id,
                url: p.url,
                prompt: p.prompt,
                aspect_ratio: p.aspect_ratio,
                created_at: p.created_at.to_rfc3339(),
            })
            .collect(),
        created_at: batch.created_at.to_rfc3339(),
        completed_at: batch.completed_at.map(|dt| dt.to_rfc3339()),
    }))
}
