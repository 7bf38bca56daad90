//! Generation submission handler (dispatcher)
//!
//! Expands one user request into a batch plus one job per reference image,
//! inserts them atomically, and nudges workers over the wake-up queue.
//! The queue send is best-effort: workers poll the store regardless.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use portray_common::{
    db::BatchSpec,
    errors::{AppError, Result},
    metrics,
    queue::JobAvailableMessage,
    SUPPORTED_ASPECT_RATIOS,
};

/// Request to start a generation batch
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateGenerationRequest {
    pub user_id: Uuid,

    pub model_id: Uuid,

    /// One job is created per reference image
    #[validate(length(min = 1, max = 20))]
    pub reference_image_urls: Vec<String>,

    pub reference_image_prompt: Option<String>,

    #[serde(default)]
    pub training_image_urls: Vec<String>,

    #[validate(length(min = 1, max = 4000))]
    pub base_prompt: String,

    pub aspect_ratio: String,

    #[validate(range(min = 1, max = 10))]
    pub num_images_per_example: i32,

    #[serde(default = "default_glasses")]
    pub glasses: String,

    pub hair_color: Option<String>,

    pub hair_style: Option<String>,

    #[serde(default)]
    pub backgrounds: Vec<String>,

    #[serde(default)]
    pub styles: Vec<String>,

    /// Client-provided idempotency key
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_glasses() -> String {
    "no".to_string()
}

/// Response after accepting a generation request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGenerationResponse {
    pub batch_id: Uuid,
    pub status: String,
    pub job_count: usize,
    pub poll_url: String,
}

/// Check that a worker on another host could fetch this URL.
///
/// Workers run in their own network namespace, so anything pointing at the
/// submitter's loopback or link-local address can never resolve there.
pub fn validate_worker_reachable_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::UnreachableReference {
            url: raw.to_string(),
        });
    }

    let parsed = Url::parse(trimmed).map_err(|_| AppError::UnreachableReference {
        url: raw.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::UnreachableReference {
            url: raw.to_string(),
        });
    }

    let local_only = match parsed.host() {
        Some(url::Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
        }
        Some(url::Host::Ipv4(ip)) => ip.is_loopback() || ip.is_link_local() || ip.is_unspecified(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback() || ip.is_unspecified(),
        None => true,
    };

    if local_only {
        return Err(AppError::UnreachableReference {
            url: raw.to_string(),
        });
    }

    Ok(parsed)
}

/// Accept a generation request and enqueue its jobs
pub async fn create_generation(
    State(state): State<AppState>,
    Json(request): Json<CreateGenerationRequest>,
) -> Result<(StatusCode, Json<CreateGenerationResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    if !SUPPORTED_ASPECT_RATIOS.contains(&request.aspect_ratio.as_str()) {
        return Err(AppError::InvalidFormat {
            message: format!(
                "Unsupported aspect ratio '{}', expected one of {:?}",
                request.aspect_ratio, SUPPORTED_ASPECT_RATIOS
            ),
        });
    }

    if !matches!(request.glasses.as_str(), "yes" | "no") {
        return Err(AppError::InvalidFormat {
            message: format!("Invalid glasses option '{}'", request.glasses),
        });
    }

    // Replay protection: the same idempotency key returns the original batch
    if let Some(ref key) = request.idempotency_key {
        if let Some(existing) = state
            .store
            .find_batch_by_idempotency_key(request.user_id, key)
            .await?
        {
            return Ok((
                StatusCode::OK,
                Json(CreateGenerationResponse {
                    batch_id: existing.id,
                    status: existing.status.clone(),
                    job_count: 0,
                    poll_url: format!("/v1/batches/{}", existing.id),
                }),
            ));
        }
    }

    // Keep only reference images a worker could actually fetch; the request
    // fails only when none survive.
    let mut reference_image_urls = Vec::with_capacity(request.reference_image_urls.len());
    for raw in &request.reference_image_urls {
        match validate_worker_reachable_url(raw) {
            Ok(parsed) => reference_image_urls.push(parsed.to_string()),
            Err(_) => {
                tracing::warn!(url = %raw, "Dropping reference image URL unreachable by workers");
            }
        }
    }

    if reference_image_urls.is_empty() {
        return Err(AppError::Validation {
            message: "No reference image URL is reachable by workers".to_string(),
            field: Some("referenceImageUrls".to_string()),
        });
    }

    let training_image_urls: Vec<String> = request
        .training_image_urls
        .iter()
        .filter_map(|raw| validate_worker_reachable_url(raw).ok().map(|u| u.to_string()))
        .collect();

    let spec = BatchSpec {
        user_id: request.user_id,
        model_id: request.model_id,
        reference_image_urls,
        reference_image_prompt: request.reference_image_prompt.clone(),
        training_image_urls,
        base_prompt: request.base_prompt.clone(),
        aspect_ratio: request.aspect_ratio.clone(),
        num_images: request.num_images_per_example,
        glasses: request.glasses.clone(),
        hair_color: request.hair_color.clone(),
        hair_style: request.hair_style.clone(),
        backgrounds: request.backgrounds.clone(),
        styles: request.styles.clone(),
        max_attempts: state.config.worker.max_attempts,
        idempotency_key: request.idempotency_key.clone(),
    };

    let (batch, jobs) = state.store.create_batch_with_jobs(spec).await?;

    metrics::record_submission(jobs.len());

    tracing::info!(
        batch_id = %batch.id,
        user_id = %request.user_id,
        job_count = jobs.len(),
        num_images = request.num_images_per_example,
        "Generation batch created"
    );

    // Push is a latency optimization: a failed send only delays the first
    // claim by one poll interval.
    if let Some(ref queue) = state.queue {
        let message = JobAvailableMessage {
            batch_id: batch.id,
            user_id: batch.user_id,
            job_ids: jobs.iter().map(|j| j.id).collect(),
        };
        if let Err(e) = queue.send(&message).await {
            tracing::warn!(error = %e, batch_id = %batch.id, "Failed to publish wake-up message");
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateGenerationResponse {
            batch_id: batch.id,
            status: batch.status.clone(),
            job_count: jobs.len(),
            poll_url: format!("/v1/batches/{}", batch.id),
        }),
    ))
}
