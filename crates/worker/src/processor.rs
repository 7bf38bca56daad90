//! Job processor
//!
//! Runs one claimed job end to end: resolve reference inputs, generate the
//! requested number of images sequentially, upload each to blob storage,
//! persist photo rows, finalize the job, and re-derive the batch status.
//! Every failure converges to persisted job/batch state; only store errors
//! bubble up (the claim loop counts those toward its circuit breaker).

use crate::fetch::ImageFetcher;
use chrono::{DateTime, Utc};
use portray_common::{
    blob::{photo_key, BlobStore},
    db::{models::Job, PhotoSpec, Store},
    genapi::{GenApiError, ImageGenerator, ReferenceImage},
    metrics,
    retry::RetryPolicy,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Processor configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Delay between sequential images of one job
    pub inter_image_delay: Duration,
    /// Policy used to compute rate-limit parking delays
    pub retry_policy: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            inter_image_delay: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// What happened to a processed job
#[derive(Debug)]
pub enum JobOutcome {
    Completed { photos: usize },
    RateLimited { retry_at: DateTime<Utc> },
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    StoreError(String),
}

impl From<portray_common::errors::AppError> for WorkerError {
    fn from(e: portray_common::errors::AppError) -> Self {
        WorkerError::StoreError(e.to_string())
    }
}

/// Job processor
pub struct JobProcessor {
    store: Arc<dyn Store>,
    generator: Arc<dyn ImageGenerator>,
    blobs: Arc<dyn BlobStore>,
    fetcher: Arc<dyn ImageFetcher>,
    config: ProcessorConfig,
}

/// Compose the prompt sent to the generation API from the job's base prompt
/// and its option tags. Persisted verbatim on every photo for provenance.
pub fn build_prompt(job: &Job) -> String {
    let mut prompt = job.base_prompt.clone();

    if let Some(ref reference_prompt) = job.reference_image_prompt {
        if !reference_prompt.trim().is_empty() {
            prompt.push_str(". ");
            prompt.push_str(reference_prompt.trim());
        }
    }

    match job.glasses.as_str() {
        "yes" => prompt.push_str(", wearing glasses"),
        _ => prompt.push_str(", without glasses"),
    }

    if let Some(ref color) = job.hair_color {
        prompt.push_str(&format!(", {} hair", color));
    }
    if let Some(ref style) = job.hair_style {
        prompt.push_str(&format!(", {} hairstyle", style));
    }

    let backgrounds: Vec<String> = job
        .backgrounds
        .as_array()
        .map(|v| {
            v.iter()
                .filter_map(|b| b.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if !backgrounds.is_empty() {
        prompt.push_str(&format!(", background: {}", backgrounds.join(" or ")));
    }

    let styles: Vec<String> = job
        .styles
        .as_array()
        .map(|v| {
            v.iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if !styles.is_empty() {
        prompt.push_str(&format!(", style: {}", styles.join(", ")));
    }

    prompt
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        generator: Arc<dyn ImageGenerator>,
        blobs: Arc<dyn BlobStore>,
        fetcher: Arc<dyn ImageFetcher>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            generator,
            blobs,
            fetcher,
            config,
        }
    }

    /// Resolve the reference image plus any training images. Individual
    /// misses are logged; the job only fails when nothing resolves.
    async fn resolve_inputs(&self, job: &Job) -> Vec<ReferenceImage> {
        let mut urls = vec![job.reference_image_url.clone()];
        urls.extend(job.training_urls());

        let mut inputs = Vec::with_capacity(urls.len());
        for url in &urls {
            match self.fetcher.fetch(url).await {
                Ok(image) => inputs.push(image),
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to resolve reference input");
                }
            }
        }

        inputs
    }

    /// Process one claimed job to a persisted outcome.
    #[instrument(skip(self, job), fields(job_id = %job.id, batch_id = %job.batch_id))]
    pub async fn process_job(&self, job: Job) -> Result<JobOutcome, WorkerError> {
        info!(
            num_images = job.num_images,
            attempts = job.attempts,
            "Processing generation job"
        );

        let inputs = self.resolve_inputs(&job).await;

        // Nothing to condition on: fail without burning an attempt against
        // the remote API.
        if inputs.is_empty() {
            let message = "No reference inputs could be resolved";
            self.store.mark_failed(job.id, message).await?;
            metrics::record_job_finalized("failed");
            self.store.finalize_batch(job.batch_id).await?;
            return Ok(JobOutcome::Failed);
        }

        let attempts = self.store.increment_attempt(job.id).await?;
        let prompt = build_prompt(&job);
        let timestamp_millis = Utc::now().timestamp_millis();

        let mut photos_created = 0usize;
        let mut rate_limit: Option<Duration> = None;
        let mut last_error: Option<String> = None;

        for index in 0..job.num_images.max(0) as usize {
            if index > 0 && !self.config.inter_image_delay.is_zero() {
                tokio::time::sleep(self.config.inter_image_delay).await;
            }

            let started = Instant::now();
            match self
                .generator
                .generate(&inputs, &prompt, &job.aspect_ratio)
                .await
            {
                Ok(image) => {
                    metrics::record_generation(
                        started.elapsed().as_secs_f64(),
                        self.generator.model_name(),
                        true,
                    );

                    let key = photo_key(job.user_id, timestamp_millis, index);
                    match self.blobs.upload(&key, image.bytes, &image.mime_type).await {
                        Ok(url) => {
                            self.store
                                .create_photo(PhotoSpec {
                                    user_id: job.user_id,
                                    model_id: job.model_id,
                                    generation_batch_id: job.batch_id,
                                    url,
                                    aspect_ratio: job.aspect_ratio.clone(),
                                    glasses: job.glasses.clone(),
                                    hair_color: job.hair_color.clone(),
                                    hair_style: job.hair_style.clone(),
                                    backgrounds: json_strings(&job.backgrounds),
                                    styles: json_strings(&job.styles),
                                    prompt: prompt.clone(),
                                })
                                .await?;
                            metrics::record_photo_uploaded();
                            photos_created += 1;
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Failed to upload generated image");
                            last_error = Some(e.to_string());
                        }
                    }
                }
                Err(GenApiError::RateLimited { retry_after }) => {
                    metrics::record_generation(
                        started.elapsed().as_secs_f64(),
                        self.generator.model_name(),
                        false,
                    );
                    // Abort the remaining images; the whole job goes back
                    // through the retry path rather than half-completing.
                    rate_limit = Some(retry_after);
                    break;
                }
                Err(GenApiError::QuotaExhausted) => {
                    metrics::record_generation(
                        started.elapsed().as_secs_f64(),
                        self.generator.model_name(),
                        false,
                    );
                    warn!("Generation quota exhausted, aborting remaining images");
                    last_error = Some("Generation quota exhausted".to_string());
                    break;
                }
                Err(error) => {
                    metrics::record_generation(
                        started.elapsed().as_secs_f64(),
                        self.generator.model_name(),
                        false,
                    );
                    // A single bad image does not sink the job
                    warn!(image_index = index, error = %error, "Image generation failed, continuing");
                    last_error = Some(error.to_string());
                }
            }
        }

        if let Some(retry_after) = rate_limit {
            if attempts < job.max_attempts {
                let delay = self
                    .config
                    .retry_policy
                    .with_jitter(self.config.retry_policy.clamp_hint(retry_after));
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));

                self.store
                    .mark_rate_limited(job.id, retry_at, "Rate limited by generation API")
                    .await?;
                metrics::record_rate_limited();

                info!(
                    attempts,
                    max_attempts = job.max_attempts,
                    retry_at = %retry_at,
                    "Job parked for rate-limit retry"
                );
                return Ok(JobOutcome::RateLimited { retry_at });
            }

            last_error = Some(format!("Rate limited after {} attempts", attempts));
        }

        let outcome = if photos_created > 0 {
            self.store.mark_completed(job.id).await?;
            metrics::record_job_finalized("completed");
            info!(photos = photos_created, "Job completed");
            JobOutcome::Completed {
                photos: photos_created,
            }
        } else {
            let message = last_error.unwrap_or_else(|| "No images were generated".to_string());
            self.store.mark_failed(job.id, &message).await?;
            metrics::record_job_finalized("failed");
            info!(error = %message, "Job failed");
            JobOutcome::Failed
        };

        self.store.finalize_batch(job.batch_id).await?;

        Ok(outcome)
    }
}

fn json_strings(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|v| {
            v.iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::StaticImageFetcher;
    use portray_common::{
        blob::MemoryBlobStore,
        db::{models::*, BatchSpec, MemoryStore},
        genapi::{GeneratedImage, MockImageGenerator},
    };

    const REF_URL: &str = "https://cdn.example.com/ref-0.png";

    fn batch_spec(reference_count: usize, num_images: i32, max_attempts: i32) -> BatchSpec {
        BatchSpec {
            user_id: uuid::Uuid::new_v4(),
            model_id: uuid::Uuid::new_v4(),
            reference_image_urls: (0..reference_count)
                .map(|i| format!("https://cdn.example.com/ref-{}.png", i))
                .collect(),
            reference_image_prompt: Some("same person as the reference".to_string()),
            training_image_urls: vec![],
            base_prompt: "professional studio portrait".to_string(),
            aspect_ratio: "1:1".to_string(),
            num_images,
            glasses: "no".to_string(),
            hair_color: Some("brown".to_string()),
            hair_style: None,
            backgrounds: vec!["office".to_string()],
            styles: vec!["corporate".to_string()],
            max_attempts,
            idempotency_key: None,
        }
    }

    fn fetcher_for(reference_count: usize) -> Arc<StaticImageFetcher> {
        let mut fetcher = StaticImageFetcher::new();
        for i in 0..reference_count {
            fetcher = fetcher.with_image(
                &format!("https://cdn.example.com/ref-{}.png", i),
                "image/png",
            );
        }
        Arc::new(fetcher)
    }

    fn test_config() -> ProcessorConfig {
        ProcessorConfig {
            inter_image_delay: Duration::ZERO,
            retry_policy: RetryPolicy::new(
                3,
                Duration::from_millis(1),
                Duration::from_secs(60),
                Duration::ZERO,
            ),
        }
    }

    fn processor(
        store: Arc<MemoryStore>,
        generator: MockImageGenerator,
        reference_count: usize,
    ) -> (JobProcessor, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let processor = JobProcessor::new(
            store,
            Arc::new(generator),
            blobs.clone(),
            fetcher_for(reference_count),
            test_config(),
        );
        (processor, blobs)
    }

    fn ok_image() -> Result<GeneratedImage, GenApiError> {
        Ok(GeneratedImage {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
        })
    }

    #[tokio::test]
    async fn test_happy_path_two_jobs_eight_photos() {
        let store = Arc::new(MemoryStore::new());
        let (batch, _) = store
            .create_batch_with_jobs(batch_spec(2, 4, 5))
            .await
            .unwrap();

        let (processor, blobs) = processor(store.clone(), MockImageGenerator::new(), 2);

        for _ in 0..2 {
            let job = store.claim_next("w1").await.unwrap().unwrap();
            let outcome = processor.process_job(job).await.unwrap();
            assert!(matches!(outcome, JobOutcome::Completed { photos: 4 }));
        }

        let batch = store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.batch_status(), BatchStatus::Completed);
        assert_eq!(batch.total_images_generated, 8);
        assert_eq!(store.photos_for_batch(batch.id).await.unwrap().len(), 8);
        assert_eq!(blobs.uploads().await.len(), 8);
    }

    #[tokio::test]
    async fn test_quota_exhausted_fails_on_first_attempt() {
        let store = Arc::new(MemoryStore::new());
        let (batch, jobs) = store
            .create_batch_with_jobs(batch_spec(1, 4, 5))
            .await
            .unwrap();

        let generator =
            MockImageGenerator::with_outcomes(vec![Err(GenApiError::QuotaExhausted)]);
        let (processor, _) = processor(store.clone(), generator, 1);

        let job = store.claim_next("w1").await.unwrap().unwrap();
        let outcome = processor.process_job(job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed));

        let job = store.find_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Failed);
        // Fast failure: one attempt, not the full ceiling
        assert_eq!(job.attempts, 1);

        let batch = store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.batch_status(), BatchStatus::Failed);
        assert_eq!(batch.total_images_generated, 0);
    }

    #[tokio::test]
    async fn test_partial_image_failure_still_completes() {
        let store = Arc::new(MemoryStore::new());
        let (batch, jobs) = store
            .create_batch_with_jobs(batch_spec(1, 4, 5))
            .await
            .unwrap();

        let generator = MockImageGenerator::with_outcomes(vec![
            Err(GenApiError::CapabilityMismatch {
                message: "text".to_string(),
            }),
            ok_image(),
            Err(GenApiError::InvalidResponse {
                message: "empty".to_string(),
            }),
            Err(GenApiError::Upstream {
                message: "503".to_string(),
            }),
        ]);
        let (processor, _) = processor(store.clone(), generator, 1);

        let job = store.claim_next("w1").await.unwrap().unwrap();
        let outcome = processor.process_job(job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { photos: 1 }));

        let job = store.find_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Completed);

        let batch = store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.batch_status(), BatchStatus::Completed);
        assert_eq!(batch.total_images_generated, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_parks_job_for_retry() {
        let store = Arc::new(MemoryStore::new());
        let (batch, jobs) = store
            .create_batch_with_jobs(batch_spec(1, 4, 5))
            .await
            .unwrap();

        let generator = MockImageGenerator::with_outcomes(vec![Err(GenApiError::RateLimited {
            retry_after: Duration::from_secs(17),
        })]);
        let (processor, _) = processor(store.clone(), generator, 1);

        let job = store.claim_next("w1").await.unwrap().unwrap();
        let outcome = processor.process_job(job).await.unwrap();

        let retry_at = match outcome {
            JobOutcome::RateLimited { retry_at } => retry_at,
            other => panic!("expected RateLimited, got {:?}", other),
        };
        assert!(retry_at > Utc::now());

        let job = store.find_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::RateLimited);
        assert!(job.retry_at.is_some());
        assert_eq!(job.attempts, 1);

        // Batch is still open; the job will come back
        let batch = store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.batch_status(), BatchStatus::Generating);

        // Once eligible again, the retry completes the job
        store
            .mark_rate_limited(job.id, Utc::now() - chrono::Duration::seconds(1), "429")
            .await
            .unwrap();
        let job = store.claim_next("w2").await.unwrap().unwrap();
        let outcome = processor.process_job(job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { photos: 4 }));
    }

    #[tokio::test]
    async fn test_rate_limit_respects_attempt_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let (_, jobs) = store
            .create_batch_with_jobs(batch_spec(1, 1, 2))
            .await
            .unwrap();
        let job_id = jobs[0].id;

        let rate_limited = || {
            MockImageGenerator::with_outcomes(vec![
                Err(GenApiError::RateLimited {
                    retry_after: Duration::from_secs(1),
                }),
                Err(GenApiError::RateLimited {
                    retry_after: Duration::from_secs(1),
                }),
            ])
        };

        // Attempt 1 of 2: parked
        let (processor1, _) = processor(store.clone(), rate_limited(), 1);
        let job = store.claim_next("w1").await.unwrap().unwrap();
        assert!(matches!(
            processor1.process_job(job).await.unwrap(),
            JobOutcome::RateLimited { .. }
        ));

        // Attempt 2 of 2: ceiling reached, job fails terminally
        store
            .mark_rate_limited(job_id, Utc::now() - chrono::Duration::seconds(1), "429")
            .await
            .unwrap();
        let (processor2, _) = processor(store.clone(), rate_limited(), 1);
        let job = store.claim_next("w1").await.unwrap().unwrap();
        assert!(matches!(
            processor2.process_job(job).await.unwrap(),
            JobOutcome::Failed
        ));

        let job = store.find_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Failed);
        assert_eq!(job.attempts, job.max_attempts);
    }

    #[tokio::test]
    async fn test_unresolvable_inputs_fail_without_attempt() {
        let store = Arc::new(MemoryStore::new());
        let (batch, jobs) = store
            .create_batch_with_jobs(batch_spec(1, 4, 5))
            .await
            .unwrap();

        let blobs = Arc::new(MemoryBlobStore::new());
        let processor = JobProcessor::new(
            store.clone(),
            Arc::new(MockImageGenerator::new()),
            blobs,
            Arc::new(StaticImageFetcher::new()), // no fixtures: nothing resolves
            test_config(),
        );

        let job = store.claim_next("w1").await.unwrap().unwrap();
        let outcome = processor.process_job(job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed));

        let job = store.find_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Failed);
        // No attempt was consumed against the remote API
        assert_eq!(job.attempts, 0);

        let batch = store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.batch_status(), BatchStatus::Failed);
    }

    #[tokio::test]
    async fn test_crash_recovery_via_stale_lock_reclaim() {
        let store = Arc::new(MemoryStore::new());
        let (batch, _) = store
            .create_batch_with_jobs(batch_spec(1, 2, 5))
            .await
            .unwrap();

        // First worker claims and then "crashes": never touches the job again
        store.claim_next("crashed-worker").await.unwrap().unwrap();

        // Second claim cycle: reclaim, then claim and finish normally
        assert_eq!(store.reclaim_stale_locks(Duration::ZERO).await.unwrap(), 1);

        let (processor, _) = processor(store.clone(), MockImageGenerator::new(), 1);
        let job = store.claim_next("live-worker").await.unwrap().unwrap();
        assert_eq!(job.locked_by.as_deref(), Some("live-worker"));

        let outcome = processor.process_job(job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { photos: 2 }));

        let batch = store.find_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.batch_status(), BatchStatus::Completed);
        assert_eq!(batch.total_images_generated, 2);
    }

    #[tokio::test]
    async fn test_photo_rows_carry_provenance() {
        let store = Arc::new(MemoryStore::new());
        let (batch, _) = store
            .create_batch_with_jobs(batch_spec(1, 1, 5))
            .await
            .unwrap();

        let (processor, _) = processor(store.clone(), MockImageGenerator::new(), 1);
        let job = store.claim_next("w1").await.unwrap().unwrap();
        let expected_prompt = build_prompt(&job);
        processor.process_job(job).await.unwrap();

        let photos = store.photos_for_batch(batch.id).await.unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].prompt, expected_prompt);
        assert_eq!(photos[0].credits_used, 1);
        assert_eq!(photos[0].aspect_ratio, "1:1");
        assert!(photos[0].url.contains(&batch.user_id.to_string()));
    }

    #[tokio::test]
    async fn test_build_prompt_composition() {
        let store = MemoryStore::new();
        let (_, jobs) = store
            .create_batch_with_jobs(batch_spec(1, 1, 5))
            .await
            .unwrap();

        let prompt = build_prompt(&jobs[0]);
        assert!(prompt.starts_with("professional studio portrait"));
        assert!(prompt.contains("same person as the reference"));
        assert!(prompt.contains("without glasses"));
        assert!(prompt.contains("brown hair"));
        assert!(prompt.contains("background: office"));
        assert!(prompt.contains("style: corporate"));
    }
}
