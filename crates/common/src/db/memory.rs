//! In-memory store
//!
//! Same contract as `PgStore`, backed by a single mutex. Used by tests and
//! by local development without a Postgres instance (storage/generation
//! providers have the same kind of switch). The mutex gives the claim path
//! the same winner-takes-all behavior that `FOR UPDATE SKIP LOCKED`
//! provides in Postgres.

use crate::db::models::*;
use crate::db::store::{BatchSpec, PhotoSpec, Store};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    batches: HashMap<Uuid, Batch>,
    jobs: HashMap<Uuid, Job>,
    /// Claim order: insertion order doubles as creation order
    job_order: Vec<Uuid>,
    photos: Vec<Photo>,
}

/// In-memory implementation of [`Store`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn json_array(values: &[String]) -> serde_json::Value {
    serde_json::Value::Array(
        values
            .iter()
            .map(|v| serde_json::Value::String(v.clone()))
            .collect(),
    )
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_batch_with_jobs(&self, spec: BatchSpec) -> Result<(Batch, Vec<Job>)> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let batch_id = Uuid::new_v4();
        let job_count = spec.reference_image_urls.len() as i32;

        let batch = Batch {
            id: batch_id,
            user_id: spec.user_id,
            model_id: spec.model_id,
            aspect_ratio: spec.aspect_ratio.clone(),
            glasses: spec.glasses.clone(),
            hair_color: spec.hair_color.clone(),
            hair_style: spec.hair_style.clone(),
            backgrounds: json_array(&spec.backgrounds),
            styles: json_array(&spec.styles),
            num_images: spec.num_images,
            total_images_generated: 0,
            credits_used: job_count * spec.num_images,
            status: String::from(BatchStatus::Generating),
            idempotency_key: spec.idempotency_key.clone(),
            created_at: now.into(),
            completed_at: None,
        };

        inner.batches.insert(batch_id, batch.clone());

        let mut jobs = Vec::with_capacity(spec.reference_image_urls.len());
        for reference_image_url in &spec.reference_image_urls {
            let job = Job {
                id: Uuid::new_v4(),
                batch_id,
                user_id: spec.user_id,
                model_id: spec.model_id,
                reference_image_url: reference_image_url.clone(),
                reference_image_prompt: spec.reference_image_prompt.clone(),
                training_image_urls: json_array(&spec.training_image_urls),
                base_prompt: spec.base_prompt.clone(),
                aspect_ratio: spec.aspect_ratio.clone(),
                num_images: spec.num_images,
                glasses: spec.glasses.clone(),
                hair_color: spec.hair_color.clone(),
                hair_style: spec.hair_style.clone(),
                backgrounds: json_array(&spec.backgrounds),
                styles: json_array(&spec.styles),
                status: String::from(JobStatus::Pending),
                attempts: 0,
                max_attempts: spec.max_attempts,
                retry_at: None,
                locked_by: None,
                locked_at: None,
                error_message: None,
                created_at: now.into(),
                processed_at: None,
                completed_at: None,
            };

            inner.job_order.push(job.id);
            inner.jobs.insert(job.id, job.clone());
            jobs.push(job);
        }

        Ok((batch, jobs))
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let eligible = inner.job_order.iter().copied().find(|id| {
            inner
                .jobs
                .get(id)
                .map(|job| match job.job_status() {
                    JobStatus::Pending => true,
                    JobStatus::RateLimited => job
                        .retry_at
                        .map(|at| at <= now)
                        .unwrap_or(false),
                    _ => false,
                })
                .unwrap_or(false)
        });

        let Some(id) = eligible else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).expect("job present in order list");
        job.status = String::from(JobStatus::Processing);
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now.into());
        job.processed_at = Some(now.into());

        Ok(Some(job.clone()))
    }

    async fn reclaim_stale_locks(&self, lock_timeout: Duration) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(lock_timeout).map_err(|e| AppError::Internal {
                message: format!("Invalid lock timeout: {}", e),
            })?;

        let mut reclaimed = 0;
        for job in inner.jobs.values_mut() {
            if job.job_status() == JobStatus::Processing
                && job.locked_at.map(|at| at < cutoff).unwrap_or(true)
            {
                job.status = String::from(JobStatus::Pending);
                job.locked_by = None;
                job.locked_at = None;
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }

    async fn increment_attempt(&self, id: Uuid) -> Result<i32> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })?;

        if !job.is_terminal() {
            job.attempts += 1;
        }

        Ok(job.attempts)
    }

    async fn mark_completed(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            if !job.is_terminal() {
                job.status = String::from(JobStatus::Completed);
                job.completed_at = Some(Utc::now().into());
                job.retry_at = None;
                job.locked_by = None;
                job.locked_at = None;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            if !job.is_terminal() {
                job.status = String::from(JobStatus::Failed);
                job.completed_at = Some(Utc::now().into());
                job.error_message = Some(error_message.to_string());
                job.retry_at = None;
                job.locked_by = None;
                job.locked_at = None;
            }
        }
        Ok(())
    }

    async fn mark_rate_limited(
        &self,
        id: Uuid,
        retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            if !job.is_terminal() {
                job.status = String::from(JobStatus::RateLimited);
                job.retry_at = Some(retry_at.into());
                job.error_message = Some(error_message.to_string());
                job.locked_by = None;
                job.locked_at = None;
            }
        }
        Ok(())
    }

    async fn create_photo(&self, spec: PhotoSpec) -> Result<Photo> {
        let mut inner = self.inner.lock().await;
        let photo = Photo {
            id: Uuid::new_v4(),
            user_id: spec.user_id,
            model_id: spec.model_id,
            generation_batch_id: spec.generation_batch_id,
            url: spec.url,
            status: "completed".to_string(),
            credits_used: 1,
            aspect_ratio: spec.aspect_ratio,
            glasses: spec.glasses,
            hair_color: spec.hair_color,
            hair_style: spec.hair_style,
            backgrounds: json_array(&spec.backgrounds),
            styles: json_array(&spec.styles),
            prompt: spec.prompt,
            created_at: Utc::now().into(),
        };

        inner.photos.push(photo.clone());
        Ok(photo)
    }

    async fn count_photos_for_batch(&self, batch_id: Uuid) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .photos
            .iter()
            .filter(|p| p.generation_batch_id == batch_id)
            .count() as i64)
    }

    async fn photos_for_batch(&self, batch_id: Uuid) -> Result<Vec<Photo>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .photos
            .iter()
            .filter(|p| p.generation_batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn finalize_batch(&self, batch_id: Uuid) -> Result<Batch> {
        let mut inner = self.inner.lock().await;

        let job_statuses: Vec<JobStatus> = inner
            .jobs
            .values()
            .filter(|j| j.batch_id == batch_id)
            .map(|j| j.job_status())
            .collect();

        let photo_count = inner
            .photos
            .iter()
            .filter(|p| p.generation_batch_id == batch_id)
            .count() as i32;

        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| AppError::BatchNotFound {
                id: batch_id.to_string(),
            })?;

        if batch.is_terminal() {
            return Ok(batch.clone());
        }

        let derived = derive_status(&job_statuses);
        if derived.is_terminal() {
            batch.status = String::from(derived);
            batch.total_images_generated = photo_count;
            batch.completed_at = Some(Utc::now().into());
        }

        Ok(batch.clone())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        let inner = self.inner.lock().await;
        Ok(inner.batches.get(&id).cloned())
    }

    async fn find_batch_by_idempotency_key(
        &self,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<Batch>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .batches
            .values()
            .find(|b| b.user_id == user_id && b.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn spec(reference_count: usize, num_images: i32) -> BatchSpec {
        BatchSpec {
            user_id: Uuid::new_v4(),
            model_id: Uuid::new_v4(),
            reference_image_urls: (0..reference_count)
                .map(|i| format!("https://cdn.example.com/ref-{}.png", i))
                .collect(),
            reference_image_prompt: None,
            training_image_urls: vec!["https://cdn.example.com/train-0.png".to_string()],
            base_prompt: "studio portrait".to_string(),
            aspect_ratio: "1:1".to_string(),
            num_images,
            glasses: "no".to_string(),
            hair_color: None,
            hair_style: None,
            backgrounds: vec!["office".to_string()],
            styles: vec![],
            max_attempts: 5,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_batch_created_before_jobs() {
        let store = MemoryStore::new();
        let (batch, jobs) = store.create_batch_with_jobs(spec(3, 4)).await.unwrap();

        assert_eq!(jobs.len(), 3);
        assert_eq!(batch.batch_status(), BatchStatus::Generating);
        assert_eq!(batch.credits_used, 12);
        for job in &jobs {
            assert_eq!(job.batch_id, batch.id);
            assert_eq!(job.job_status(), JobStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        store.create_batch_with_jobs(spec(1, 1)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_next(&format!("worker-{}", i)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1, "exactly one worker should win the claim");
    }

    #[tokio::test]
    async fn test_claim_fifo_order() {
        let store = MemoryStore::new();
        let (_, first) = store.create_batch_with_jobs(spec(1, 1)).await.unwrap();
        let (_, second) = store.create_batch_with_jobs(spec(1, 1)).await.unwrap();

        let claimed = store.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, first[0].id);

        let claimed = store.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, second[0].id);

        assert!(store.claim_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_sets_lock_fields() {
        let store = MemoryStore::new();
        store.create_batch_with_jobs(spec(1, 1)).await.unwrap();

        let job = store.claim_next("worker-a").await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Processing);
        assert_eq!(job.locked_by.as_deref(), Some("worker-a"));
        assert!(job.locked_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_lock_reclaim() {
        let store = MemoryStore::new();
        store.create_batch_with_jobs(spec(1, 1)).await.unwrap();

        let job = store.claim_next("crashed-worker").await.unwrap().unwrap();

        // Zero timeout: any held lock counts as stale
        let reclaimed = store.reclaim_stale_locks(Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed, 1);

        let job = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Pending);
        assert!(job.locked_by.is_none());
        assert!(job.locked_at.is_none());

        // Reclaimed job is claimable again
        assert!(store.claim_next("other-worker").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fresh_lock_not_reclaimed() {
        let store = MemoryStore::new();
        store.create_batch_with_jobs(spec(1, 1)).await.unwrap();
        store.claim_next("live-worker").await.unwrap().unwrap();

        let reclaimed = store
            .reclaim_stale_locks(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_eligible_after_retry_at() {
        let store = MemoryStore::new();
        let (_, jobs) = store.create_batch_with_jobs(spec(1, 1)).await.unwrap();
        let job_id = jobs[0].id;

        store.claim_next("w1").await.unwrap().unwrap();
        store
            .mark_rate_limited(job_id, Utc::now() + chrono::Duration::hours(1), "429")
            .await
            .unwrap();

        // Not eligible while retry_at is in the future
        assert!(store.claim_next("w1").await.unwrap().is_none());

        store
            .mark_rate_limited(job_id, Utc::now() - chrono::Duration::seconds(1), "429")
            .await
            .unwrap();
        assert!(store.claim_next("w1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminal_states_never_revert() {
        let store = MemoryStore::new();
        let (_, jobs) = store.create_batch_with_jobs(spec(1, 1)).await.unwrap();
        let job_id = jobs[0].id;

        store.mark_completed(job_id).await.unwrap();
        store.mark_failed(job_id, "late failure").await.unwrap();
        store
            .mark_rate_limited(job_id, Utc::now(), "late 429")
            .await
            .unwrap();

        let job = store.find_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Completed);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn test_increment_attempt_stops_at_terminal() {
        let store = MemoryStore::new();
        let (_, jobs) = store.create_batch_with_jobs(spec(1, 1)).await.unwrap();
        let job_id = jobs[0].id;

        assert_eq!(store.increment_attempt(job_id).await.unwrap(), 1);
        assert_eq!(store.increment_attempt(job_id).await.unwrap(), 2);

        store.mark_failed(job_id, "done").await.unwrap();
        assert_eq!(store.increment_attempt(job_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_finalize_batch_waits_for_all_jobs() {
        let store = MemoryStore::new();
        let (batch, jobs) = store.create_batch_with_jobs(spec(2, 1)).await.unwrap();

        store.mark_completed(jobs[0].id).await.unwrap();
        let batch_state = store.finalize_batch(batch.id).await.unwrap();
        assert_eq!(batch_state.batch_status(), BatchStatus::Generating);

        store.mark_failed(jobs[1].id, "boom").await.unwrap();
        let batch_state = store.finalize_batch(batch.id).await.unwrap();
        assert_eq!(batch_state.batch_status(), BatchStatus::Completed);
        assert!(batch_state.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_finalize_batch_idempotent() {
        let store = MemoryStore::new();
        let (batch, jobs) = store.create_batch_with_jobs(spec(1, 1)).await.unwrap();
        store.mark_failed(jobs[0].id, "boom").await.unwrap();

        let first = store.finalize_batch(batch.id).await.unwrap();
        assert_eq!(first.batch_status(), BatchStatus::Failed);

        let second = store.finalize_batch(batch.id).await.unwrap();
        assert_eq!(second.batch_status(), BatchStatus::Failed);
        assert_eq!(second.completed_at, first.completed_at);
    }

    #[tokio::test]
    async fn test_total_images_counts_photos_not_requested() {
        let store = MemoryStore::new();
        let (batch, jobs) = store.create_batch_with_jobs(spec(1, 4)).await.unwrap();

        // Only one of the four requested images actually landed
        store
            .create_photo(PhotoSpec {
                user_id: batch.user_id,
                model_id: batch.model_id,
                generation_batch_id: batch.id,
                url: "https://cdn.example.com/u/1-0.png".to_string(),
                aspect_ratio: "1:1".to_string(),
                glasses: "no".to_string(),
                hair_color: None,
                hair_style: None,
                backgrounds: vec![],
                styles: vec![],
                prompt: "studio portrait".to_string(),
            })
            .await
            .unwrap();

        store.mark_completed(jobs[0].id).await.unwrap();
        let batch_state = store.finalize_batch(batch.id).await.unwrap();

        assert_eq!(batch_state.batch_status(), BatchStatus::Completed);
        assert_eq!(batch_state.total_images_generated, 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_lookup() {
        let store = MemoryStore::new();
        let mut s = spec(1, 1);
        s.idempotency_key = Some("req-123".to_string());
        let user_id = s.user_id;
        let (batch, _) = store.create_batch_with_jobs(s).await.unwrap();

        let found = store
            .find_batch_by_idempotency_key(user_id, "req-123")
            .await
            .unwrap();
        assert_eq!(found.map(|b| b.id), Some(batch.id));

        assert!(store
            .find_batch_by_idempotency_key(Uuid::new_v4(), "req-123")
            .await
            .unwrap()
            .is_none());
    }
}
